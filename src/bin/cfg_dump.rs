//! Dumps the nodes and edges of control-flow graph description files, so a
//! freshly exported graph can be sanity-checked before a monitored run.

use std::path::PathBuf;

use cfimon::cfg_rt::{CfgGraph, CfgNode};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "cfg_dump",
    about,
    long_about = "Parses CFG description files and prints their nodes and edges"
)]
pub struct Opt {
    #[arg(help = "CFG description files to read", required = true)]
    pub inputs: Vec<PathBuf>,
}

fn dump_node(node: &CfgNode) {
    let mut edges: Vec<String> = node
        .offset_edges()
        .map(|offset| format!("O:{offset:x}"))
        .collect();
    edges.sort();
    edges.extend(node.symbol_edges().iter().map(ToString::to_string));

    println!("{:x} {}", node.offset(), edges.join(","));
}

fn main() {
    env_logger::init();
    let opts = Opt::parse();

    for input in opts.inputs {
        let Ok(graph) = CfgGraph::from_file(&input)
            .map_err(|err| eprintln!("Ignored CFG file {input:?}, reason: {err}"))
        else {
            continue;
        };

        println!("# {} nodes in {input:?}:", graph.len());

        let mut nodes: Vec<&CfgNode> = graph.nodes().collect();
        nodes.sort_by_key(|node| node.offset());
        for node in nodes {
            dump_node(node);
        }

        println!();
    }
}
