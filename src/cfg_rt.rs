//! The static control-flow graph and the indirect-branch validator.
//!
//! The graph is built once at startup from a text description and never
//! mutated afterwards. Every line describes one call/jump site by its
//! module-relative offset together with the set of permitted outgoing
//! edges:
//!
//! ```text
//! 1000 O:2000,S:foo,S:libc.so::malloc
//! ```
//!
//! `O:` edges name a permitted same-module target by raw offset, `S:` edges
//! a permitted cross-module target by symbol name, optionally qualified
//! with the target library. Leading/trailing whitespace is trimmed and
//! blank lines are skipped; anything else that does not parse is a fatal
//! startup error.

use std::{fs, path::Path};

use hashbrown::{HashMap, HashSet};

use crate::{symbols::SymbolInfo, Error, GuestAddr};

/// A permitted cross-module branch target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CfgSymbolEdge {
    name: String,
    library: Option<String>,
}

impl CfgSymbolEdge {
    /// An edge to `name` in any library
    #[must_use]
    pub fn unqualified<S>(name: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            name: name.into(),
            library: None,
        }
    }

    /// An edge to `name` in `library`
    #[must_use]
    pub fn qualified<S, L>(name: S, library: L) -> Self
    where
        S: Into<String>,
        L: Into<String>,
    {
        Self {
            name: name.into(),
            library: Some(library.into()),
        }
    }

    /// The symbol name this edge permits
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The library this edge is constrained to, if any
    #[must_use]
    pub fn library(&self) -> Option<&str> {
        self.library.as_deref()
    }

    fn matches(&self, symbol: &str, library: &str, substring: bool) -> bool {
        if let Some(wanted) = &self.library {
            if wanted != library {
                return false;
            }
        }
        if substring {
            symbol.contains(&self.name)
        } else {
            symbol == self.name
        }
    }
}

impl core::fmt::Display for CfgSymbolEdge {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match &self.library {
            Some(library) => write!(f, "S:{}::{}", library, self.name),
            None => write!(f, "S:{}", self.name),
        }
    }
}

/// One call/jump site of the graph and its permitted outgoing edges.
#[derive(Debug, Clone, Default)]
pub struct CfgNode {
    offset: GuestAddr,
    offset_edges: HashSet<GuestAddr>,
    symbol_edges: Vec<CfgSymbolEdge>,
}

impl CfgNode {
    /// Create a node for the site at `offset` with no edges
    #[must_use]
    pub fn new(offset: GuestAddr) -> Self {
        Self {
            offset,
            ..CfgNode::default()
        }
    }

    /// Module-relative offset of this site
    #[must_use]
    pub fn offset(&self) -> GuestAddr {
        self.offset
    }

    /// Permit a same-module target at `offset`
    pub fn add_offset_edge(&mut self, offset: GuestAddr) {
        self.offset_edges.insert(offset);
    }

    /// Permit a cross-module target
    pub fn add_symbol_edge(&mut self, edge: CfgSymbolEdge) {
        if !self.symbol_edges.contains(&edge) {
            self.symbol_edges.push(edge);
        }
    }

    /// Is the same-module target at `offset` permitted?
    #[must_use]
    pub fn has_offset_edge(&self, offset: GuestAddr) -> bool {
        self.offset_edges.contains(&offset)
    }

    /// Is the cross-module target `symbol` in `library` permitted?
    ///
    /// With `substring` set, an edge matches if its recorded name is
    /// contained in the resolved symbol name; library-qualified edges
    /// always require the library to match exactly.
    #[must_use]
    pub fn has_symbol_edge(&self, symbol: &str, library: &str, substring: bool) -> bool {
        self.symbol_edges
            .iter()
            .any(|edge| edge.matches(symbol, library, substring))
    }

    /// The permitted same-module targets
    pub fn offset_edges(&self) -> impl Iterator<Item = GuestAddr> + '_ {
        self.offset_edges.iter().copied()
    }

    /// The permitted cross-module targets
    pub fn symbol_edges(&self) -> &[CfgSymbolEdge] {
        &self.symbol_edges
    }
}

/// The immutable process-wide control-flow graph, keyed by the
/// module-relative offset of each call/jump site.
#[derive(Debug, Default)]
pub struct CfgGraph {
    nodes: HashMap<GuestAddr, CfgNode>,
}

fn parse_hex(text: &str, lineno: usize) -> Result<GuestAddr, Error> {
    GuestAddr::from_str_radix(text.trim().trim_start_matches("0x"), 16)
        .map_err(|err| Error::parse(format!("line {lineno}: bad hex offset {text:?}: {err}")))
}

impl CfgGraph {
    /// Parse a CFG description from `text`.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut nodes: HashMap<GuestAddr, CfgNode> = HashMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let Some((offset_text, edges_text)) = line.split_once(char::is_whitespace) else {
                return Err(Error::parse(format!("line {lineno}: missing edge list")));
            };
            let offset = parse_hex(offset_text, lineno)?;

            let mut node = CfgNode::new(offset);
            for edge in edges_text.trim().split(',') {
                match edge.trim().split_once(':') {
                    Some(("O", target)) => node.add_offset_edge(parse_hex(target, lineno)?),
                    Some(("S", symbol)) => node.add_symbol_edge(match symbol.split_once("::") {
                        Some((library, name)) => CfgSymbolEdge::qualified(name, library),
                        None => CfgSymbolEdge::unqualified(symbol),
                    }),
                    _ => {
                        return Err(Error::parse(format!(
                            "line {lineno}: unknown edge type in {edge:?}"
                        )));
                    }
                }
            }

            if nodes.insert(offset, node).is_some() {
                return Err(Error::parse(format!(
                    "line {lineno}: duplicate node 0x{offset:x}"
                )));
            }
        }
        Ok(Self { nodes })
    }

    /// Read and parse the CFG description at `path`.
    pub fn from_file<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// The node for the site at `offset`, if the graph covers it
    #[must_use]
    pub fn node(&self, offset: GuestAddr) -> Option<&CfgNode> {
        self.nodes.get(&offset)
    }

    /// All nodes, in no particular order
    pub fn nodes(&self) -> impl Iterator<Item = &CfgNode> {
        self.nodes.values()
    }

    /// Number of call/jump sites in the graph
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the graph has no nodes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Outcome of checking one indirect branch against the graph.
///
/// Only [`BranchCheck::EdgeNotFound`] and [`BranchCheck::NotFunctionEntry`]
/// indicate a violation; every other non-`EdgeFound` outcome means the
/// graph has no static knowledge of the branch and the check passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCheck {
    /// No registered module owns the branch instruction
    UnknownModule,
    /// The branch instruction is outside the instrumented application
    DifferentModule,
    /// The graph has no node for the branch site
    NodeNotFound,
    /// No registered module owns the target address
    UnknownTarget,
    /// Cross-module target does not land on a symbol entry point;
    /// consistent with a ROP gadget in the middle of a function
    NotFunctionEntry,
    /// The target is a permitted edge of the branch site
    EdgeFound,
    /// The target is not among the permitted edges of the branch site
    EdgeNotFound,
}

impl BranchCheck {
    /// Does this outcome constitute a control-flow violation?
    #[must_use]
    pub fn is_violation(self) -> bool {
        matches!(self, BranchCheck::NotFunctionEntry | BranchCheck::EdgeNotFound)
    }
}

/// The indirect-branch validator: the parsed [`CfgGraph`] plus the matching
/// policy it is enforced with.
#[derive(Debug)]
pub struct CfgRuntime {
    graph: CfgGraph,
    symbol_substring_match: bool,
}

impl CfgRuntime {
    /// Create a new [`CfgRuntime`] enforcing `graph`
    #[must_use]
    pub fn new(graph: CfgGraph, symbol_substring_match: bool) -> Self {
        Self {
            graph,
            symbol_substring_match,
        }
    }

    /// The underlying graph
    #[must_use]
    pub fn graph(&self) -> &CfgGraph {
        &self.graph
    }

    /// Check the indirect branch whose instruction resolved to `source` and
    /// whose target resolved to `target` (`None` = no owning module).
    /// `app_module` names the instrumented application's own binary; sites
    /// in other modules are not enforced.
    #[must_use]
    pub fn check_indirect_branch(
        &self,
        app_module: &str,
        source: Option<&SymbolInfo>,
        target: Option<&SymbolInfo>,
    ) -> BranchCheck {
        let Some(source) = source else {
            return BranchCheck::UnknownModule;
        };
        if source.module != app_module {
            return BranchCheck::DifferentModule;
        }
        let Some(node) = self.graph.node(source.module_offset) else {
            return BranchCheck::NodeNotFound;
        };
        let Some(target) = target else {
            return BranchCheck::UnknownTarget;
        };

        if target.module == source.module {
            if node.has_offset_edge(target.module_offset) {
                BranchCheck::EdgeFound
            } else {
                BranchCheck::EdgeNotFound
            }
        } else {
            // A legitimate cross-module transfer lands on a function entry
            // point; anything past it is not a call target.
            if target.symbol_offset != 0 {
                return BranchCheck::NotFunctionEntry;
            }
            if node.has_symbol_edge(&target.symbol, &target.module, self.symbol_substring_match) {
                BranchCheck::EdgeFound
            } else {
                BranchCheck::EdgeNotFound
            }
        }
    }
}
