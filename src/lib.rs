/*!
`cfimon` is a runtime integrity monitor for native processes.

It detects control-flow hijacking (overwritten return addresses, ROP chains,
illegal indirect calls and jumps) and heap corruption (double free, free of
unallocated memory) while the target runs. Three verification engines do the
work: a per-thread [`shadow_rt::ShadowCallStack`] that validates every
return, a process-wide [`heap_rt::HeapTracker`] that validates every free
and realloc, and a [`cfg_rt::CfgRuntime`] that checks indirect branches
against a precomputed control-flow graph.

Hooking into executing code, decoding instructions, walking module tables
and resolving debug symbols are the job of an external instrumentation
engine, consumed through the [`engine::InstrumentationEngine`] trait. The
engine feeds events into a [`monitor::ControlFlowMonitor`], which dispatches
to the verification engines and converts fatal results into diagnostics and
a process abort.
*/
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::must_use_candidate
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
))]

/// The static control-flow graph and the indirect-branch validator
pub mod cfg_rt;

/// The collaborator interface consumed by the monitor
pub mod engine;

/// The heap liveness tracker
pub mod heap_rt;

/// The event dispatcher tying the verification engines together
pub mod monitor;

/// The per-thread shadow call stack
pub mod shadow_rt;

/// Module registry and address symbolication
pub mod symbols;

/// Per-thread context lifecycle
pub mod thread;

/// Violation records and stderr reporting
pub mod violations;

use core::{
    fmt::{self, Display},
    num::ParseIntError,
};
use std::{io, path::PathBuf};

use backtrace::Backtrace;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// An address (or stack-pointer value) inside the monitored target process.
pub type GuestAddr = u64;

/// Backtrace type attached to [`Error`] variants at construction time.
pub type ErrorBacktrace = Backtrace;

/// Main error struct for `cfimon`
#[derive(Debug)]
pub enum Error {
    /// Malformed input, most prominently a bad CFG description file
    Parse(String, ErrorBacktrace),
    /// File related error
    File(io::Error, ErrorBacktrace),
    /// Key not in Map
    KeyNotFound(String, ErrorBacktrace),
    /// You're holding it wrong
    IllegalState(String, ErrorBacktrace),
    /// Something else happened
    Unknown(String, ErrorBacktrace),
}

impl Error {
    /// Malformed input
    #[must_use]
    pub fn parse<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Parse(arg.into(), ErrorBacktrace::new_unresolved())
    }

    /// File related error
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg, ErrorBacktrace::new_unresolved())
    }

    /// Key not in Map
    #[must_use]
    pub fn key_not_found<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::KeyNotFound(arg.into(), ErrorBacktrace::new_unresolved())
    }

    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into(), ErrorBacktrace::new_unresolved())
    }

    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into(), ErrorBacktrace::new_unresolved())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Parse(s, _) => write!(f, "Invalid input: `{s}`"),
            Self::File(err, _) => write!(f, "File IO failed: `{err:?}`"),
            Self::KeyNotFound(s, _) => write!(f, "Key `{s}` not found"),
            Self::IllegalState(s, _) => write!(f, "Illegal state: `{s}`"),
            Self::Unknown(s, _) => write!(f, "Unknown error: `{s}`"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::file(err)
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::parse(format!("failed to parse integer: {err:?}"))
    }
}

/// Top-level container for the monitor's cli options/arguments
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(arg_required_else_help(true))]
pub struct MonitorOptions {
    /// Path to the control-flow graph description file
    #[arg(value_name = "CFG_FILE")]
    pub cfg: PathBuf,

    /// Module to treat as the instrumented application.
    /// Defaults to the first module the engine reports as loaded.
    #[arg(long, help_heading = "Cfg Options")]
    pub app_module: Option<String>,

    /// Match symbol edges by substring containment instead of exact name
    #[arg(long, help_heading = "Cfg Options")]
    pub symbol_substring_match: bool,

    /// Gather allocation-site backtraces for tracked heap allocations
    #[arg(long, help_heading = "Heap Options")]
    pub allocation_backtraces: bool,

    /// Log violations instead of aborting the process (triage aid)
    #[arg(long)]
    pub continue_on_violation: bool,

    /// Whether or not to print debug info
    #[arg(short, long)]
    pub verbose: bool,
}

impl MonitorOptions {
    /// Options pointing at `cfg`, everything else at its default.
    #[must_use]
    pub fn with_cfg<P>(cfg: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            cfg: cfg.into(),
            app_module: None,
            symbol_substring_match: false,
            allocation_backtraces: false,
            continue_on_violation: false,
            verbose: false,
        }
    }
}
