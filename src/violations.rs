//! Violation records and their stderr reporting.
//!
//! Detection logic only ever returns discriminated results; the dispatcher
//! funnels the fatal ones into a [`Violations`] sink, which prints the
//! diagnostic and answers whether the process should abort. Keeping the
//! sink an ordinary value (instead of printing and aborting inside the
//! verification engines) is what keeps every engine unit-testable.

use std::io::Write;

use serde::{Deserialize, Serialize};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::GuestAddr;

/// One detected integrity violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Violation {
    /// A return branched somewhere other than the address its call pushed
    ReturnMismatch {
        /// Symbolized location of the return instruction
        location: String,
        /// Stack pointer at the return
        sp: GuestAddr,
        /// The return address the call actually pushed
        expected: GuestAddr,
        /// The address the return branched to
        actual: GuestAddr,
    },
    /// An indirect branch took an edge the graph does not permit
    InvalidEdge {
        /// Symbolized branch instruction
        source: String,
        /// Symbolized branch target
        target: String,
    },
    /// An indirect branch landed in the middle of a foreign function
    MidFunctionTarget {
        /// Symbolized branch instruction
        source: String,
        /// Symbolized branch target
        target: String,
    },
    /// `free` of an address with no live allocation
    InvalidFree {
        /// The address passed to `free`
        ptr: GuestAddr,
    },
    /// `realloc` of an address with no live allocation
    InvalidRealloc {
        /// The address passed to `realloc`
        ptr: GuestAddr,
    },
}

impl Violation {
    /// Short human-readable description of the violation kind
    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Violation::ReturnMismatch { .. } => "overwritten return address",
            Violation::InvalidEdge { .. } => "illegal indirect branch target",
            Violation::MidFunctionTarget { .. } => "indirect branch into the middle of a function",
            Violation::InvalidFree { .. } => "invalid or double free",
            Violation::InvalidRealloc { .. } => "realloc of untracked memory",
        }
    }

    fn banner(&self) -> &str {
        match self {
            Violation::ReturnMismatch { .. }
            | Violation::InvalidEdge { .. }
            | Violation::MidFunctionTarget { .. } => " Control-flow violation detected! ",
            Violation::InvalidFree { .. } | Violation::InvalidRealloc { .. } => {
                " Heap violation detected! "
            }
        }
    }
}

/// The violations that occurred during a monitored run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violations {
    continue_on_violation: bool,
    violations: Vec<Violation>,
}

impl Violations {
    /// Creates a new `Violations` sink. With `continue_on_violation` the
    /// sink only records and prints; otherwise every report demands an
    /// abort.
    #[must_use]
    pub const fn new(continue_on_violation: bool) -> Self {
        Self {
            continue_on_violation,
            violations: Vec::new(),
        }
    }

    /// The violations recorded so far
    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Number of recorded violations
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.len()
    }

    /// Returns `true` if no violation occurred
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Clears this `Violations` sink
    pub fn clear(&mut self) {
        self.violations.clear();
    }

    /// Record `violation`, print its diagnostic followed by `call_trace`
    /// (most recent call first), and return `true` if the caller should
    /// abort the process.
    pub fn report(&mut self, violation: Violation, call_trace: &[String]) -> bool {
        let mut output = StandardStream::stderr(ColorChoice::Auto);

        writeln!(output, "{:━^80}", violation.banner()).unwrap();
        output
            .set_color(ColorSpec::new().set_fg(Some(Color::Red)))
            .unwrap();
        write!(output, "{}", violation.description()).unwrap();
        match &violation {
            Violation::ReturnMismatch {
                location,
                sp,
                expected,
                actual,
            } => {
                writeln!(output, " @ {location}").unwrap();
                output.reset().unwrap();
                writeln!(
                    output,
                    "expected return to 0x{expected:x}, actual target 0x{actual:x}, SP=0x{sp:x}"
                )
                .unwrap();
            }
            Violation::InvalidEdge { source, target }
            | Violation::MidFunctionTarget { source, target } => {
                writeln!(output, " @ {source}").unwrap();
                output.reset().unwrap();
                writeln!(output, "branch target: {target}").unwrap();
            }
            Violation::InvalidFree { ptr } | Violation::InvalidRealloc { ptr } => {
                writeln!(output, " of 0x{ptr:016x}").unwrap();
                output.reset().unwrap();
            }
        }

        if call_trace.is_empty() {
            writeln!(output, "no live call records on this thread").unwrap();
        } else {
            writeln!(output, "{:━^80}", " CALL TRACE ").unwrap();
            for (depth, frame) in call_trace.iter().enumerate() {
                writeln!(output, "  #{depth} {frame}").unwrap();
            }
        }
        output.flush().unwrap();

        self.violations.push(violation);

        !self.continue_on_violation
    }
}
