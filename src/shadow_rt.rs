//! The per-thread shadow call stack.
//!
//! Every observed call pushes a [`CallRecord`] holding the stack-pointer
//! value and return address the matching return is expected to produce.
//! Returns are validated by stack-pointer matching rather than call depth:
//! records whose expected stack pointer lies below the current one belong
//! to frames that were abandoned without returning (`longjmp`, tail-call
//! elision) and are discarded, while a matched record whose return address
//! differs from the actual branch target is exactly what an overwritten
//! on-stack return address produces.

use serde::{Deserialize, Serialize};

use crate::GuestAddr;

/// Expected-return record for one observed call.
///
/// Owned exclusively by the shadow stack of the thread that executed the
/// call; consumed by the matching return or discarded while unwinding past
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Address of the call instruction
    pub call_site: GuestAddr,
    /// Stack pointer expected when the matching return executes
    pub expected_sp: GuestAddr,
    /// Address the matching return must branch to
    pub expected_return_address: GuestAddr,
}

/// Outcome of validating one return against the shadow stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCheck {
    /// The shadow stack ran out before any record matched; logged, never
    /// fatal
    EmptyCallStack,
    /// The stack grew beyond every recorded call, so this return was never
    /// tracked; the top record is left in place and the check is skipped
    SpNotFound,
    /// The return branched to the recorded address. `long_jump` is set when
    /// one or more abandoned frames were unwound on the way to the match.
    Success {
        /// One or more call frames were discarded without returning
        long_jump: bool,
    },
    /// The return branched somewhere other than the recorded address: an
    /// overwritten return address. The matched record is pushed back so the
    /// forensic trace still contains it.
    Mismatch {
        /// The return address the call actually pushed
        expected: GuestAddr,
    },
}

/// Ordered stack of [`CallRecord`]s, most recent call on top.
///
/// Stack-pointer values strictly decrease from the bottom of the stack to
/// the top, since the machine stack grows toward lower addresses as calls
/// nest.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ShadowCallStack {
    records: Vec<CallRecord>,
}

impl ShadowCallStack {
    /// Create an empty shadow stack
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed call
    pub fn push(&mut self, record: CallRecord) {
        log::trace!(
            "call @ 0x{:x}: expecting return to 0x{:x} with SP=0x{:x}",
            record.call_site,
            record.expected_return_address,
            record.expected_sp
        );
        self.records.push(record);
    }

    /// Validate a return executing with `current_sp` and branching to
    /// `target`.
    ///
    /// Pops every record whose expected stack pointer lies below
    /// `current_sp` (abandoned frames), then matches the first record whose
    /// expected stack pointer equals `current_sp` against `target`.
    pub fn check_return(&mut self, current_sp: GuestAddr, target: GuestAddr) -> ReturnCheck {
        let mut long_jump = false;
        loop {
            let Some(record) = self.records.pop() else {
                return ReturnCheck::EmptyCallStack;
            };

            if record.expected_sp > current_sp {
                // Remaining records belong to outer frames that have not
                // returned yet; this return was never pushed.
                self.records.push(record);
                return ReturnCheck::SpNotFound;
            }

            if record.expected_sp < current_sp {
                // Frame abandoned without a matching return.
                long_jump = true;
                continue;
            }

            if record.expected_return_address == target {
                return ReturnCheck::Success { long_jump };
            }
            self.records.push(record);
            return ReturnCheck::Mismatch {
                expected: record.expected_return_address,
            };
        }
    }

    /// Number of live records
    #[must_use]
    pub fn depth(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no call is currently tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The live records, most recent call first
    pub fn records(&self) -> impl Iterator<Item = &CallRecord> {
        self.records.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::{CallRecord, ReturnCheck, ShadowCallStack};
    use crate::GuestAddr;

    fn record(sp: GuestAddr, ret: GuestAddr) -> CallRecord {
        CallRecord {
            call_site: ret - 5,
            expected_sp: sp,
            expected_return_address: ret,
        }
    }

    #[test]
    fn test_balanced_call_return() {
        let mut stack = ShadowCallStack::new();
        stack.push(record(0x100, 0x400123));

        assert_eq!(
            stack.check_return(0x100, 0x400123),
            ReturnCheck::Success { long_jump: false }
        );
        assert!(stack.is_empty());
    }

    #[test]
    fn test_tampered_return_address() {
        let mut stack = ShadowCallStack::new();
        stack.push(record(0x100, 0x400123));

        assert_eq!(
            stack.check_return(0x100, 0xbad),
            ReturnCheck::Mismatch { expected: 0x400123 }
        );
        // the matched record stays available for the forensic trace
        assert_eq!(stack.depth(), 1);
        assert_eq!(
            stack.records().next().unwrap().expected_return_address,
            0x400123
        );
    }

    #[test]
    fn test_long_jump_unwind() {
        let mut stack = ShadowCallStack::new();
        stack.push(record(100, 0xa));
        stack.push(record(90, 0xb));
        stack.push(record(80, 0xc));

        assert_eq!(
            stack.check_return(100, 0xa),
            ReturnCheck::Success { long_jump: true }
        );
        assert!(stack.is_empty());
    }

    #[test]
    fn test_empty_call_stack() {
        let mut stack = ShadowCallStack::new();
        assert_eq!(stack.check_return(0x100, 0xa), ReturnCheck::EmptyCallStack);

        // discarding all records on the way also ends up empty
        stack.push(record(80, 0xc));
        stack.push(record(70, 0xd));
        assert_eq!(stack.check_return(0x100, 0xa), ReturnCheck::EmptyCallStack);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_sp_not_found_keeps_stack() {
        let mut stack = ShadowCallStack::new();
        stack.push(record(0x100, 0xa));
        stack.push(record(0x90, 0xb));

        // current SP below every record: nothing may be consumed
        assert_eq!(stack.check_return(0x80, 0xdead), ReturnCheck::SpNotFound);
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.records().next().unwrap().expected_sp, 0x90);
    }

    #[test]
    fn test_nested_returns_in_order() {
        let mut stack = ShadowCallStack::new();
        for (sp, ret) in [(0x100, 0x11), (0xf8, 0x12), (0xf0, 0x13)] {
            stack.push(record(sp, ret));
        }

        assert_eq!(
            stack.check_return(0xf0, 0x13),
            ReturnCheck::Success { long_jump: false }
        );
        assert_eq!(
            stack.check_return(0xf8, 0x12),
            ReturnCheck::Success { long_jump: false }
        );
        assert_eq!(
            stack.check_return(0x100, 0x11),
            ReturnCheck::Success { long_jump: false }
        );
        assert!(stack.is_empty());
    }

    #[test]
    fn test_records_iterate_most_recent_first() {
        let mut stack = ShadowCallStack::new();
        stack.push(record(0x100, 0x11));
        stack.push(record(0xf8, 0x12));

        let returns: Vec<GuestAddr> = stack
            .records()
            .map(|r| r.expected_return_address)
            .collect();
        assert_eq!(returns, vec![0x12, 0x11]);
    }
}
