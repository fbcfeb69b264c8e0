//! The interface between the monitor and the instrumentation engine that
//! drives it.
//!
//! The engine (a binary instrumentation framework, an emulator, a debugger
//! stub) owns everything machine-specific: it observes calls, returns,
//! indirect branches and allocator activity in the target and forwards them
//! as events to [`crate::monitor::ControlFlowMonitor`]. In the other
//! direction the monitor issues the queries collected in
//! [`InstrumentationEngine`].

use serde::{Deserialize, Serialize};

use crate::GuestAddr;

/// A module (executable or shared object) loaded into the target process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Preferred name of the module, e.g. `libc.so.6`
    pub name: String,
    /// Load base inside the target's address space
    pub base: GuestAddr,
    /// Size of the mapped range in bytes
    pub size: u64,
}

impl ModuleInfo {
    /// Create a new [`ModuleInfo`]
    #[must_use]
    pub fn new<S>(name: S, base: GuestAddr, size: u64) -> Self
    where
        S: Into<String>,
    {
        Self {
            name: name.into(),
            base,
            size,
        }
    }
}

/// An intercepted allocator call, reported after the allocator returned.
///
/// These are the allocator entry points the engine is expected to wrap;
/// `result`/`new_ptr` carry the allocator's return value so a failed
/// allocation arrives as a null address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationEvent {
    /// `malloc(size)` returned `result`
    Malloc {
        /// Requested size in bytes
        size: u64,
        /// Address returned by the allocator, null on failure
        result: GuestAddr,
    },
    /// `calloc(nmemb, size)` returned `result`
    Calloc {
        /// Number of elements
        nmemb: u64,
        /// Size of one element in bytes
        size: u64,
        /// Address returned by the allocator, null on failure
        result: GuestAddr,
    },
    /// `realloc(old_ptr, size)` returned `new_ptr`
    Realloc {
        /// The address being reallocated, null for a plain allocation
        old_ptr: GuestAddr,
        /// Address returned by the allocator, null on failure
        new_ptr: GuestAddr,
        /// Requested size in bytes
        size: u64,
    },
    /// `free(ptr)` was called
    Free {
        /// The address being released
        ptr: GuestAddr,
    },
}

/// Queries the monitor issues back into the instrumentation engine.
///
/// All queries run inline on the thread that triggered the current event,
/// so implementations answer for *that* thread's machine state.
pub trait InstrumentationEngine {
    /// The stack pointer of the executing thread, sampled at the
    /// instruction that triggered the current event.
    fn stack_pointer(&self) -> GuestAddr;

    /// Length in bytes of the instruction at `addr`, or `None` if it does
    /// not decode.
    fn instruction_length(&self, addr: GuestAddr) -> Option<u64>;

    /// The symbol covering `offset` within `module`, as the symbol name and
    /// the offset of `offset` inside that symbol. `None` if no debug info
    /// covers the location.
    fn symbol_at(&self, module: &str, offset: GuestAddr) -> Option<(String, GuestAddr)>;
}

impl<E> InstrumentationEngine for &E
where
    E: InstrumentationEngine + ?Sized,
{
    fn stack_pointer(&self) -> GuestAddr {
        (**self).stack_pointer()
    }

    fn instruction_length(&self, addr: GuestAddr) -> Option<u64> {
        (**self).instruction_length(addr)
    }

    fn symbol_at(&self, module: &str, offset: GuestAddr) -> Option<(String, GuestAddr)> {
        (**self).symbol_at(module, offset)
    }
}
