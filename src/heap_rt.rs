//! The process-wide heap liveness tracker.
//!
//! Exactly one live entry may exist per address at any time. Allocation and
//! free may happen on different threads, so the map is guarded by a mutex;
//! every operation is a single short critical section on the allocator's
//! hot path.

use std::sync::Mutex;

use backtrace::Backtrace;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::GuestAddr;

/// Metadata for one live heap allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapAllocation {
    /// Address returned by the allocator
    pub address: GuestAddr,
    /// Requested size in bytes
    pub size: u64,
    /// Where the allocation was made, gathered only when backtrace
    /// collection is enabled
    pub allocation_site_backtrace: Option<Backtrace>,
}

/// Outcome of validating one free/realloc against the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapCheck {
    /// The operation was consistent with the tracked state
    Recorded,
    /// Null address; the allocator treats this as a no-op and so do we
    NullPointer,
    /// The address has no live entry: an invalid or double free
    NotTracked,
}

/// Tracks every live allocation in the target process.
#[derive(Debug)]
pub struct HeapTracker {
    allocations: Mutex<HashMap<GuestAddr, HeapAllocation>>,
    collect_backtraces: bool,
}

impl HeapTracker {
    /// Create an empty tracker. With `collect_backtraces` set, every entry
    /// carries an unresolved allocation-site backtrace for diagnostics.
    #[must_use]
    pub fn new(collect_backtraces: bool) -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
            collect_backtraces,
        }
    }

    fn backtrace(&self) -> Option<Backtrace> {
        self.collect_backtraces.then(Backtrace::new_unresolved)
    }

    /// Record a successful allocation of `size` bytes at `address`.
    /// No-op if `address` is null (the allocation failed).
    pub fn record_allocation(&self, address: GuestAddr, size: u64) {
        if address == 0 {
            return;
        }
        let entry = HeapAllocation {
            address,
            size,
            allocation_site_backtrace: self.backtrace(),
        };
        if self
            .allocations
            .lock()
            .unwrap()
            .insert(address, entry)
            .is_some()
        {
            // Allocator reuse can hand the same address out again before we
            // saw the matching free; keep the newest entry.
            log::debug!("allocation at 0x{address:x} replaces a live entry");
        }
    }

    /// Validate and record a free of `address`.
    pub fn record_free(&self, address: GuestAddr) -> HeapCheck {
        if address == 0 {
            return HeapCheck::NullPointer;
        }
        match self.allocations.lock().unwrap().remove(&address) {
            Some(_) => HeapCheck::Recorded,
            None => HeapCheck::NotTracked,
        }
    }

    /// Validate and record a reallocation: `old_address` (if non-null) must
    /// be tracked and is removed, then `{new_address, new_size}` is
    /// inserted with the same null-guard as an allocation.
    pub fn record_reallocation(
        &self,
        old_address: GuestAddr,
        new_address: GuestAddr,
        new_size: u64,
    ) -> HeapCheck {
        let mut allocations = self.allocations.lock().unwrap();

        let mut result = HeapCheck::Recorded;
        if old_address != 0 && allocations.remove(&old_address).is_none() {
            result = HeapCheck::NotTracked;
        }
        if new_address != 0 {
            let entry = HeapAllocation {
                address: new_address,
                size: new_size,
                allocation_site_backtrace: self.backtrace(),
            };
            allocations.insert(new_address, entry);
        }
        result
    }

    /// Is there a live entry for `address`?
    #[must_use]
    pub fn is_tracked(&self, address: GuestAddr) -> bool {
        self.allocations.lock().unwrap().contains_key(&address)
    }

    /// Snapshot of every live allocation, ordered by address. Used for the
    /// exit-time leak report.
    #[must_use]
    pub fn live(&self) -> Vec<HeapAllocation> {
        let mut live: Vec<HeapAllocation> =
            self.allocations.lock().unwrap().values().cloned().collect();
        live.sort_by_key(|allocation| allocation.address);
        live
    }

    /// Number of live allocations
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.lock().unwrap().len()
    }

    /// Returns `true` if no allocation is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.lock().unwrap().is_empty()
    }
}
