//! The event dispatcher tying the verification engines together.
//!
//! The instrumentation engine forwards every observed call, return,
//! indirect branch, allocator call and thread/module lifecycle event to a
//! [`ControlFlowMonitor`]. The monitor queries the engine for machine
//! state, drives the shadow stack, heap tracker and CFG validator, and is
//! the only place where a fatal result turns into a printed diagnostic and
//! a process abort.

use std::sync::{Mutex, MutexGuard};

use crate::{
    cfg_rt::{BranchCheck, CfgGraph, CfgRuntime},
    engine::{AllocationEvent, InstrumentationEngine, ModuleInfo},
    heap_rt::{HeapCheck, HeapTracker},
    shadow_rt::CallRecord,
    symbols::Symbolicator,
    thread,
    violations::{Violation, Violations},
    Error, GuestAddr, MonitorOptions,
};

/// Size of one machine word on the target, the amount the stack pointer
/// moves when a call pushes its return address.
const WORD_SIZE: GuestAddr = core::mem::size_of::<GuestAddr>() as GuestAddr;

/// The central dispatcher: owns the process-wide verification engines and
/// the connection to the instrumentation engine.
pub struct ControlFlowMonitor<E> {
    engine: E,
    options: MonitorOptions,
    cfg: CfgRuntime,
    heap: HeapTracker,
    symbolicator: Symbolicator,
    violations: Mutex<Violations>,
}

impl<E> core::fmt::Debug for ControlFlowMonitor<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("ControlFlowMonitor")
    }
}

impl<E> ControlFlowMonitor<E>
where
    E: InstrumentationEngine,
{
    /// Create a monitor for `engine`, loading the control-flow graph named
    /// by `options`. Fails before any instrumentation begins if the CFG
    /// file is missing or malformed.
    pub fn new(engine: E, options: &MonitorOptions) -> Result<Self, Error> {
        let graph = CfgGraph::from_file(&options.cfg)?;
        log::info!(
            "loaded control-flow graph with {} nodes from {}",
            graph.len(),
            options.cfg.display()
        );

        Ok(Self {
            engine,
            cfg: CfgRuntime::new(graph, options.symbol_substring_match),
            heap: HeapTracker::new(options.allocation_backtraces),
            symbolicator: Symbolicator::new(options.app_module.clone()),
            violations: Mutex::new(Violations::new(options.continue_on_violation)),
            options: options.clone(),
        })
    }

    /// The instrumentation engine this monitor queries
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The indirect-branch validator
    pub fn cfg(&self) -> &CfgRuntime {
        &self.cfg
    }

    /// The heap liveness tracker
    pub fn heap(&self) -> &HeapTracker {
        &self.heap
    }

    /// The symbolicator fed by module-load events
    pub fn symbolicator(&self) -> &Symbolicator {
        &self.symbolicator
    }

    /// The violations recorded so far
    pub fn violations(&self) -> MutexGuard<'_, Violations> {
        self.violations.lock().unwrap()
    }

    /// A new application thread started executing
    pub fn on_thread_start(&self) {
        if thread::register_current_thread() {
            log::trace!("thread {:?} registered", std::thread::current().id());
        } else {
            log::debug!("thread {:?} already registered", std::thread::current().id());
        }
    }

    /// The calling application thread is exiting
    pub fn on_thread_exit(&self) {
        if let Some(context) = thread::unregister_current_thread() {
            let depth = context.shadow_stack().depth();
            if depth != 0 {
                log::debug!("thread {:?} exited with {depth} live call records", context.thread_id());
            }
        }
    }

    /// The engine observed `module` being loaded into the target
    pub fn on_module_loaded(&self, module: &ModuleInfo) {
        let id = self.symbolicator.register_module(module);
        log::info!(
            "module #{id} {} loaded at 0x{:x} (0x{:x} bytes)",
            module.name,
            module.base,
            module.size
        );
    }

    /// A direct call instruction at `instr_addr` is about to execute
    pub fn on_direct_call(&self, instr_addr: GuestAddr) {
        self.push_call(instr_addr);
    }

    /// An indirect call at `instr_addr` is about to branch to `target_addr`
    pub fn on_indirect_call(&self, instr_addr: GuestAddr, target_addr: GuestAddr) {
        self.check_branch(instr_addr, target_addr);
        self.push_call(instr_addr);
    }

    /// An indirect jump at `instr_addr` is about to branch to `target_addr`
    pub fn on_indirect_jump(&self, instr_addr: GuestAddr, target_addr: GuestAddr) {
        self.check_branch(instr_addr, target_addr);
    }

    /// A return at `instr_addr` is about to branch to `target_addr`
    pub fn on_return(&self, instr_addr: GuestAddr, target_addr: GuestAddr) {
        use crate::shadow_rt::ReturnCheck;

        let sp = self.engine.stack_pointer();
        let result =
            thread::with_current_or_register(|ctx| ctx.shadow_stack_mut().check_return(sp, target_addr));

        match result {
            ReturnCheck::EmptyCallStack => {
                log::warn!("Empty call stack @ {}, SP=0x{sp:x}", self.describe(instr_addr));
            }
            ReturnCheck::SpNotFound => {
                log::warn!(
                    "Skipping check for instruction @ {}, SP=0x{sp:x}",
                    self.describe(instr_addr)
                );
            }
            ReturnCheck::Success { long_jump } => {
                if long_jump {
                    log::warn!("longjmp detected @ {}", self.describe(instr_addr));
                }
            }
            ReturnCheck::Mismatch { expected } => {
                self.report(Violation::ReturnMismatch {
                    location: self.describe(instr_addr),
                    sp,
                    expected,
                    actual: target_addr,
                });
            }
        }
    }

    /// The engine intercepted an allocator call
    pub fn on_allocation(&self, event: AllocationEvent) {
        match event {
            AllocationEvent::Malloc { size, result } => {
                self.heap.record_allocation(result, size);
            }
            AllocationEvent::Calloc { nmemb, size, result } => {
                self.heap.record_allocation(result, nmemb.saturating_mul(size));
            }
            AllocationEvent::Realloc {
                old_ptr,
                new_ptr,
                size,
            } => {
                if self.heap.record_reallocation(old_ptr, new_ptr, size) == HeapCheck::NotTracked {
                    self.report(Violation::InvalidRealloc { ptr: old_ptr });
                }
            }
            AllocationEvent::Free { ptr } => {
                if self.heap.record_free(ptr) == HeapCheck::NotTracked {
                    self.report(Violation::InvalidFree { ptr });
                }
            }
        }
    }

    /// The target is terminating normally; report allocations that never
    /// got freed. Logged only, never fatal.
    pub fn on_process_exit(&self) {
        let live = self.heap.live();
        if live.is_empty() {
            return;
        }
        log::warn!("{} allocations still live at exit", live.len());
        for allocation in live {
            log::warn!(
                "  leaked 0x{:x} ({} bytes)",
                allocation.address,
                allocation.size
            );
        }
    }

    fn push_call(&self, instr_addr: GuestAddr) {
        let sp = self.engine.stack_pointer();
        let Some(length) = self.engine.instruction_length(instr_addr) else {
            // Without the instruction length there is no return address to
            // record, and an unrecorded call poisons every later check.
            log::error!(
                "failed to decode call instruction @ {}, SP=0x{sp:x}",
                self.describe(instr_addr)
            );
            if !self.options.continue_on_violation {
                std::process::abort();
            }
            return;
        };

        let record = CallRecord {
            call_site: instr_addr,
            expected_sp: sp - WORD_SIZE,
            expected_return_address: instr_addr + length,
        };
        thread::with_current_or_register(|ctx| ctx.shadow_stack_mut().push(record));
    }

    fn check_branch(&self, instr_addr: GuestAddr, target_addr: GuestAddr) {
        let app_module = self.symbolicator.app_module().unwrap_or_default();
        let source = self.symbolicator.resolve(&self.engine, instr_addr);
        let target = self.symbolicator.resolve(&self.engine, target_addr);

        let result = self
            .cfg
            .check_indirect_branch(&app_module, source.as_ref(), target.as_ref());
        match result {
            BranchCheck::EdgeFound => {}
            BranchCheck::UnknownModule
            | BranchCheck::DifferentModule
            | BranchCheck::NodeNotFound
            | BranchCheck::UnknownTarget => {
                log::debug!(
                    "indirect branch 0x{instr_addr:x} -> 0x{target_addr:x} not checked ({result:?})"
                );
            }
            BranchCheck::NotFunctionEntry => {
                self.report(Violation::MidFunctionTarget {
                    source: self.describe(instr_addr),
                    target: self.describe(target_addr),
                });
            }
            BranchCheck::EdgeNotFound => {
                self.report(Violation::InvalidEdge {
                    source: self.describe(instr_addr),
                    target: self.describe(target_addr),
                });
            }
        }
    }

    fn describe(&self, addr: GuestAddr) -> String {
        self.symbolicator.describe(&self.engine, addr)
    }

    /// Symbolized shadow stack of the calling thread, most recent call
    /// first.
    fn call_trace(&self) -> Vec<String> {
        thread::with_current(|ctx| {
            ctx.shadow_stack()
                .records()
                .map(|record| {
                    format!(
                        "{} (sp=0x{:x})",
                        self.symbolicator
                            .describe(&self.engine, record.expected_return_address),
                        record.expected_sp
                    )
                })
                .collect()
        })
        .unwrap_or_default()
    }

    fn report(&self, violation: Violation) {
        let call_trace = self.call_trace();
        let should_abort = self
            .violations
            .lock()
            .unwrap()
            .report(violation, &call_trace);
        if should_abort {
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::ControlFlowMonitor;
    use crate::{
        engine::{
            testing::{FakeEngine, FakeSymbol},
            AllocationEvent, ModuleInfo,
        },
        violations::Violation,
        MonitorOptions,
    };

    const APP_BASE: u64 = 0x400000;

    fn write_cfg(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "cfimon_monitor_{}_{name}.cfg",
            std::process::id()
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn engine() -> FakeEngine {
        let mut engine = FakeEngine::new();
        engine.symbols.push(FakeSymbol {
            module: "app.elf",
            name: "main",
            start: 0x1000,
            size: 0x1000,
        });
        engine.symbols.push(FakeSymbol {
            module: "app.elf",
            name: "handler",
            start: 0x2000,
            size: 0x1000,
        });
        engine.symbols.push(FakeSymbol {
            module: "libc.so",
            name: "malloc",
            start: 0x500,
            size: 0x100,
        });
        engine
    }

    fn monitor(name: &str, cfg: &str) -> ControlFlowMonitor<FakeEngine> {
        let mut options = MonitorOptions::with_cfg(write_cfg(name, cfg));
        options.continue_on_violation = true;

        let monitor = ControlFlowMonitor::new(engine(), &options).unwrap();
        monitor.on_thread_start();
        monitor.on_module_loaded(&ModuleInfo::new("app.elf", APP_BASE, 0x10000));
        monitor.on_module_loaded(&ModuleInfo::new("libc.so", 0x7f0000000000, 0x10000));
        monitor
    }

    #[test]
    fn test_missing_cfg_file_fails_startup() {
        let options = MonitorOptions::with_cfg("/nonexistent/path.cfg");
        assert!(ControlFlowMonitor::new(engine(), &options).is_err());
    }

    #[test]
    fn test_balanced_call_and_return() {
        let monitor = monitor("balanced", "1000 O:2000");
        let call_site = APP_BASE + 0x1010;

        monitor.engine().sp.set(0x7fff_1000);
        monitor.on_direct_call(call_site);

        monitor.engine().sp.set(0x7fff_1000 - 8);
        monitor.on_return(APP_BASE + 0x2040, call_site + 5);

        assert!(monitor.violations().is_empty());
        assert_eq!(
            crate::thread::with_current(|ctx| ctx.shadow_stack().depth()),
            Some(0)
        );
    }

    #[test]
    fn test_overwritten_return_address() {
        let monitor = monitor("tampered", "1000 O:2000");
        let call_site = APP_BASE + 0x1010;

        monitor.engine().sp.set(0x7fff_1000);
        monitor.on_direct_call(call_site);

        monitor.engine().sp.set(0x7fff_1000 - 8);
        monitor.on_return(APP_BASE + 0x2040, 0xbad);

        let violations = monitor.violations();
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            violations.violations()[0],
            Violation::ReturnMismatch {
                expected,
                actual: 0xbad,
                ..
            } if expected == call_site + 5
        ));
    }

    #[test]
    fn test_indirect_call_edge_enforcement() {
        let monitor = monitor("edges", "1010 O:2000");

        // permitted edge: offset 0x1010 -> 0x2000
        monitor.on_indirect_call(APP_BASE + 0x1010, APP_BASE + 0x2000);
        assert!(monitor.violations().is_empty());
        // the call itself is still tracked
        assert_eq!(
            crate::thread::with_current(|ctx| ctx.shadow_stack().depth()),
            Some(1)
        );

        // forbidden edge: offset 0x1010 -> 0x2500
        monitor.on_indirect_jump(APP_BASE + 0x1010, APP_BASE + 0x2500);
        let violations = monitor.violations();
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            &violations.violations()[0],
            Violation::InvalidEdge { .. }
        ));
    }

    #[test]
    fn test_cross_module_branch_must_hit_entry() {
        let monitor = monitor("entry", "1010 S:libc.so::malloc");

        // malloc's entry point at libc.so+0x500
        monitor.on_indirect_jump(APP_BASE + 0x1010, 0x7f0000000500);
        assert!(monitor.violations().is_empty());

        // eight bytes into malloc: a gadget
        monitor.on_indirect_jump(APP_BASE + 0x1010, 0x7f0000000508);
        assert!(matches!(
            &monitor.violations().violations()[0],
            Violation::MidFunctionTarget { .. }
        ));
    }

    #[test]
    fn test_uncovered_branch_sites_pass() {
        let monitor = monitor("uncovered", "1010 O:2000");

        // no node for offset 0x1800
        monitor.on_indirect_jump(APP_BASE + 0x1800, APP_BASE + 0x2000);
        // branch instruction outside the app module
        monitor.on_indirect_jump(0x7f0000000500, APP_BASE + 0x2000);
        // branch instruction outside every registered module
        monitor.on_indirect_jump(0xdead, APP_BASE + 0x2000);
        // target outside every registered module
        monitor.on_indirect_jump(APP_BASE + 0x1010, 0xdead);

        assert!(monitor.violations().is_empty());
    }

    #[test]
    fn test_double_free_violation() {
        let monitor = monitor("double_free", "1000 O:2000");

        monitor.on_allocation(AllocationEvent::Malloc {
            size: 16,
            result: 0xaaa,
        });
        monitor.on_allocation(AllocationEvent::Free { ptr: 0xaaa });
        assert!(monitor.violations().is_empty());

        monitor.on_allocation(AllocationEvent::Free { ptr: 0xaaa });
        assert!(matches!(
            &monitor.violations().violations()[0],
            Violation::InvalidFree { ptr: 0xaaa }
        ));
    }

    #[test]
    fn test_realloc_dispatch() {
        let monitor = monitor("realloc", "1000 O:2000");

        monitor.on_allocation(AllocationEvent::Malloc {
            size: 10,
            result: 0xa,
        });
        monitor.on_allocation(AllocationEvent::Realloc {
            old_ptr: 0xa,
            new_ptr: 0xb,
            size: 20,
        });
        assert!(!monitor.heap().is_tracked(0xa));
        assert!(monitor.heap().is_tracked(0xb));

        monitor.on_allocation(AllocationEvent::Realloc {
            old_ptr: 0xa,
            new_ptr: 0xc,
            size: 30,
        });
        assert!(matches!(
            &monitor.violations().violations()[0],
            Violation::InvalidRealloc { ptr: 0xa }
        ));
    }

    #[test]
    fn test_longjmp_unwind_through_dispatcher() {
        let monitor = monitor("longjmp", "1000 O:2000");
        let outer_call = APP_BASE + 0x1010;

        monitor.engine().sp.set(0x7fff_1000);
        monitor.on_direct_call(outer_call);
        monitor.engine().sp.set(0x7fff_0f00);
        monitor.on_direct_call(APP_BASE + 0x1020);
        monitor.engine().sp.set(0x7fff_0e00);
        monitor.on_direct_call(APP_BASE + 0x1030);

        // longjmp back to the outer frame, then the outer return
        monitor.engine().sp.set(0x7fff_1000 - 8);
        monitor.on_return(APP_BASE + 0x2040, outer_call + 5);

        assert!(monitor.violations().is_empty());
        assert_eq!(
            crate::thread::with_current(|ctx| ctx.shadow_stack().depth()),
            Some(0)
        );
    }

    #[test]
    fn test_leak_snapshot_at_exit() {
        let monitor = monitor("leaks", "1000 O:2000");
        monitor.on_allocation(AllocationEvent::Malloc {
            size: 16,
            result: 0x100,
        });
        monitor.on_allocation(AllocationEvent::Calloc {
            nmemb: 4,
            size: 8,
            result: 0x200,
        });

        monitor.on_process_exit();

        let live = monitor.heap().live();
        assert_eq!(live.len(), 2);
        assert_eq!(live[1].size, 32);
    }

    #[test]
    fn test_thread_exit_clears_context() {
        let monitor = monitor("thread_exit", "1000 O:2000");
        monitor.engine().sp.set(0x7fff_1000);
        monitor.on_direct_call(APP_BASE + 0x1010);

        monitor.on_thread_exit();
        assert_eq!(crate::thread::with_current(|ctx| ctx.shadow_stack().depth()), None);
    }
}
