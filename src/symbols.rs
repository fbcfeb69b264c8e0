//! Address symbolication: which module owns an address, and which symbol
//! inside that module.
//!
//! The monitor keeps its own table of loaded modules, fed by module-load
//! events, and only delegates the per-module debug-info lookup to the
//! instrumentation engine.

use std::sync::RwLock;

use rangemap::RangeMap;
use serde::{Deserialize, Serialize};

use crate::{
    engine::{InstrumentationEngine, ModuleInfo},
    GuestAddr,
};

/// Result of resolving a target address. Transient; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Name of the owning module
    pub module: String,
    /// Offset of the address from the module's load base
    pub module_offset: GuestAddr,
    /// Name of the covering symbol, empty if debug info has none
    pub symbol: String,
    /// Offset of the address from the symbol's entry point
    pub symbol_offset: GuestAddr,
}

/// The modules currently loaded into the target, keyed by address range.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    ranges: RangeMap<GuestAddr, (u16, String)>,
    app_module: Option<String>,
    next_id: u16,
}

impl ModuleRegistry {
    /// Create an empty registry. If `app_module` is `None`, the first
    /// registered module is taken to be the instrumented application.
    #[must_use]
    pub fn new(app_module: Option<String>) -> Self {
        Self {
            ranges: RangeMap::new(),
            app_module,
            next_id: 0,
        }
    }

    /// Record a loaded module and return its registry id.
    pub fn register(&mut self, module: &ModuleInfo) -> u16 {
        let id = self.next_id;
        self.next_id += 1;
        self.ranges
            .insert(module.base..(module.base + module.size), (id, module.name.clone()));
        if self.app_module.is_none() {
            self.app_module = Some(module.name.clone());
        }
        id
    }

    /// Name of the module considered the instrumented application.
    #[must_use]
    pub fn app_module(&self) -> Option<&str> {
        self.app_module.as_deref()
    }

    /// The module owning `addr`, as its name and the module-relative offset.
    #[must_use]
    pub fn lookup(&self, addr: GuestAddr) -> Option<(&str, GuestAddr)> {
        self.ranges
            .get_key_value(&addr)
            .map(|(range, (_, name))| (name.as_str(), addr - range.start))
    }

    /// Number of registered modules
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.iter().count()
    }

    /// Returns `true` if no module was registered yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Resolves target addresses to [`SymbolInfo`] and human-readable strings.
#[derive(Debug)]
pub struct Symbolicator {
    modules: RwLock<ModuleRegistry>,
}

impl Symbolicator {
    /// Create a new [`Symbolicator`], optionally pinning the application
    /// module name instead of deriving it from load order.
    #[must_use]
    pub fn new(app_module: Option<String>) -> Self {
        Self {
            modules: RwLock::new(ModuleRegistry::new(app_module)),
        }
    }

    /// Record a loaded module.
    pub fn register_module(&self, module: &ModuleInfo) -> u16 {
        self.modules.write().unwrap().register(module)
    }

    /// Name of the module considered the instrumented application.
    #[must_use]
    pub fn app_module(&self) -> Option<String> {
        self.modules
            .read()
            .unwrap()
            .app_module()
            .map(str::to_owned)
    }

    /// Resolve `addr`, or `None` if no registered module owns it.
    pub fn resolve<E>(&self, engine: &E, addr: GuestAddr) -> Option<SymbolInfo>
    where
        E: InstrumentationEngine,
    {
        let modules = self.modules.read().unwrap();
        let (module, module_offset) = modules.lookup(addr)?;
        let (symbol, symbol_offset) = engine
            .symbol_at(module, module_offset)
            .unwrap_or_else(|| (String::new(), 0));
        Some(SymbolInfo {
            module: module.to_owned(),
            module_offset,
            symbol,
            symbol_offset,
        })
    }

    /// Human-readable rendering of `addr` for diagnostics, in the form
    /// `0x1234 app.elf:0x234!main+0x10`, or `? ??:0` when nothing is known.
    pub fn describe<E>(&self, engine: &E, addr: GuestAddr) -> String
    where
        E: InstrumentationEngine,
    {
        match self.resolve(engine, addr) {
            None => "? ??:0".to_string(),
            Some(info) if info.symbol.is_empty() => {
                format!("0x{addr:x} {}:0x{:x}", info.module, info.module_offset)
            }
            Some(info) => format!(
                "0x{addr:x} {}:0x{:x}!{}+0x{:x}",
                info.module, info.module_offset, info.symbol, info.symbol_offset
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ModuleInfo, ModuleRegistry, Symbolicator};
    use crate::engine::testing::{FakeEngine, FakeSymbol};

    fn app() -> ModuleInfo {
        ModuleInfo::new("app.elf", 0x400000, 0x10000)
    }

    fn libc() -> ModuleInfo {
        ModuleInfo::new("libc.so", 0x7f0000000000, 0x20000)
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ModuleRegistry::new(None);
        registry.register(&app());
        registry.register(&libc());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(0x401000), Some(("app.elf", 0x1000)));
        assert_eq!(registry.lookup(0x7f0000000008), Some(("libc.so", 8)));
        assert_eq!(registry.lookup(0x1000), None);
    }

    #[test]
    fn test_first_module_is_app() {
        let mut registry = ModuleRegistry::new(None);
        registry.register(&app());
        registry.register(&libc());
        assert_eq!(registry.app_module(), Some("app.elf"));
    }

    #[test]
    fn test_app_module_override() {
        let mut registry = ModuleRegistry::new(Some("libc.so".to_string()));
        registry.register(&app());
        assert_eq!(registry.app_module(), Some("libc.so"));
    }

    #[test]
    fn test_describe_formats() {
        let mut engine = FakeEngine::new();
        engine.symbols.push(FakeSymbol {
            module: "app.elf",
            name: "main",
            start: 0x1000,
            size: 0x100,
        });

        let symbolicator = Symbolicator::new(None);
        symbolicator.register_module(&app());

        assert_eq!(
            symbolicator.describe(&engine, 0x401010),
            "0x401010 app.elf:0x1010!main+0x10"
        );
        // covered by the module but not by any symbol
        assert_eq!(
            symbolicator.describe(&engine, 0x402000),
            "0x402000 app.elf:0x2000"
        );
        // outside every registered module
        assert_eq!(symbolicator.describe(&engine, 0xdead), "? ??:0");
    }

    #[test]
    fn test_resolve_symbol_offsets() {
        let mut engine = FakeEngine::new();
        engine.symbols.push(FakeSymbol {
            module: "libc.so",
            name: "malloc",
            start: 0x500,
            size: 0x80,
        });

        let symbolicator = Symbolicator::new(None);
        symbolicator.register_module(&libc());

        let info = symbolicator.resolve(&engine, 0x7f0000000500).unwrap();
        assert_eq!(info.module, "libc.so");
        assert_eq!(info.module_offset, 0x500);
        assert_eq!(info.symbol, "malloc");
        assert_eq!(info.symbol_offset, 0);
    }
}
