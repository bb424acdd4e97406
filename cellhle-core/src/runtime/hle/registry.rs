//! Module Registry
//!
//! Owns every registered [`Module`] and the process-wide dispatch table that
//! maps a function ID to its single active handler.
//!
//! # API Reference
//!
//! ## Registration
//! - `register_module(builder)`: Build and register a module, running its init callback
//! - `module_by_id(id)` / `module_by_name(name)`: Find a registered module
//!
//! ## Lifecycle
//! - `load_all()` / `unload_all()`: Load or unload every registered module
//! - `is_loaded_func(fid)`: Whether a function ID currently resolves
//!
//! ## Dispatch
//! - `resolve(fid)`: Active handler for a function ID
//! - `dispatch(fid, args, objects, memory)`: Resolve and invoke
//!
//! # Locking
//! Table mutation takes the write lock; lookups share the read lock. The
//! handler itself runs with no registry lock held, so handlers may load or
//! unload modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, warn};

use super::call::HleCall;
use super::log::HleLog;
use super::module::{ExportedFunction, Module, ModuleBuilder};
use crate::error::HleError;
use crate::runtime::id::ObjectRegistry;
use crate::runtime::memory::AddressSpace;

/// Function ID -> active export.
#[derive(Debug, Default)]
pub struct DispatchTable {
    funcs: RwLock<HashMap<u32, Arc<ExportedFunction>>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `export`. Returns false if its ID already has a handler.
    pub fn insert(&self, export: Arc<ExportedFunction>) -> bool {
        let mut funcs = self.funcs.write().unwrap_or_else(PoisonError::into_inner);
        if funcs.contains_key(&export.id()) {
            return false;
        }
        funcs.insert(export.id(), export);
        true
    }

    /// Deactivate `export` if it is the active handler for its ID.
    pub fn remove_owned(&self, export: &Arc<ExportedFunction>) -> bool {
        let mut funcs = self.funcs.write().unwrap_or_else(PoisonError::into_inner);
        match funcs.get(&export.id()) {
            Some(active) if Arc::ptr_eq(active, export) => {
                funcs.remove(&export.id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<ExportedFunction>> {
        self.funcs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.funcs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.funcs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registered modules plus the shared dispatch table.
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: RwLock<Vec<Arc<Module>>>,
    table: Arc<DispatchTable>,
    logging: Arc<AtomicBool>,
}

impl ModuleRegistry {
    /// Empty registry with HLE notices disabled.
    pub fn new() -> Self {
        Self::with_logging(false)
    }

    pub fn with_logging(enabled: bool) -> Self {
        Self {
            modules: RwLock::new(Vec::new()),
            table: Arc::new(DispatchTable::new()),
            logging: Arc::new(AtomicBool::new(enabled)),
        }
    }

    /// Build and register a module. The module starts unloaded.
    ///
    /// Fails if another module has the same name or numeric ID, or if two
    /// of the module's exports share a function ID.
    pub fn register_module(&self, builder: ModuleBuilder) -> Result<Arc<Module>, HleError> {
        let module = {
            let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
            let clash = modules.iter().any(|m| {
                m.name() == builder.name() || (builder.id().is_some() && m.id() == builder.id())
            });
            if clash {
                return Err(HleError::DuplicateModule(builder.name().to_string()));
            }

            let log = HleLog::new(builder.name(), self.logging.clone());
            let module = Arc::new(builder.build(self.table.clone(), log)?);
            modules.push(module.clone());
            module
        };

        debug!(
            target: "hle",
            "registered module {} ({} exports)",
            module.name(),
            module.exports().len()
        );
        module.run_init();
        Ok(module)
    }

    pub fn module_by_id(&self, id: u16) -> Option<Arc<Module>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.id() == Some(id))
            .cloned()
    }

    pub fn module_by_name(&self, name: &str) -> Option<Arc<Module>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Registered modules, in registration order.
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn load_all(&self) {
        for module in self.modules() {
            module.load();
        }
    }

    pub fn unload_all(&self) {
        for module in self.modules() {
            module.unload();
        }
    }

    /// Whether `fid` currently has an active handler.
    pub fn is_loaded_func(&self, fid: u32) -> bool {
        self.table.contains(fid)
    }

    /// Number of active function IDs.
    pub fn active_count(&self) -> usize {
        self.table.len()
    }

    /// Active handler for `fid`.
    ///
    /// A miss is logged; guest binaries routinely import functions that are
    /// not implemented.
    pub fn resolve(&self, fid: u32) -> Result<Arc<ExportedFunction>, HleError> {
        self.table.get(fid).ok_or_else(|| {
            warn!(target: "hle", "unimplemented import 0x{:08X}", fid);
            HleError::UnresolvedImport(fid)
        })
    }

    /// Resolve `fid` and invoke its handler with `args`.
    pub fn dispatch(
        &self,
        fid: u32,
        args: [u64; 8],
        objects: &ObjectRegistry,
        memory: &AddressSpace,
    ) -> Result<i64, HleError> {
        let export = self.resolve(fid)?;
        let log = export.log();
        if log.enabled() {
            log.notice(&format!(
                "{}(0x{:X}, 0x{:X}, 0x{:X}, 0x{:X})",
                export.name(),
                args[0],
                args[1],
                args[2],
                args[3]
            ));
        }
        let call = HleCall::new(log, args, objects, memory);
        Ok(export.invoke(&call))
    }

    /// Enable or disable module notices for every module.
    pub fn set_hle_logging(&self, enabled: bool) {
        self.logging.store(enabled, Ordering::Relaxed);
    }

    pub fn hle_logging(&self) -> bool {
        self.logging.load(Ordering::Relaxed)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::hle::call::error::CELL_OK;
    use crate::runtime::hle::nid::function_id;
    use std::sync::atomic::AtomicU32;

    fn sys_fs() -> ModuleBuilder {
        ModuleBuilder::with_id(0x000E, "sys_fs")
            .export("cellFsOpen", |_| CELL_OK)
            .export("cellFsClose", |call| call.args[0] as i64)
    }

    #[test]
    fn test_register_starts_unloaded() {
        let registry = ModuleRegistry::new();
        let module = registry.register_module(sys_fs()).unwrap();
        assert!(!module.is_loaded());
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.is_loaded_func(function_id("cellFsOpen")));
    }

    #[test]
    fn test_init_runs_once_at_registration() {
        let registry = ModuleRegistry::new();
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        let module = registry
            .register_module(ModuleBuilder::new("cellPad").on_init(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        module.load();
        module.unload();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_module_rejected() {
        let registry = ModuleRegistry::new();
        registry.register_module(sys_fs()).unwrap();
        assert_eq!(
            registry.register_module(ModuleBuilder::new("sys_fs")).unwrap_err(),
            HleError::DuplicateModule("sys_fs".into())
        );
        assert_eq!(
            registry.register_module(ModuleBuilder::with_id(0x000E, "other")).unwrap_err(),
            HleError::DuplicateModule("other".into())
        );
        // Name-only modules never clash on id.
        registry.register_module(ModuleBuilder::new("a")).unwrap();
        registry.register_module(ModuleBuilder::new("b")).unwrap();
    }

    #[test]
    fn test_duplicate_export_rejected() {
        let registry = ModuleRegistry::new();
        let err = registry
            .register_module(
                ModuleBuilder::new("cellGame")
                    .export("cellGameBootCheck", |_| CELL_OK)
                    .export_nid(function_id("cellGameBootCheck"), "alias", |_| CELL_OK),
            )
            .unwrap_err();
        assert!(matches!(err, HleError::DuplicateExport { ref name, .. } if name == "alias"));
        assert!(registry.module_by_name("cellGame").is_none());
    }

    #[test]
    fn test_dispatch_invokes_handler() {
        let registry = ModuleRegistry::new();
        registry.register_module(sys_fs()).unwrap();
        registry.load_all();

        let objects = ObjectRegistry::new();
        let memory = AddressSpace::new();
        let mut args = [0u64; 8];
        args[0] = 42;
        assert_eq!(
            registry.dispatch(function_id("cellFsClose"), args, &objects, &memory),
            Ok(42)
        );
        assert_eq!(
            registry.dispatch(0xDEAD_BEEF, args, &objects, &memory),
            Err(HleError::UnresolvedImport(0xDEAD_BEEF))
        );
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let registry = ModuleRegistry::new();
        registry.register_module(sys_fs()).unwrap();
        assert_eq!(registry.module_by_id(0x000E).unwrap().name(), "sys_fs");
        assert_eq!(registry.module_by_name("sys_fs").unwrap().id(), Some(0x000E));
        assert!(registry.module_by_id(1).is_none());
        assert_eq!(registry.modules().len(), 1);
    }

    #[test]
    fn test_load_callback_reenters_registry() {
        let registry = Arc::new(ModuleRegistry::new());
        let weak = Arc::downgrade(&registry);
        let saw_loaded = Arc::new(AtomicBool::new(false));
        let flag = saw_loaded.clone();
        registry
            .register_module(sys_fs().on_load(move || {
                let Some(registry) = weak.upgrade() else { return };
                let module = registry.module_by_name("sys_fs").unwrap();
                flag.store(module.is_loaded(), Ordering::SeqCst);
                registry.load_all();
            }))
            .unwrap();
        registry.register_module(ModuleBuilder::new("cellFsUtility")).unwrap();

        registry.load_all();
        assert!(saw_loaded.load(Ordering::SeqCst));
        assert!(registry.modules().iter().all(|m| m.is_loaded()));
        assert!(registry.is_loaded_func(function_id("cellFsOpen")));
    }

    #[test]
    fn test_logging_toggle_shared() {
        let registry = ModuleRegistry::with_logging(true);
        let module = registry.register_module(ModuleBuilder::new("cellSysutil")).unwrap();
        assert!(registry.hle_logging());
        registry.set_hle_logging(false);
        assert!(!registry.hle_logging());
        module.log("not emitted");
    }
}
