//! HLE Modules
//!
//! A module is a named bundle of host implementations of guest library
//! functions. Its export list is fixed once it is registered; loading and
//! unloading only moves its exports in and out of the shared dispatch table.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use super::call::{HleCall, HleHandler};
use super::log::HleLog;
use super::nid::function_id;
use super::registry::DispatchTable;
use crate::error::{HleError, IdError};
use crate::runtime::id::ObjectRegistry;

/// Module lifecycle callback.
pub type ModuleCallback = Box<dyn Fn() + Send + Sync>;

/// One resolvable symbol.
pub struct ExportedFunction {
    id: u32,
    name: String,
    handler: HleHandler,
    log: HleLog,
}

impl ExportedFunction {
    /// Function ID the guest imports this symbol by.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning module.
    pub fn module_name(&self) -> &str {
        self.log.name()
    }

    /// Logger of the owning module.
    pub fn log(&self) -> &HleLog {
        &self.log
    }

    /// Run the host implementation.
    pub fn invoke(&self, call: &HleCall<'_>) -> i64 {
        (self.handler)(call)
    }
}

impl fmt::Debug for ExportedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedFunction")
            .field("id", &format_args!("0x{:08X}", self.id))
            .field("name", &self.name)
            .field("module", &self.module_name())
            .finish()
    }
}

/// Declarative description of a module, consumed by
/// [`ModuleRegistry::register_module`](super::ModuleRegistry::register_module).
pub struct ModuleBuilder {
    id: Option<u16>,
    name: String,
    init: Option<ModuleCallback>,
    load: Option<ModuleCallback>,
    unload: Option<ModuleCallback>,
    exports: Vec<(u32, String, HleHandler)>,
}

impl ModuleBuilder {
    /// A module identified by name only.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            init: None,
            load: None,
            unload: None,
            exports: Vec::new(),
        }
    }

    /// A module with a numeric ID as well as a name.
    pub fn with_id(id: u16, name: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            ..Self::new(name)
        }
    }

    /// Called once, when the module is registered.
    pub fn on_init(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.init = Some(Box::new(f));
        self
    }

    /// Called by `Module::load` before the exports are activated. The
    /// module already reports itself as loaded while this runs.
    pub fn on_load(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.load = Some(Box::new(f));
        self
    }

    /// Called by `Module::unload` before the exports are deactivated.
    pub fn on_unload(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.unload = Some(Box::new(f));
        self
    }

    /// Export `name`, imported by the guest under `function_id(name)`.
    pub fn export<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&HleCall<'_>) -> i64 + Send + Sync + 'static,
    {
        self.export_nid(function_id(name), name, handler)
    }

    /// Export a function under an explicit ID, for symbols whose name is
    /// not known.
    pub fn export_nid<F>(mut self, id: u32, name: &str, handler: F) -> Self
    where
        F: Fn(&HleCall<'_>) -> i64 + Send + Sync + 'static,
    {
        self.exports.push((id, name.to_string(), Arc::new(handler)));
        self
    }

    pub(super) fn id(&self) -> Option<u16> {
        self.id
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    /// Build the module. Its exports must have pairwise distinct IDs.
    pub(super) fn build(self, table: Arc<DispatchTable>, log: HleLog) -> Result<Module, HleError> {
        let mut seen = HashSet::new();
        let mut exports = Vec::with_capacity(self.exports.len());
        for (id, name, handler) in self.exports {
            if !seen.insert(id) {
                return Err(HleError::DuplicateExport {
                    module: self.name,
                    name,
                    fid: id,
                });
            }
            exports.push(Arc::new(ExportedFunction {
                id,
                name,
                handler,
                log: log.clone(),
            }));
        }

        Ok(Module {
            id: self.id,
            name: self.name,
            loaded: Mutex::new(false),
            init: self.init,
            load: self.load,
            unload: self.unload,
            exports,
            table,
            log,
        })
    }
}

/// A registered module.
pub struct Module {
    id: Option<u16>,
    name: String,
    loaded: Mutex<bool>,
    init: Option<ModuleCallback>,
    load: Option<ModuleCallback>,
    unload: Option<ModuleCallback>,
    exports: Vec<Arc<ExportedFunction>>,
    table: Arc<DispatchTable>,
    log: HleLog,
}

impl Module {
    pub(super) fn run_init(&self) {
        if let Some(init) = &self.init {
            init();
        }
    }

    /// Activate every export. No-op if already loaded.
    ///
    /// An export whose ID is already active elsewhere is skipped; the table
    /// keeps at most one handler per ID. The load callback runs without the
    /// module lock held, so it may query or load other modules.
    pub fn load(&self) {
        if !self.transition(true) {
            return;
        }

        if let Some(load) = &self.load {
            load();
        }
        for export in &self.exports {
            if !self.table.insert(export.clone()) {
                self.log.warning(&format!(
                    "{} (0x{:08X}) is already active, skipped",
                    export.name, export.id
                ));
            }
        }
        debug!(target: "hle", "module {} loaded ({} exports)", self.name, self.exports.len());
    }

    /// Deactivate every export this module owns. No-op if not loaded.
    pub fn unload(&self) {
        if !self.transition(false) {
            return;
        }

        if let Some(unload) = &self.unload {
            unload();
        }
        for export in &self.exports {
            self.table.remove_owned(export);
        }
        debug!(target: "hle", "module {} unloaded", self.name);
    }

    /// Flip the loaded flag to `loaded`. Returns false if it already was.
    fn transition(&self, loaded: bool) -> bool {
        let mut current = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == loaded {
            return false;
        }
        *current = loaded;
        true
    }

    /// Activate a single export without loading the whole module.
    pub fn load_func(&self, id: u32) -> Result<(), HleError> {
        if self.table.contains(id) {
            return Err(HleError::AlreadyActive(id));
        }
        let export = self
            .exports
            .iter()
            .find(|export| export.id == id)
            .ok_or_else(|| HleError::NotExported {
                module: self.name.clone(),
                fid: id,
            })?;
        if self.table.insert(export.clone()) {
            Ok(())
        } else {
            Err(HleError::AlreadyActive(id))
        }
    }

    /// Deactivate a single export. Returns false unless this module's
    /// handler was the active one.
    pub fn unload_func(&self, id: u32) -> bool {
        self.exports
            .iter()
            .find(|export| export.id == id)
            .is_some_and(|export| self.table.remove_owned(export))
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Option<u16> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exports(&self) -> &[Arc<ExportedFunction>] {
        &self.exports
    }

    /// Whether `id` is a live object registered under this module's name.
    pub fn check_id(&self, objects: &ObjectRegistry, id: u32) -> bool {
        objects.check_id_tagged(id, &self.name)
    }

    /// Resolve a handle owned by this module.
    pub fn lookup<T: Any + Send + Sync>(
        &self,
        objects: &ObjectRegistry,
        id: u32,
    ) -> Result<Arc<T>, IdError> {
        if !self.check_id(objects, id) {
            return Err(IdError::NotFound(id));
        }
        objects.lookup_as(id)
    }

    pub fn log(&self, message: &str) {
        self.log.notice(message);
    }

    pub fn log_id(&self, id: u32, message: &str) {
        self.log.notice_id(id, message);
    }

    pub fn warning(&self, message: &str) {
        self.log.warning(message);
    }

    pub fn warning_id(&self, id: u32, message: &str) {
        self.log.warning_id(id, message);
    }

    pub fn error(&self, message: &str) {
        self.log.error(message);
    }

    pub fn error_id(&self, id: u32, message: &str) {
        self.log.error_id(id, message);
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        self.unload();
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .field("exports", &self.exports.len())
            .finish()
    }
}
