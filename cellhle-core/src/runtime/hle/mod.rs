//! High-Level Emulation
//!
//! Guest binaries import system library functions by function ID. This
//! module resolves those IDs to host implementations grouped into loadable
//! modules.
//!
//! # Overview
//! - [`nid`]: function ID derivation from export names
//! - [`module`]: module definitions and per-module load/unload
//! - [`registry`]: the module registry and its dispatch table
//! - [`call`]: what a handler receives when the guest calls it
//! - [`log`]: module-tagged diagnostics

pub mod call;
pub mod log;
pub mod module;
pub mod nid;
pub mod registry;

pub use call::{error, HleCall, HleHandler};
pub use log::HleLog;
pub use module::{ExportedFunction, Module, ModuleBuilder};
pub use nid::function_id;
pub use registry::{DispatchTable, ModuleRegistry};
