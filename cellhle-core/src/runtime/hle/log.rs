//! Module-tagged HLE diagnostics.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn, Level};

/// Logger bound to one module's name.
///
/// Notices are gated by the shared HLE-logging toggle; warnings and errors
/// are always emitted.
#[derive(Clone)]
pub struct HleLog {
    name: Arc<str>,
    enabled: Arc<AtomicBool>,
}

impl HleLog {
    pub fn new(name: &str, enabled: Arc<AtomicBool>) -> Self {
        Self {
            name: Arc::from(name),
            enabled,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether toggle-gated notices are currently emitted.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Emit a pre-formatted message, optionally tagged with a call-site ID.
    pub fn emit(&self, level: Level, id: Option<u32>, message: &str) {
        let name = &self.name;
        match (level, id) {
            (Level::Error, Some(id)) => error!(target: "hle", "{}[{}] error: {}", name, id, message),
            (Level::Error, None) => error!(target: "hle", "{} error: {}", name, message),
            (Level::Warn, Some(id)) => warn!(target: "hle", "{}[{}] warning: {}", name, id, message),
            (Level::Warn, None) => warn!(target: "hle", "{} warning: {}", name, message),
            (_, _) if !self.enabled() => {}
            (_, Some(id)) => info!(target: "hle", "{}[{}]: {}", name, id, message),
            (_, None) => info!(target: "hle", "{}: {}", name, message),
        }
    }

    pub fn notice(&self, message: &str) {
        self.emit(Level::Info, None, message);
    }

    pub fn notice_id(&self, id: u32, message: &str) {
        self.emit(Level::Info, Some(id), message);
    }

    pub fn warning(&self, message: &str) {
        self.emit(Level::Warn, None, message);
    }

    pub fn warning_id(&self, id: u32, message: &str) {
        self.emit(Level::Warn, Some(id), message);
    }

    pub fn error(&self, message: &str) {
        self.emit(Level::Error, None, message);
    }

    pub fn error_id(&self, id: u32, message: &str) {
        self.emit(Level::Error, Some(id), message);
    }
}

impl fmt::Debug for HleLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HleLog")
            .field("name", &self.name)
            .field("enabled", &self.enabled())
            .finish()
    }
}
