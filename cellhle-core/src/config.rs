// Settings persistence
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Guest address main memory is mapped at.
pub const MAIN_MEMORY_BASE: u32 = 0x0001_0000;

/// Emulator settings, persisted as JSON.
///
/// Every section falls back to its defaults when missing, so files written
/// by older versions keep loading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmuSettings {
    pub cpu: CpuSettings,
    pub gs: GsSettings,
    pub pad: PadSettings,
    pub hle: HleSettings,
    pub memory: MemorySettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuSettings {
    pub decoder_mode: DecoderMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GsSettings {
    pub render_mode: RenderMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PadSettings {
    pub handler_mode: PadHandlerMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HleSettings {
    /// Emit module notices. Warnings and errors are always logged.
    pub logging: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Size of the main memory region mapped at [`MAIN_MEMORY_BASE`].
    pub main_memory_size: u32,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            main_memory_size: 0x0FFF_0000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderMode {
    Disasm,
    InterpreterDisasm,
    #[default]
    Interpreter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    #[default]
    Null,
    Opengl,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadHandlerMode {
    #[default]
    Null,
    Keyboard,
}

impl EmuSettings {
    /// Platform settings location, `<config dir>/cellhle/settings.json`.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("cellhle");
        path.push("settings.json");
        path
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        Ok(settings)
    }

    /// Write settings to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings file {}", path.display()))?;
        Ok(())
    }
}
