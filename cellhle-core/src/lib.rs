//! Cell HLE Core
//!
//! Emulation core for the machinery that surrounds a Cell console's
//! processors: raw SPU coprocessors driven through MMIO, the kernel object
//! ID registry, and high-level emulation of system library imports.
//!
//! # Layout
//! - [`runtime`]: address space, object IDs, raw SPUs, HLE modules
//! - [`session`]: one emulated process wiring the runtime together
//! - [`config`]: persisted emulator settings
//! - [`error`]: error types

pub mod config;
pub mod error;
pub mod runtime;
pub mod session;

pub use config::EmuSettings;
pub use session::EmulationSession;
