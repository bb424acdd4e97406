//! Error Types
//!
//! This module provides the error types for the emulation core using `thiserror`.
//!
//! # Error Categories
//! - **Memory errors**: unmapped guest ranges, overlapping mappings, MMIO routing
//! - **ID errors**: stale or foreign kernel object handles
//! - **HLE errors**: unresolved imports and dispatch-table conflicts
//! - **SPU errors**: raw SPU creation and teardown failures
//! - **SPU faults**: unrecoverable conditions raised by an instruction decoder
//!
//! Guest-triggerable conditions are always returned as values. None of these
//! types are meant to abort the host process.

use thiserror::Error;

/// Guest address space errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The requested range is not fully backed by mapped memory.
    #[error("guest range 0x{addr:08X}+0x{len:X} is not mapped")]
    Unmapped { addr: u32, len: usize },

    /// A new mapping or aperture would overlap an existing one.
    #[error("mapping 0x{base:08X}+0x{size:X} overlaps an existing mapping")]
    Overlap { base: u32, size: u32 },

    /// `unmap`/`unregister_mmio` was called for a base that has no mapping.
    #[error("no mapping at 0x{base:08X}")]
    NotMapped { base: u32 },

    /// An MMIO access landed on an offset the device does not implement.
    #[error("unhandled MMIO register at 0x{addr:08X}")]
    UnhandledRegister { addr: u32 },

    /// An MMIO access was routed to a device that does not own the address.
    ///
    /// This is a routing defect in the host, not a guest error.
    #[error("MMIO access 0x{addr:08X} routed to aperture at 0x{base:08X}")]
    Misrouted { addr: u32, base: u32 },
}

/// Object registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID was never issued, was released, or its object is gone.
    #[error("object id {0} not found")]
    NotFound(u32),

    /// The ID is live but refers to an object of a different type.
    #[error("object id {id} ({tag}) has an unexpected type")]
    TypeMismatch { id: u32, tag: String },
}

/// High-level emulation (module and dispatch table) errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HleError {
    /// The guest imported a function ID with no active handler.
    #[error("unimplemented import 0x{0:08X}")]
    UnresolvedImport(u32),

    /// Another export already owns this function ID in the dispatch table.
    #[error("function 0x{0:08X} is already active")]
    AlreadyActive(u32),

    /// The module does not export the requested function ID.
    #[error("module {module} does not export 0x{fid:08X}")]
    NotExported { module: String, fid: u32 },

    /// A module declared two exports resolving to the same function ID.
    #[error("module {module} exports {name} with duplicate id 0x{fid:08X}")]
    DuplicateExport { module: String, name: String, fid: u32 },

    /// A module with the same name or numeric ID is already registered.
    #[error("module {0} is already registered")]
    DuplicateModule(String),
}

/// Raw SPU lifecycle errors.
#[derive(Error, Debug)]
pub enum SpuError {
    #[error("raw SPU index {0} is out of range")]
    InvalidIndex(u32),

    #[error("raw SPU index {0} is already in use")]
    IndexInUse(u32),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("failed to spawn raw SPU thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Unrecoverable conditions raised while executing SPU code.
///
/// A fault moves the unit to the Stopped state and sets the halt status bit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpuFault {
    #[error("invalid instruction 0x{word:08X} at pc 0x{pc:05X}")]
    InvalidInstruction { pc: u32, word: u32 },

    #[error("local store access fault at pc 0x{pc:05X}")]
    LocalStore { pc: u32 },
}
