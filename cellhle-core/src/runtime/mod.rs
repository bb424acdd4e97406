//! Emulation Runtime
//!
//! Guest memory, kernel object IDs, raw SPU coprocessors and HLE module
//! dispatch. Each piece is an explicit value; [`crate::session`] wires them
//! together for one emulated process.

pub mod hle;
pub mod id;
pub mod memory;
pub mod spu;
pub mod stream;

pub use id::ObjectRegistry;
pub use memory::{AddressSpace, MemoryRegion, MmioHandler};
pub use stream::MemoryStream;
