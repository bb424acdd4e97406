//! Raw SPU coprocessors.

pub mod context;
pub mod decoder;
pub mod interrupt;
pub mod raw;
pub mod regs;

pub use context::SpuContext;
pub use decoder::{BasicDecoder, SpuDecoder, Step};
pub use interrupt::SpuInterrupts;
pub use raw::{RawSpuThread, RunState, RAW_SPU_TAG};
