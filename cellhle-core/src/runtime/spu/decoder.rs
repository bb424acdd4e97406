//! SPU instruction decoder seam.
//!
//! The raw SPU thread drives a decoder one instruction at a time. Instruction
//! semantics live behind this trait; the bundled [`BasicDecoder`] only knows
//! enough to run control-flow smoke tests.

use log::trace;

use super::context::SpuContext;
use crate::error::SpuFault;
use crate::runtime::memory::MemoryRegion;

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Instruction retired, keep running.
    Continue,
    /// Stop-and-signal with the given 14-bit signal code. `pc` already points
    /// past the stop instruction.
    Stop(u32),
}

/// Executes a single SPU instruction against the unit's state.
pub trait SpuDecoder: Send + Sync {
    fn step(&self, ctx: &mut SpuContext, ls: &MemoryRegion) -> Result<Step, SpuFault>;
}

const OP_STOP: u32 = 0x000;
const OP_LNOP: u32 = 0x001;
const OP_NOP: u32 = 0x201;

/// Decoder recognising `stop`, `lnop` and `nop`.
///
/// Any other word is reported as an invalid instruction.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicDecoder;

impl SpuDecoder for BasicDecoder {
    fn step(&self, ctx: &mut SpuContext, ls: &MemoryRegion) -> Result<Step, SpuFault> {
        let pc = ctx.pc;
        let word = ls
            .read_u32(pc)
            .map_err(|_| SpuFault::LocalStore { pc })?;

        // 11-bit RR-form primary opcode.
        match word >> 21 {
            OP_STOP => {
                let signal = word & 0x3FFF;
                trace!(target: "raw_spu", "stop 0x{:04X} at 0x{:05X}", signal, pc);
                ctx.advance();
                Ok(Step::Stop(signal))
            }
            OP_LNOP | OP_NOP => {
                ctx.advance();
                Ok(Step::Continue)
            }
            _ => Err(SpuFault::InvalidInstruction { pc, word }),
        }
    }
}

/// Instruction words understood by [`BasicDecoder`], for building test images.
pub mod encode {
    pub const NOP: u32 = 0x4020_0000;
    pub const LNOP: u32 = 0x0020_0000;

    /// `stop` with a 14-bit signal code.
    pub const fn stop(signal: u32) -> u32 {
        signal & 0x3FFF
    }
}
