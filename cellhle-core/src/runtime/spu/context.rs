// SPU architectural state
use smallvec::SmallVec;

use super::regs::{LS_ADDR_MASK, SPU_IN_MBOX_DEPTH};

/// Architectural state of one SPU.
///
/// Everything here survives a pause: the execution thread only touches it
/// between instructions, under the unit's control lock.
#[derive(Debug, Clone)]
pub struct SpuContext {
    pub gpr: [u128; 128],          // General Purpose Registers ($0-$127)
    pub pc: u32,                   // Program Counter (local store address)
    pub interrupt_enable: bool,    // NPC bit 0
    pub in_mbox: SmallVec<[u32; SPU_IN_MBOX_DEPTH]>, // PPU -> SPU
    pub out_mbox: Option<u32>,     // SPU -> PPU
    pub out_intr_mbox: Option<u32>,
    pub signal1: u32,
    pub signal2: u32,
    pub retired: u64,              // Instructions completed
}

impl SpuContext {
    pub fn new() -> Self {
        Self {
            gpr: [0; 128],
            pc: 0,
            interrupt_enable: false,
            in_mbox: SmallVec::new(),
            out_mbox: None,
            out_intr_mbox: None,
            signal1: 0,
            signal2: 0,
            retired: 0,
        }
    }

    pub fn get_register(&self, reg: u8) -> u128 {
        if reg < 128 {
            self.gpr[reg as usize]
        } else {
            0
        }
    }

    pub fn set_register(&mut self, reg: u8, value: u128) {
        if reg < 128 {
            self.gpr[reg as usize] = value;
        }
    }

    /// Preferred slot (word 0, most significant) of a register.
    pub fn preferred_slot(&self, reg: u8) -> u32 {
        (self.get_register(reg) >> 96) as u32
    }

    /// Value the NPC register reads back as.
    pub fn npc(&self) -> u32 {
        self.pc | u32::from(self.interrupt_enable)
    }

    /// Apply a write to the NPC register.
    pub fn set_npc(&mut self, value: u32) {
        self.pc = value & LS_ADDR_MASK;
        self.interrupt_enable = value & 1 != 0;
    }

    /// Step the program counter past the current instruction.
    pub fn advance(&mut self) {
        self.pc = self.pc.wrapping_add(4) & LS_ADDR_MASK;
        self.retired = self.retired.wrapping_add(1);
    }

    /// SPU-side read of the inbound mailbox channel.
    pub fn read_in_mbox(&mut self) -> Option<u32> {
        if self.in_mbox.is_empty() {
            None
        } else {
            Some(self.in_mbox.remove(0))
        }
    }

    /// SPU-side write of the outbound mailbox channel. Fails if it is full.
    pub fn write_out_mbox(&mut self, value: u32) -> bool {
        if self.out_mbox.is_some() {
            return false;
        }
        self.out_mbox = Some(value);
        true
    }

    /// SPU-side write of the outbound interrupt mailbox. Fails if it is full.
    pub fn write_out_intr_mbox(&mut self, value: u32) -> bool {
        if self.out_intr_mbox.is_some() {
            return false;
        }
        self.out_intr_mbox = Some(value);
        true
    }

    /// `SPU_MBox_Status` encoding.
    pub fn mbox_status(&self) -> u32 {
        let out_count = u32::from(self.out_mbox.is_some());
        let in_free = (SPU_IN_MBOX_DEPTH - self.in_mbox.len()) as u32;
        let out_intr_count = u32::from(self.out_intr_mbox.is_some());
        out_count | (in_free << 8) | (out_intr_count << 16)
    }

    /// Return to the power-on state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for SpuContext {
    fn default() -> Self {
        Self::new()
    }
}
