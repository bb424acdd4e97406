/// Class-2 (application) interrupt sources of a raw SPU.
pub mod class2 {
    /// Outbound interrupt mailbox written.
    pub const MAILBOX: u32 = 0x01;
    /// Stop-and-signal executed.
    pub const STOP: u32 = 0x02;
    /// Halted on a fault.
    pub const HALT: u32 = 0x04;
    /// Proxy DMA tag group completed.
    pub const DMA_TAG: u32 = 0x08;
    /// SPU read the last entry of the inbound mailbox.
    pub const IN_MBOX_THRESHOLD: u32 = 0x10;

    pub const ALL: u32 = MAILBOX | STOP | HALT | DMA_TAG | IN_MBOX_THRESHOLD;
}

/// Raw SPU class-2 interrupt status.
///
/// Sources latch into the pending word whether or not they are masked; the
/// mask only decides whether a raise is delivered to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpuInterrupts {
    mask: u32,
    pending: u32,
}

impl SpuInterrupts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn set_mask(&mut self, mask: u32) {
        self.mask = mask & class2::ALL;
    }

    /// Latch `source`. Returns true if it is unmasked.
    pub fn raise(&mut self, source: u32) -> bool {
        self.pending |= source & class2::ALL;
        self.mask & source != 0
    }

    /// Clear the given pending bits.
    pub fn acknowledge(&mut self, bits: u32) {
        self.pending &= !bits;
    }

    /// All latched sources.
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Latched sources that are unmasked.
    pub fn pending_masked(&self) -> u32 {
        self.pending & self.mask
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
