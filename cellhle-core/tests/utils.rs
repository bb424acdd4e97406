//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use cellhle_core::config::EmuSettings;
use cellhle_core::runtime::spu::decoder::encode;
use cellhle_core::runtime::spu::regs::raw_spu_reg_addr;
use cellhle_core::runtime::spu::RawSpuThread;
use cellhle_core::EmulationSession;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Session with a small main memory so tests stay cheap.
pub fn session() -> EmulationSession {
    let mut settings = EmuSettings::default();
    settings.memory.main_memory_size = 0x10_0000;
    EmulationSession::new(&settings).unwrap()
}

/// Write big-endian instruction words to the start of a unit's local store.
pub fn load_program(spu: &RawSpuThread, words: &[u32]) {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    spu.local_store().write(0, &bytes).unwrap();
}

/// Fill the whole local store with `nop`, giving an endless loop.
pub fn fill_with_nops(spu: &RawSpuThread) {
    let words = vec![encode::NOP; spu.local_store().size() as usize / 4];
    load_program(spu, &words);
}

/// Problem-state register address of unit `spu`.
pub fn reg(spu: &RawSpuThread, offset: u32) -> u32 {
    raw_spu_reg_addr(spu.index(), offset)
}

/// Poll `condition` until it holds or [`TIMEOUT`] elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
