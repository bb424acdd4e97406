//! Emulation Session
//!
//! One emulated process: guest address space, object registry, HLE module
//! registry and the raw SPU slots. Every subsystem is reached through the
//! session instead of through process globals, so several sessions can
//! coexist (tests create one each).
//!
//! # API Reference
//!
//! ## Raw SPUs
//! - `create_raw_spu(index)`: Create a unit with the bundled decoder
//! - `create_raw_spu_with(index, decoder)`: Create a unit with a custom decoder
//! - `raw_spu(index)`: Get a live unit
//! - `destroy_raw_spu(index)`: Stop a unit and release its resources
//!
//! ## Guest Access
//! - `read32(addr)` / `write32(addr, value)`: MMIO-aware guest accesses
//! - `call(fid, args)`: Invoke an HLE import
//! - `call_or_enosys(fid, args)`: Invoke, reporting unresolved imports as `CELL_ENOSYS`

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use log::info;

use crate::config::{EmuSettings, MAIN_MEMORY_BASE};
use crate::error::{HleError, MemoryError, SpuError};
use crate::runtime::hle::error::CELL_ENOSYS;
use crate::runtime::hle::ModuleRegistry;
use crate::runtime::spu::regs::MAX_RAW_SPU;
use crate::runtime::spu::{RawSpuThread, SpuDecoder};
use crate::runtime::{AddressSpace, ObjectRegistry};

type RawSpuSlots = [Option<Arc<RawSpuThread>>; MAX_RAW_SPU as usize];

/// Context object for one emulated process.
pub struct EmulationSession {
    memory: Arc<AddressSpace>,
    objects: Arc<ObjectRegistry>,
    modules: Arc<ModuleRegistry>,
    raw_spus: Mutex<RawSpuSlots>,
}

impl EmulationSession {
    /// Create a session, mapping main memory as configured.
    pub fn new(settings: &EmuSettings) -> Result<Self> {
        let memory = Arc::new(AddressSpace::new());
        let size = settings.memory.main_memory_size;
        if size > 0 {
            memory.map(MAIN_MEMORY_BASE, size).with_context(|| {
                format!("Failed to map main memory at 0x{:08X}", MAIN_MEMORY_BASE)
            })?;
        }
        info!(
            "session created: main memory 0x{:08X}+0x{:X}, hle logging {}",
            MAIN_MEMORY_BASE, size, settings.hle.logging
        );

        Ok(Self {
            memory,
            objects: Arc::new(ObjectRegistry::new()),
            modules: Arc::new(ModuleRegistry::with_logging(settings.hle.logging)),
            raw_spus: Mutex::new(Default::default()),
        })
    }

    pub fn memory(&self) -> &Arc<AddressSpace> {
        &self.memory
    }

    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.objects
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    fn slots(&self) -> MutexGuard<'_, RawSpuSlots> {
        self.raw_spus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create raw SPU `index` with the bundled decoder.
    pub fn create_raw_spu(&self, index: u32) -> Result<Arc<RawSpuThread>, SpuError> {
        self.install(index, |memory, objects| RawSpuThread::new(index, memory, objects))
    }

    /// Create raw SPU `index` driven by `decoder`.
    pub fn create_raw_spu_with(
        &self,
        index: u32,
        decoder: Arc<dyn SpuDecoder>,
    ) -> Result<Arc<RawSpuThread>, SpuError> {
        self.install(index, |memory, objects| {
            RawSpuThread::with_decoder(index, memory, objects, decoder)
        })
    }

    fn install<F>(&self, index: u32, create: F) -> Result<Arc<RawSpuThread>, SpuError>
    where
        F: FnOnce(&Arc<AddressSpace>, &Arc<ObjectRegistry>) -> Result<Arc<RawSpuThread>, SpuError>,
    {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(index as usize)
            .ok_or(SpuError::InvalidIndex(index))?;
        if slot.is_some() {
            return Err(SpuError::IndexInUse(index));
        }
        let spu = create(&self.memory, &self.objects)?;
        *slot = Some(spu.clone());
        Ok(spu)
    }

    /// Live raw SPU `index`, if created.
    pub fn raw_spu(&self, index: u32) -> Option<Arc<RawSpuThread>> {
        self.slots().get(index as usize).cloned().flatten()
    }

    /// Shut raw SPU `index` down and free its slot.
    ///
    /// The unit stops, and its ID and mappings are released, even if callers
    /// still hold handles to it. Returns false if the slot was empty.
    pub fn destroy_raw_spu(&self, index: u32) -> bool {
        let spu = self
            .slots()
            .get_mut(index as usize)
            .and_then(Option::take);
        match spu {
            Some(spu) => {
                spu.shutdown();
                true
            }
            None => false,
        }
    }

    /// MMIO-aware 4-byte guest read.
    pub fn read32(&self, addr: u32) -> Result<u32, MemoryError> {
        self.memory.read32(addr)
    }

    /// MMIO-aware 4-byte guest write.
    pub fn write32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.memory.write32(addr, value)
    }

    /// Invoke the HLE import `fid` with the guest's argument registers.
    pub fn call(&self, fid: u32, args: [u64; 8]) -> Result<i64, HleError> {
        self.modules.dispatch(fid, args, &self.objects, &self.memory)
    }

    /// Like [`call`](Self::call), but an unresolved import returns
    /// `CELL_ENOSYS` to the guest.
    pub fn call_or_enosys(&self, fid: u32, args: [u64; 8]) -> i64 {
        match self.call(fid, args) {
            Ok(result) => result,
            Err(_) => CELL_ENOSYS,
        }
    }
}

impl Drop for EmulationSession {
    fn drop(&mut self) {
        let spus: Vec<_> = self
            .raw_spus
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for spu in spus {
            spu.shutdown();
        }
        self.modules.unload_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::hle::error::CELL_OK;
    use crate::runtime::hle::{function_id, ModuleBuilder};
    use crate::runtime::spu::regs::{raw_spu_reg_addr, SPU_NPC};
    use crate::runtime::spu::RAW_SPU_TAG;

    fn session() -> EmulationSession {
        let mut settings = EmuSettings::default();
        settings.memory.main_memory_size = 0x1_0000;
        EmulationSession::new(&settings).unwrap()
    }

    #[test]
    fn test_main_memory_mapped() {
        let session = session();
        session.write32(MAIN_MEMORY_BASE, 0x1234_5678).unwrap();
        assert_eq!(session.read32(MAIN_MEMORY_BASE).unwrap(), 0x1234_5678);
        assert!(session.read32(MAIN_MEMORY_BASE + 0x1_0000).is_err());
    }

    #[test]
    fn test_raw_spu_slots() {
        let session = session();
        let spu = session.create_raw_spu(3).unwrap();
        assert_eq!(spu.index(), 3);
        assert!(matches!(session.create_raw_spu(3), Err(SpuError::IndexInUse(3))));
        assert!(matches!(session.create_raw_spu(5), Err(SpuError::InvalidIndex(5))));
        assert!(session.raw_spu(3).is_some());
        assert!(session.raw_spu(0).is_none());

        session.write32(raw_spu_reg_addr(3, SPU_NPC), 0x80).unwrap();
        assert_eq!(session.read32(raw_spu_reg_addr(3, SPU_NPC)).unwrap(), 0x80);

        let id = spu.id();
        assert_eq!(session.objects().ids_with_tag(RAW_SPU_TAG), vec![id]);
        assert!(session.destroy_raw_spu(3));
        assert!(!session.destroy_raw_spu(3));
        assert!(spu.is_shut_down());
        assert!(session.objects().ids_with_tag(RAW_SPU_TAG).is_empty());
        assert!(session.read32(raw_spu_reg_addr(3, SPU_NPC)).is_err());

        // Recreating works while the old handle is still held.
        let again = session.create_raw_spu(3).unwrap();
        drop(spu);
        assert_eq!(session.objects().ids_with_tag(RAW_SPU_TAG), vec![again.id()]);
        assert_eq!(session.read32(raw_spu_reg_addr(3, SPU_NPC)).unwrap(), 0);
    }

    #[test]
    fn test_call_or_enosys() {
        let session = session();
        session
            .modules()
            .register_module(ModuleBuilder::new("sys_process").export("sys_process_getpid", |_| 0x100))
            .unwrap()
            .load();

        assert_eq!(session.call_or_enosys(function_id("sys_process_getpid"), [0; 8]), 0x100);
        assert_eq!(session.call_or_enosys(function_id("sys_process_exit"), [0; 8]), CELL_ENOSYS);
        assert_ne!(CELL_ENOSYS, CELL_OK);
    }

    #[test]
    fn test_zero_main_memory_maps_nothing() {
        let mut settings = EmuSettings::default();
        settings.memory.main_memory_size = 0;
        let session = EmulationSession::new(&settings).unwrap();
        assert_eq!(session.memory().region_count(), 0);
    }
}
