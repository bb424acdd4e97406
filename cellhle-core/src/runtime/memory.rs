//! Guest Address Space
//!
//! This module provides the guest-visible memory map of the emulator. It owns
//! a set of backed regions and a set of MMIO apertures, and it is the single
//! entry point through which any subsystem touches coprocessor registers.
//!
//! # Memory Map
//! The layout is assembled at runtime. A typical session contains:
//! - **0x00010000 - 0x0FFFFFFF**: Main memory
//! - **0xE0000000 + 0x100000 * n**: Raw SPU `n` local store (256KB)
//! - **0xE0040000 + 0x100000 * n**: Raw SPU `n` problem-state aperture
//!
//! # Address Translation
//! Guest memory is big-endian. `read32`/`write32` check the MMIO apertures
//! first and forward to the owning device; only addresses outside every
//! aperture fall through to backing memory.
//!
//! # API Reference
//!
//! ```rust,no_run
//! use cellhle_core::runtime::memory::AddressSpace;
//!
//! let memory = AddressSpace::new();
//! memory.map(0x0001_0000, 0x1000)?;
//! memory.write32(0x0001_0000, 0x12345678)?;
//! let value = memory.read32(0x0001_0000)?;
//! # Ok::<(), cellhle_core::error::MemoryError>(())
//! ```

use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock};

use log::trace;

use crate::error::MemoryError;

/// A contiguous block of guest memory.
///
/// Regions are shared between the address space and their owner (for
/// example a raw SPU's local store), so the byte storage sits behind its own
/// lock.
pub struct MemoryRegion {
    base: u32,
    size: u32,
    data: RwLock<Vec<u8>>,
}

impl MemoryRegion {
    /// Create a zero-filled region.
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            size,
            data: RwLock::new(vec![0u8; size as usize]),
        }
    }

    #[inline]
    pub fn base(&self) -> u32 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Guest range covered by this region. `end` is exclusive and computed
    /// in 64 bits so a region ending at 4GB is representable.
    pub fn range(&self) -> Range<u64> {
        let base = u64::from(self.base);
        base..base + u64::from(self.size())
    }

    /// Whether `[addr, addr + len)` lies entirely inside this region.
    #[inline]
    pub fn contains(&self, addr: u32, len: usize) -> bool {
        let range = self.range();
        let start = u64::from(addr);
        start >= range.start && start + len as u64 <= range.end
    }

    /// Copy bytes out of the region, starting `offset` bytes from its base.
    pub fn read(&self, offset: u32, dst: &mut [u8]) -> Result<(), MemoryError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        let src = data
            .get(start..start + dst.len())
            .ok_or(MemoryError::Unmapped {
                addr: self.base.wrapping_add(offset),
                len: dst.len(),
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Copy bytes into the region, starting `offset` bytes from its base.
    pub fn write(&self, offset: u32, src: &[u8]) -> Result<(), MemoryError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        let dst = data
            .get_mut(start..start + src.len())
            .ok_or(MemoryError::Unmapped {
                addr: self.base.wrapping_add(offset),
                len: src.len(),
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Read a big-endian word at `offset`.
    #[inline]
    pub fn read_u32(&self, offset: u32) -> Result<u32, MemoryError> {
        let mut bytes = [0u8; 4];
        self.read(offset, &mut bytes)?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Write a big-endian word at `offset`.
    #[inline]
    pub fn write_u32(&self, offset: u32, value: u32) -> Result<(), MemoryError> {
        self.write(offset, &value.to_be_bytes())
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("base", &format_args!("0x{:08X}", self.base))
            .field("size", &format_args!("0x{:X}", self.size))
            .finish()
    }
}

/// A device register window reachable through the address space.
pub trait MmioHandler: Send + Sync {
    /// First guest address of the aperture.
    fn base(&self) -> u32;

    /// Aperture length in bytes.
    fn size(&self) -> u32;

    /// Handle a 4-byte guest read at absolute address `addr`.
    fn read32(&self, addr: u32) -> Result<u32, MemoryError>;

    /// Handle a 4-byte guest write at absolute address `addr`.
    fn write32(&self, addr: u32, value: u32) -> Result<(), MemoryError>;

    /// Whether `addr` falls inside this aperture.
    fn contains(&self, addr: u32) -> bool {
        let start = u64::from(self.base());
        let addr = u64::from(addr);
        addr >= start && addr < start + u64::from(self.size())
    }
}

fn overlaps(a: Range<u64>, b: Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

fn handler_range(handler: &dyn MmioHandler) -> Range<u64> {
    let base = u64::from(handler.base());
    base..base + u64::from(handler.size())
}

/// The emulated guest address space.
///
/// Both tables sit behind read/write locks: mapping changes are exclusive,
/// accesses share the read side. Locks are never held while calling into an
/// MMIO handler, so handlers may call back into the address space.
#[derive(Default)]
pub struct AddressSpace {
    regions: RwLock<Vec<Arc<MemoryRegion>>>,
    apertures: RwLock<Vec<Arc<dyn MmioHandler>>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a fresh zero-filled region and return it.
    pub fn map(&self, base: u32, size: u32) -> Result<Arc<MemoryRegion>, MemoryError> {
        let region = Arc::new(MemoryRegion::new(base, size));
        self.map_region(region.clone())?;
        Ok(region)
    }

    /// Map an existing region, shared with its owner.
    pub fn map_region(&self, region: Arc<MemoryRegion>) -> Result<(), MemoryError> {
        let range = region.range();
        let overlap = MemoryError::Overlap {
            base: region.base(),
            size: region.size(),
        };
        if range.end > 1u64 << 32 {
            return Err(overlap);
        }
        // Lock order: regions before apertures.
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        let apertures = self.apertures.read().unwrap_or_else(PoisonError::into_inner);
        if regions.iter().any(|r| overlaps(r.range(), range.clone()))
            || apertures
                .iter()
                .any(|h| overlaps(handler_range(h.as_ref()), range.clone()))
        {
            return Err(overlap);
        }
        trace!(target: "memory", "mapped 0x{:08X}..0x{:08X}", range.start, range.end);
        regions.push(region);
        Ok(())
    }

    /// Remove the region starting at `base`.
    pub fn unmap(&self, base: u32) -> Result<Arc<MemoryRegion>, MemoryError> {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        let index = regions
            .iter()
            .position(|r| r.base() == base)
            .ok_or(MemoryError::NotMapped { base })?;
        Ok(regions.remove(index))
    }

    /// Route accesses in the handler's aperture to it.
    pub fn register_mmio(&self, handler: Arc<dyn MmioHandler>) -> Result<(), MemoryError> {
        let range = handler_range(handler.as_ref());
        let overlap = MemoryError::Overlap {
            base: handler.base(),
            size: handler.size(),
        };
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let mut apertures = self.apertures.write().unwrap_or_else(PoisonError::into_inner);
        if regions.iter().any(|r| overlaps(r.range(), range.clone()))
            || apertures
                .iter()
                .any(|h| overlaps(handler_range(h.as_ref()), range.clone()))
        {
            return Err(overlap);
        }
        trace!(target: "memory", "registered aperture 0x{:08X}..0x{:08X}", range.start, range.end);
        apertures.push(handler);
        Ok(())
    }

    /// Stop routing the aperture starting at `base`.
    pub fn unregister_mmio(&self, base: u32) -> Result<(), MemoryError> {
        let mut apertures = self.apertures.write().unwrap_or_else(PoisonError::into_inner);
        let index = apertures
            .iter()
            .position(|h| h.base() == base)
            .ok_or(MemoryError::NotMapped { base })?;
        apertures.remove(index);
        Ok(())
    }

    /// The handler whose aperture contains `addr`, if any.
    fn aperture_for(&self, addr: u32) -> Option<Arc<dyn MmioHandler>> {
        let apertures = self.apertures.read().unwrap_or_else(PoisonError::into_inner);
        apertures.iter().find(|h| h.contains(addr)).cloned()
    }

    /// Whether `addr` lies inside a registered MMIO aperture.
    pub fn is_mmio(&self, addr: u32) -> bool {
        self.aperture_for(addr).is_some()
    }

    /// Split `[addr, addr + len)` into per-region chunks.
    ///
    /// Fails without side effects unless every byte is backed. Adjacent
    /// regions are walked in order, so a range may span several of them.
    fn resolve_range(
        &self,
        addr: u32,
        len: usize,
    ) -> Result<Vec<(Arc<MemoryRegion>, u32, usize)>, MemoryError> {
        let unmapped = MemoryError::Unmapped { addr, len };
        if u64::from(addr) + len as u64 > 1u64 << 32 {
            return Err(unmapped);
        }
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let mut chunks = Vec::new();
        let mut cursor = u64::from(addr);
        let end = cursor + len as u64;
        while cursor < end {
            let region = regions
                .iter()
                .find(|r| r.range().contains(&cursor))
                .ok_or_else(|| unmapped.clone())?;
            let chunk_end = end.min(region.range().end);
            let offset = (cursor - u64::from(region.base())) as u32;
            chunks.push((region.clone(), offset, (chunk_end - cursor) as usize));
            cursor = chunk_end;
        }
        Ok(chunks)
    }

    /// Whether every byte of `[addr, addr + len)` is backed by memory.
    pub fn is_mapped(&self, addr: u32, len: usize) -> bool {
        self.resolve_range(addr, len).is_ok()
    }

    /// Copy a host buffer into guest memory at `dst`.
    ///
    /// Either the whole range is backed and copied, or nothing is written.
    pub fn copy_in(&self, dst: u32, src: &[u8]) -> Result<(), MemoryError> {
        let mut consumed = 0usize;
        for (region, offset, len) in self.resolve_range(dst, src.len())? {
            region.write(offset, &src[consumed..consumed + len])?;
            consumed += len;
        }
        Ok(())
    }

    /// Copy guest memory at `src` into a host buffer.
    pub fn copy_out(&self, dst: &mut [u8], src: u32) -> Result<(), MemoryError> {
        let mut filled = 0usize;
        for (region, offset, len) in self.resolve_range(src, dst.len())? {
            region.read(offset, &mut dst[filled..filled + len])?;
            filled += len;
        }
        Ok(())
    }

    /// MMIO-aware 4-byte read.
    pub fn read32(&self, addr: u32) -> Result<u32, MemoryError> {
        if let Some(handler) = self.aperture_for(addr) {
            return handler.read32(addr);
        }
        let mut bytes = [0u8; 4];
        self.copy_out(&mut bytes, addr)?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// MMIO-aware 4-byte write.
    pub fn write32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        if let Some(handler) = self.aperture_for(addr) {
            return handler.write32(addr, value);
        }
        self.copy_in(addr, &value.to_be_bytes())
    }

    /// Read `len` bytes into a new buffer.
    pub fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        self.copy_out(&mut buf, addr)?;
        Ok(buf)
    }

    /// Number of mapped regions.
    pub fn region_count(&self) -> usize {
        self.regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
