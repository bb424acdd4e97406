//! Memory Stream
//!
//! A seekable byte stream over a window of the guest address space. Reads and
//! writes are clamped to the window: a short or zero count at the end of the
//! window is a normal result, not an error.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use log::debug;

use super::memory::AddressSpace;

/// Stream over `[addr, addr + size)` of guest memory.
///
/// A size of zero opens an unbounded stream that ends with the address space.
pub struct MemoryStream {
    memory: Arc<AddressSpace>,
    addr: u32,
    size: u64,
    pos: u64,
}

impl MemoryStream {
    pub fn new(memory: Arc<AddressSpace>, addr: u32, size: u64) -> Self {
        let mut stream = Self {
            memory,
            addr,
            size: 0,
            pos: 0,
        };
        stream.open(addr, size);
        stream
    }

    /// Retarget the stream and rewind it.
    pub fn open(&mut self, addr: u32, size: u64) {
        self.addr = addr;
        self.size = if size == 0 { u64::MAX } else { size };
        self.pos = 0;
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Bytes left before the end of the window, capped at `wanted`.
    fn clamp(&self, wanted: usize) -> usize {
        let remaining = self.size.saturating_sub(self.pos);
        wanted.min(usize::try_from(remaining).unwrap_or(usize::MAX))
    }

    /// Guest address of the current position, if it is representable.
    fn cursor(&self) -> Option<u32> {
        u32::try_from(u64::from(self.addr) + self.pos).ok()
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.clamp(buf.len());
        if count == 0 {
            return Ok(0);
        }
        let Some(src) = self.cursor() else {
            return Ok(0);
        };
        match self.memory.copy_out(&mut buf[..count], src) {
            Ok(()) => {
                self.pos += count as u64;
                Ok(count)
            }
            Err(err) => {
                debug!(target: "memory", "stream read refused: {}", err);
                Ok(0)
            }
        }
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.clamp(buf.len());
        if count == 0 {
            return Ok(0);
        }
        let Some(dst) = self.cursor() else {
            return Ok(0);
        };
        match self.memory.copy_in(dst, &buf[..count]) {
            Ok(()) => {
                self.pos += count as u64;
                Ok(count)
            }
            Err(err) => {
                debug!(target: "memory", "stream write refused: {}", err);
                Ok(0)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => {
                self.pos = offset;
                return Ok(offset);
            }
            SeekFrom::Current(delta) => (self.pos, delta),
            SeekFrom::End(delta) => (self.size, delta),
        };
        let target = base.checked_add_signed(delta).ok_or_else(|| {
            let message = if delta < 0 {
                "seek before start of stream"
            } else {
                "seek position overflows"
            };
            io::Error::new(io::ErrorKind::InvalidInput, message)
        })?;
        self.pos = target;
        Ok(target)
    }
}
