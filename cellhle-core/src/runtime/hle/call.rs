// HLE call context
use std::any::Any;
use std::sync::Arc;

use super::log::HleLog;
use crate::error::IdError;
use crate::runtime::id::ObjectRegistry;
use crate::runtime::memory::AddressSpace;

/// Guest-visible return codes.
pub mod error {
    pub const CELL_OK: i64 = 0;
    pub const CELL_EINVAL: i64 = 0x8001_0002u32 as i64;
    pub const CELL_ENOSYS: i64 = 0x8001_0003u32 as i64;
    pub const CELL_ESRCH: i64 = 0x8001_0005u32 as i64;
    pub const CELL_EFAULT: i64 = 0x8001_000Du32 as i64;
}

/// Host implementation of a guest library function.
pub type HleHandler = Arc<dyn Fn(&HleCall<'_>) -> i64 + Send + Sync>;

/// Arguments and services handed to an HLE handler.
pub struct HleCall<'a> {
    /// Argument registers (r3-r10).
    pub args: [u64; 8],
    log: &'a HleLog,
    objects: &'a ObjectRegistry,
    memory: &'a AddressSpace,
}

impl<'a> HleCall<'a> {
    pub fn new(
        log: &'a HleLog,
        args: [u64; 8],
        objects: &'a ObjectRegistry,
        memory: &'a AddressSpace,
    ) -> Self {
        Self {
            args,
            log,
            objects,
            memory,
        }
    }

    /// Argument `n` truncated to 32 bits. Out-of-range indices read as zero.
    pub fn arg32(&self, n: usize) -> u32 {
        self.args.get(n).copied().unwrap_or(0) as u32
    }

    /// Logger of the module that owns the called function.
    pub fn log(&self) -> &HleLog {
        self.log
    }

    pub fn objects(&self) -> &ObjectRegistry {
        self.objects
    }

    pub fn memory(&self) -> &AddressSpace {
        self.memory
    }

    /// Whether `id` is live and belongs to the calling module.
    pub fn check_id(&self, id: u32) -> bool {
        self.objects.check_id_tagged(id, self.log.name())
    }

    /// Resolve a handle that must belong to the calling module.
    pub fn lookup<T: Any + Send + Sync>(&self, id: u32) -> Result<Arc<T>, IdError> {
        if !self.check_id(id) {
            return Err(IdError::NotFound(id));
        }
        self.objects.lookup_as(id)
    }

    /// Read a NUL-terminated string from guest memory.
    ///
    /// Stops at the first unmapped byte or after `max_len` bytes.
    pub fn read_c_string(&self, addr: u32, max_len: usize) -> String {
        let mut result = Vec::new();
        let mut byte = [0u8; 1];
        let mut offset = addr;
        while result.len() < max_len {
            if self.memory.copy_out(&mut byte, offset).is_err() || byte[0] == 0 {
                break;
            }
            result.push(byte[0]);
            offset = offset.wrapping_add(1);
        }
        String::from_utf8_lossy(&result).into_owned()
    }
}
