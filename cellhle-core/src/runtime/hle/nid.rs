//! Function ID derivation.
//!
//! Guest binaries import library functions by a 32-bit ID instead of by
//! name. The ID is the first four bytes of SHA-1 over the export name
//! followed by a fixed 16-byte suffix, read little-endian. The algorithm must
//! stay bit-exact: existing binaries embed the resulting values.

use sha1::{Digest, Sha1};

/// Suffix appended to every export name before hashing.
pub const NID_SUFFIX: [u8; 16] = [
    0x67, 0x59, 0x65, 0x99, 0x04, 0x25, 0x04, 0x90, 0x56, 0x64, 0x27, 0x49, 0x94, 0x89, 0x74, 0x1A,
];

/// Compute the function ID of an export name.
pub fn function_id(name: &str) -> u32 {
    let mut hasher = Sha1::new();
    hasher.update(name.as_bytes());
    hasher.update(NID_SUFFIX);
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
