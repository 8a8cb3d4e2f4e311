//! File addresses for chunkdex storage.
//!
//! Every persistent structure is located by a byte offset into the backing
//! file. On disk an address is always 8 bytes little-endian; the all-ones
//! pattern encodes "undefined" so that an unset root or sibling pointer
//! round-trips through `Option<FileAddr>`.

use serde::{Deserialize, Serialize};

/// Width in bytes of an encoded file address.
pub const ADDR_SIZE: usize = 8;

/// Raw value reserved for the undefined address.
pub const UNDEFINED_ADDR: u64 = u64::MAX;

/// Byte offset of a structure or chunk within the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileAddr(u64);

impl FileAddr {
    /// Creates a file address. The undefined sentinel is not a valid address.
    pub fn new(offset: u64) -> Option<Self> {
        if offset == UNDEFINED_ADDR {
            None
        } else {
            Some(Self(offset))
        }
    }

    /// Returns the raw byte offset.
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }

    /// Returns the address `len` bytes past this one, if representable.
    pub fn checked_add(self, len: u64) -> Option<Self> {
        self.0.checked_add(len).and_then(Self::new)
    }

    /// Encodes an optional address as 8 little-endian bytes.
    pub fn encode(addr: Option<FileAddr>) -> [u8; ADDR_SIZE] {
        addr.map_or(UNDEFINED_ADDR, FileAddr::get).to_le_bytes()
    }

    /// Decodes an optional address from the first 8 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Option<FileAddr> {
        let raw = u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]);
        Self::new(raw)
    }
}

impl std::fmt::Display for FileAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}
