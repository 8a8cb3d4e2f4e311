//! Keyed B-tree header.
//!
//! Layout (38 bytes):
//! - magic: 4 bytes ("BTHD")
//! - version: 1 byte
//! - type_id: 1 byte
//! - node_size: 4 bytes
//! - record_size: 2 bytes
//! - depth: 2 bytes
//! - split_percent: 1 byte
//! - merge_percent: 1 byte
//! - root address: 8 bytes (all ones if the tree is empty)
//! - root record count: 2 bytes
//! - total record count: 8 bytes
//! - checksum: 4 bytes (CRC32 of everything before it)

use bytes::{BufMut, BytesMut};
use chunkdex_common::{ChunkdexError, FileAddr, Result};

/// Header signature.
pub const HEADER_MAGIC: &[u8; 4] = b"BTHD";

/// Encoded header size.
pub const HEADER_SIZE: usize = 38;

/// On-disk format version for headers and nodes.
pub const FORMAT_VERSION: u8 = 0;

/// Pointer from a parent (or the header) to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePtr {
    /// Node address.
    pub addr: FileAddr,
    /// Records stored directly in the node.
    pub nrec: u16,
    /// Records in the node and everything below it.
    pub total: u64,
}

/// Decoded header of one keyed B-tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bt2Header {
    /// Record class identifier.
    pub type_id: u8,
    /// Size of every node.
    pub node_size: u32,
    /// Size of one encoded record.
    pub record_size: u16,
    /// Levels below the root (0 = the root is a leaf).
    pub depth: u16,
    /// Fill percentage at which nodes split.
    pub split_percent: u8,
    /// Fill percentage below which nodes merge.
    pub merge_percent: u8,
    /// Root node, if the tree holds any record.
    pub root: Option<NodePtr>,
}

impl Bt2Header {
    /// Total records in the tree.
    pub fn total_records(&self) -> u64 {
        self.root.map_or(0, |root| root.total)
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(HEADER_MAGIC);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u8(self.type_id);
        buf.put_u32_le(self.node_size);
        buf.put_u16_le(self.record_size);
        buf.put_u16_le(self.depth);
        buf.put_u8(self.split_percent);
        buf.put_u8(self.merge_percent);
        buf.put_slice(&FileAddr::encode(self.root.map(|r| r.addr)));
        buf.put_u16_le(self.root.map_or(0, |r| r.nrec));
        buf.put_u64_le(self.total_records());
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Deserializes a header read from `addr`.
    pub fn from_bytes(raw: &[u8], addr: FileAddr) -> Result<Self> {
        if raw.len() < HEADER_SIZE {
            return Err(ChunkdexError::Corrupt(format!(
                "keyed B-tree header at {} is truncated",
                addr
            )));
        }
        if &raw[0..4] != HEADER_MAGIC {
            return Err(ChunkdexError::Corrupt(format!(
                "bad keyed B-tree header signature at {}",
                addr
            )));
        }

        let expected = u32::from_le_bytes([raw[34], raw[35], raw[36], raw[37]]);
        let actual = crc32fast::hash(&raw[..HEADER_SIZE - 4]);
        if expected != actual {
            return Err(ChunkdexError::ChecksumMismatch {
                addr: addr.get(),
                expected,
                actual,
            });
        }
        if raw[4] != FORMAT_VERSION {
            return Err(ChunkdexError::Corrupt(format!(
                "keyed B-tree header at {} has unknown version {}",
                addr, raw[4]
            )));
        }

        let root_addr = FileAddr::decode(&raw[16..24]);
        let nrec = u16::from_le_bytes([raw[24], raw[25]]);
        let total = u64::from_le_bytes(raw[26..34].try_into().map_err(|_| {
            ChunkdexError::corrupt("keyed B-tree header record count")
        })?);

        Ok(Self {
            type_id: raw[5],
            node_size: u32::from_le_bytes([raw[6], raw[7], raw[8], raw[9]]),
            record_size: u16::from_le_bytes([raw[10], raw[11]]),
            depth: u16::from_le_bytes([raw[12], raw[13]]),
            split_percent: raw[14],
            merge_percent: raw[15],
            root: root_addr.map(|addr| NodePtr { addr, nrec, total }),
        })
    }
}
