//! Keyed B-tree nodes.
//!
//! Leaf layout:
//! - magic: 4 bytes ("BTLF")
//! - version: 1 byte
//! - type_id: 1 byte
//! - records: nrec * record_size bytes
//! - checksum: 4 bytes
//!
//! Internal layout:
//! - magic: 4 bytes ("BTIN")
//! - version: 1 byte
//! - type_id: 1 byte
//! - records: nrec * record_size bytes
//! - child pointers: (nrec + 1) * 18 bytes (address 8, nrec 2, total 8)
//! - checksum: 4 bytes
//!
//! The record count is not stored in the node; it comes from the pointer
//! that leads to it. Nodes are zero-padded to the tree's node size.

use super::class::Bt2Class;
use super::header::{FORMAT_VERSION, NodePtr};
use bytes::{BufMut, BytesMut};
use chunkdex_common::{ADDR_SIZE, ChunkdexError, FileAddr, Result};

/// Leaf node signature.
pub const LEAF_MAGIC: &[u8; 4] = b"BTLF";

/// Internal node signature.
pub const INTERNAL_MAGIC: &[u8; 4] = b"BTIN";

/// Bytes of node prefix (magic, version, type).
const NODE_PREFIX: usize = 6;

/// Bytes of trailing checksum.
const CHECKSUM_SIZE: usize = 4;

/// Encoded size of one child pointer.
pub const CHILD_PTR_SIZE: usize = ADDR_SIZE + 2 + 8;

/// Returns the maximum records a leaf node can hold.
pub fn leaf_capacity(node_size: usize, record_size: usize) -> usize {
    node_size.saturating_sub(NODE_PREFIX + CHECKSUM_SIZE) / record_size.max(1)
}

/// Returns the maximum records an internal node can hold.
pub fn internal_capacity(node_size: usize, record_size: usize) -> usize {
    node_size.saturating_sub(NODE_PREFIX + CHECKSUM_SIZE + CHILD_PTR_SIZE)
        / (record_size + CHILD_PTR_SIZE)
}

/// In-memory form of one node. Leaves have no children.
#[derive(Debug, Clone)]
pub struct Bt2Node<R> {
    /// Sorted records.
    pub records: Vec<R>,
    /// Child pointers; `records.len() + 1` of them in an internal node.
    pub children: Vec<NodePtr>,
}

impl<R: Clone> Bt2Node<R> {
    /// Creates a leaf holding `records`.
    pub fn leaf(records: Vec<R>) -> Self {
        Self {
            records,
            children: Vec::new(),
        }
    }

    /// Returns the pointer describing this node at `addr`.
    pub fn pointer(&self, addr: FileAddr) -> NodePtr {
        let below: u64 = self.children.iter().map(|c| c.total).sum();
        NodePtr {
            addr,
            nrec: self.records.len() as u16,
            total: self.records.len() as u64 + below,
        }
    }

    /// Serializes the node into exactly `node_size` bytes.
    pub fn encode<C: Bt2Class<Record = R>>(
        &self,
        class: &C,
        node_size: usize,
        is_leaf: bool,
    ) -> Result<BytesMut> {
        if !is_leaf && self.children.len() != self.records.len() + 1 {
            return Err(ChunkdexError::Internal(format!(
                "internal node has {} records but {} children",
                self.records.len(),
                self.children.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(node_size);
        buf.put_slice(if is_leaf { LEAF_MAGIC } else { INTERNAL_MAGIC });
        buf.put_u8(FORMAT_VERSION);
        buf.put_u8(class.type_id());
        for record in &self.records {
            class.encode(record, &mut buf);
        }
        for child in &self.children {
            buf.put_slice(&FileAddr::encode(Some(child.addr)));
            buf.put_u16_le(child.nrec);
            buf.put_u64_le(child.total);
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);

        if buf.len() > node_size {
            return Err(ChunkdexError::Internal(format!(
                "node with {} records overflows {} byte node",
                self.records.len(),
                node_size
            )));
        }
        buf.resize(node_size, 0);
        Ok(buf)
    }

    /// Deserializes the node `ptr` points at.
    pub fn decode<C: Bt2Class<Record = R>>(
        raw: &[u8],
        ptr: NodePtr,
        class: &C,
        is_leaf: bool,
    ) -> Result<Self> {
        let nrec = ptr.nrec as usize;
        let record_size = class.record_size();
        let nchildren = if is_leaf { 0 } else { nrec + 1 };
        let body = NODE_PREFIX + nrec * record_size + nchildren * CHILD_PTR_SIZE;

        if raw.len() < body + CHECKSUM_SIZE {
            return Err(ChunkdexError::Corrupt(format!(
                "node at {} is too small for {} records",
                ptr.addr, nrec
            )));
        }
        let magic = if is_leaf { LEAF_MAGIC } else { INTERNAL_MAGIC };
        if &raw[0..4] != magic {
            return Err(ChunkdexError::Corrupt(format!(
                "bad keyed B-tree node signature at {}",
                ptr.addr
            )));
        }

        let expected = u32::from_le_bytes([raw[body], raw[body + 1], raw[body + 2], raw[body + 3]]);
        let actual = crc32fast::hash(&raw[..body]);
        if expected != actual {
            return Err(ChunkdexError::ChecksumMismatch {
                addr: ptr.addr.get(),
                expected,
                actual,
            });
        }
        if raw[4] != FORMAT_VERSION || raw[5] != class.type_id() {
            return Err(ChunkdexError::Corrupt(format!(
                "node at {} has version {} type {}, expected type {}",
                ptr.addr,
                raw[4],
                raw[5],
                class.type_id()
            )));
        }

        let mut offset = NODE_PREFIX;
        let mut records = Vec::with_capacity(nrec);
        for _ in 0..nrec {
            records.push(class.decode(&raw[offset..offset + record_size])?);
            offset += record_size;
        }

        let mut children = Vec::with_capacity(nchildren);
        for i in 0..nchildren {
            let addr = FileAddr::decode(&raw[offset..offset + ADDR_SIZE]).ok_or_else(|| {
                ChunkdexError::Corrupt(format!("node at {} has undefined child {}", ptr.addr, i))
            })?;
            let nrec = u16::from_le_bytes([raw[offset + 8], raw[offset + 9]]);
            let total = u64::from_le_bytes(
                raw[offset + 10..offset + 18]
                    .try_into()
                    .map_err(|_| ChunkdexError::corrupt("child pointer record count"))?,
            );
            children.push(NodePtr { addr, nrec, total });
            offset += CHILD_PTR_SIZE;
        }

        Ok(Self { records, children })
    }
}
