//! Classic B-tree node format.
//!
//! Layout (`BTreeShared::node_size` bytes):
//! - magic: 4 bytes ("TREE")
//! - node_type: 1 byte
//! - level: 1 byte (0 = leaf)
//! - entries_used: 2 bytes (number of children)
//! - left: 8 bytes (left sibling address, all ones if none)
//! - right: 8 bytes (right sibling address, all ones if none)
//! - key0, child0, key1, child1, ..., child(2K-1), key(2K)
//!
//! Only `entries_used` children and `entries_used + 1` keys are meaningful;
//! the rest of the node is zero-filled.

use super::class::{BTreeClass, BTreeShared};
use super::constants::{NODE_HEADER_SIZE, NODE_MAGIC};
use bytes::{BufMut, BytesMut};
use chunkdex_common::{ADDR_SIZE, ChunkdexError, FileAddr, Result};

/// One node of a classic B-tree.
#[derive(Debug, Clone)]
pub struct BTreeNode<K> {
    /// Level in the tree (0 = leaf).
    pub level: u8,
    /// Left sibling at the same level.
    pub left: Option<FileAddr>,
    /// Right sibling at the same level.
    pub right: Option<FileAddr>,
    /// Bounding keys. Holds `children.len() + 1` entries unless empty.
    pub keys: Vec<K>,
    /// Child addresses.
    pub children: Vec<FileAddr>,
}

impl<K: Clone> BTreeNode<K> {
    /// Creates an empty node at `level`.
    pub fn new(level: u8) -> Self {
        Self {
            level,
            left: None,
            right: None,
            keys: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Returns the number of children.
    #[inline]
    pub fn nchildren(&self) -> usize {
        self.children.len()
    }

    /// Returns true if this is a leaf node.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Serializes the node into a buffer of exactly `shared.node_size` bytes.
    pub fn encode<C: BTreeClass<Key = K>>(&self, class: &C, shared: &BTreeShared) -> Result<BytesMut> {
        let n = self.children.len();
        if n > shared.two_k {
            return Err(ChunkdexError::Internal(format!(
                "node has {} children, limit is {}",
                n, shared.two_k
            )));
        }
        if n > 0 && self.keys.len() != n + 1 {
            return Err(ChunkdexError::Internal(format!(
                "node has {} children but {} keys",
                n,
                self.keys.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(shared.node_size);
        buf.put_slice(NODE_MAGIC);
        buf.put_u8(shared.node_type);
        buf.put_u8(self.level);
        buf.put_u16_le(n as u16);
        buf.put_slice(&FileAddr::encode(self.left));
        buf.put_slice(&FileAddr::encode(self.right));

        if n > 0 {
            for (key, child) in self.keys.iter().zip(&self.children) {
                let before = buf.len();
                class.encode_key(key, &mut buf);
                debug_assert_eq!(buf.len() - before, shared.key_size);
                buf.put_slice(&FileAddr::encode(Some(*child)));
            }
            class.encode_key(&self.keys[n], &mut buf);
        }

        buf.resize(shared.node_size, 0);
        Ok(buf)
    }

    /// Deserializes a node read from `addr`.
    pub fn decode<C: BTreeClass<Key = K>>(
        raw: &[u8],
        addr: FileAddr,
        class: &C,
        shared: &BTreeShared,
    ) -> Result<Self> {
        if raw.len() < shared.node_size {
            return Err(ChunkdexError::Corrupt(format!(
                "node at {} is {} bytes, expected {}",
                addr,
                raw.len(),
                shared.node_size
            )));
        }
        if &raw[0..4] != NODE_MAGIC {
            return Err(ChunkdexError::Corrupt(format!(
                "bad node signature at {}",
                addr
            )));
        }
        if raw[4] != shared.node_type {
            return Err(ChunkdexError::Corrupt(format!(
                "node at {} has type {}, expected {}",
                addr, raw[4], shared.node_type
            )));
        }

        let level = raw[5];
        let n = u16::from_le_bytes([raw[6], raw[7]]) as usize;
        if n > shared.two_k {
            return Err(ChunkdexError::Corrupt(format!(
                "node at {} claims {} children, limit is {}",
                addr, n, shared.two_k
            )));
        }
        let left = FileAddr::decode(&raw[8..16]);
        let right = FileAddr::decode(&raw[16..24]);

        let mut node = Self {
            level,
            left,
            right,
            keys: Vec::with_capacity(n + 1),
            children: Vec::with_capacity(n),
        };
        if n == 0 {
            return Ok(node);
        }

        let stride = shared.key_size + ADDR_SIZE;
        let mut offset = NODE_HEADER_SIZE;
        for i in 0..n {
            node.keys.push(class.decode_key(&raw[offset..offset + shared.key_size])?);
            let child_off = offset + shared.key_size;
            let child = FileAddr::decode(&raw[child_off..child_off + ADDR_SIZE]).ok_or_else(|| {
                ChunkdexError::Corrupt(format!("node at {} has undefined child {}", addr, i))
            })?;
            node.children.push(child);
            offset += stride;
        }
        node.keys.push(class.decode_key(&raw[offset..offset + shared.key_size])?);

        Ok(node)
    }
}
