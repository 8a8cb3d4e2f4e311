//! Key classes and shared layout for the classic B-tree.
//!
//! The engine knows nothing about what its keys mean. A `BTreeClass`
//! supplies the key codec, the orderings, and the leaf callbacks that create,
//! update, look up and remove whatever the leaf children point at.
//!
//! Keys are left-critical: `key[i]` describes the object stored at
//! `child[i]`, and `key[i + 1]` bounds it from the right.

use super::constants::NODE_HEADER_SIZE;
use super::types::{InsertOp, KeyBracket};
use crate::file::StorageFile;
use bytes::BytesMut;
use std::cmp::Ordering;
use chunkdex_common::{ADDR_SIZE, BTreeConfig, FileAddr, Result};

/// Type-specific behaviour plugged into the classic B-tree engine.
pub trait BTreeClass {
    /// Native key type.
    type Key: Clone + std::fmt::Debug;
    /// Per-operation state (the object being searched for or inserted).
    type UserData;

    /// Node type tag stored in every node header.
    const NODE_TYPE: u8;

    /// Encoded size of one key.
    fn key_size(&self) -> usize;

    /// Appends exactly `key_size()` bytes for `key`.
    fn encode_key(&self, key: &Self::Key, buf: &mut BytesMut);

    /// Decodes one key from `raw` (exactly `key_size()` bytes).
    fn decode_key(&self, raw: &[u8]) -> Result<Self::Key>;

    /// A placeholder key for slots that are about to be filled.
    fn empty_key(&self) -> Self::Key;

    /// Orders two keys, ignoring any payload they carry.
    fn cmp2(&self, left: &Self::Key, right: &Self::Key) -> Ordering;

    /// Places the search target relative to the range `[left, right)`.
    ///
    /// Returns `Less` when the target sorts before `left`, `Greater` when it
    /// sorts at or after `right`, and `Equal` when it falls within.
    fn cmp3(&self, left: &Self::Key, udata: &Self::UserData, right: &Self::Key) -> Ordering;

    /// Checks whether the leaf child at `addr` is the target and, if so,
    /// records what was found in `udata`.
    fn found(
        &self,
        file: &StorageFile,
        addr: FileAddr,
        left: &Self::Key,
        udata: &mut Self::UserData,
    ) -> Result<bool>;

    /// Creates a new leaf child for the target and fills in its bounding keys.
    ///
    /// For `InsertOp::Left` the right key already exists and is left alone.
    fn new_node(
        &self,
        file: &StorageFile,
        op: InsertOp,
        left: &mut Self::Key,
        udata: &mut Self::UserData,
        right: &mut Self::Key,
    ) -> Result<FileAddr>;

    /// Inserts the target into the range owned by the leaf child at `addr`.
    ///
    /// Returns the structural outcome and, for `Change`/`Left`/`Right`, the
    /// address of the new or relocated child. For `Left`/`Right` the key
    /// separating the old and new child is written to `md_key`.
    fn insert(
        &self,
        file: &StorageFile,
        addr: FileAddr,
        keys: &mut KeyBracket<'_, Self::Key>,
        md_key: &mut Self::Key,
        udata: &mut Self::UserData,
    ) -> Result<(InsertOp, Option<FileAddr>)>;

    /// Removes the leaf child at `addr`, releasing whatever it points at.
    ///
    /// Returning `InsertOp::Remove` asks the engine to drop the child slot.
    fn remove(
        &self,
        file: &StorageFile,
        addr: FileAddr,
        keys: &mut KeyBracket<'_, Self::Key>,
        udata: &mut Self::UserData,
    ) -> Result<InsertOp>;
}

/// Layout information shared by every node of one tree.
#[derive(Debug, Clone, PartialEq)]
pub struct BTreeShared {
    /// Node type tag.
    pub node_type: u8,
    /// Maximum children per node.
    pub two_k: usize,
    /// Encoded key size.
    pub key_size: usize,
    /// Encoded node size.
    pub node_size: usize,
    /// Split points for left-most, middle and right-most nodes.
    pub split_ratios: [f64; 3],
}

impl BTreeShared {
    /// Computes the node layout for a class with the given key size.
    pub fn new(config: &BTreeConfig, node_type: u8, key_size: usize) -> Result<Self> {
        config.validate()?;
        let two_k = config.two_k();
        let node_size = NODE_HEADER_SIZE + two_k * ADDR_SIZE + (two_k + 1) * key_size;

        Ok(Self {
            node_type,
            two_k,
            key_size,
            node_size,
            split_ratios: config.split_ratios,
        })
    }

    /// Returns the layout for class `C` with its current key size.
    pub fn for_class<C: BTreeClass>(config: &BTreeConfig, class: &C) -> Result<Self> {
        Self::new(config, C::NODE_TYPE, class.key_size())
    }
}
