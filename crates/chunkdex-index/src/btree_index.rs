//! Classic balanced-tree chunk index.
//!
//! Keys are chunk-shaped: a scaled coordinate plus the chunk's stored size
//! and filter mask. The chunk address is the child pointer the key sits
//! next to, so a leaf entry `(key[i], child[i])` is one chunk.
//!
//! Raw key layout (`8 + (ndims + 1) * 8` bytes):
//! - nbytes: 4 bytes
//! - filter_mask: 4 bytes
//! - offsets: (ndims + 1) * 8 bytes, each the scaled coordinate times the
//!   chunk extent; the trailing element axis is always zero

use crate::context::IndexContext;
use crate::descriptor::{ChunkDescriptor, ChunkRecord, InsertStatus, Insertion};
use crate::shared::{IndexLayout, SharedIndexState};
use bytes::{BufMut, BytesMut};
use chunkdex_common::{BTreeConfig, ChunkdexError, FileAddr, Result};
use chunkdex_storage::{BTree, BTreeClass, BTreeShared, InsertOp, KeyBracket, StorageFile};
use std::cmp::Ordering;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Node type tag for chunk trees.
pub const CHUNK_NODE_TYPE: u8 = 1;

/// Native form of one chunk key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    /// Stored chunk size; zero for bounding keys.
    pub nbytes: u32,
    /// Skipped filter stages.
    pub filter_mask: u32,
    /// Scaled coordinate.
    pub scaled: Vec<u64>,
}

/// The chunk being looked up, inserted or removed.
#[derive(Debug, Clone)]
pub struct ChunkProbe {
    /// Target coordinate.
    pub scaled: Vec<u64>,
    /// Stored size (in) or found size (out).
    pub nbytes: u32,
    /// Filter mask (in) or found mask (out).
    pub filter_mask: u32,
    /// Pre-allocated address (in) or authoritative address (out).
    pub addr: Option<FileAddr>,
    /// What the insert did, once it ran.
    pub status: Option<InsertStatus>,
}

impl ChunkProbe {
    /// Probe that only carries a coordinate.
    pub fn at(scaled: &[u64]) -> Self {
        Self {
            scaled: scaled.to_vec(),
            nbytes: 0,
            filter_mask: 0,
            addr: None,
            status: None,
        }
    }

    fn key(&self) -> ChunkKey {
        ChunkKey {
            nbytes: self.nbytes,
            filter_mask: self.filter_mask,
            scaled: self.scaled.clone(),
        }
    }

    fn require_addr(&self) -> Result<FileAddr> {
        self.addr.ok_or_else(|| {
            ChunkdexError::Internal(format!(
                "chunk {:?} has no allocated address",
                self.scaled
            ))
        })
    }
}

/// Chunk key class for the classic tree engine.
#[derive(Debug, Clone)]
pub struct ChunkKeyClass {
    chunk_dims: Vec<u32>,
}

impl ChunkKeyClass {
    /// Class for chunks of the given extents.
    pub fn new(chunk_dims: &[u32]) -> Self {
        Self {
            chunk_dims: chunk_dims.to_vec(),
        }
    }

    fn ndims(&self) -> usize {
        self.chunk_dims.len()
    }

    /// Three-way placement using only the slowest coordinate.
    ///
    /// Equivalent to the general form for one-dimensional chunking, where
    /// that coordinate is the whole key.
    pub fn cmp3_one_dim(left: &[u64], query: &[u64], right: &[u64]) -> Ordering {
        if query[0] >= right[0] {
            Ordering::Greater
        } else if query[0] < left[0] {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }

    /// Three-way placement by full lexicographic comparison.
    pub fn cmp3_general(left: &[u64], query: &[u64], right: &[u64]) -> Ordering {
        if query >= right {
            Ordering::Greater
        } else if query < left {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }
}

impl BTreeClass for ChunkKeyClass {
    type Key = ChunkKey;
    type UserData = ChunkProbe;
    const NODE_TYPE: u8 = CHUNK_NODE_TYPE;

    fn key_size(&self) -> usize {
        4 + 4 + (self.ndims() + 1) * 8
    }

    fn encode_key(&self, key: &ChunkKey, buf: &mut BytesMut) {
        buf.put_u32_le(key.nbytes);
        buf.put_u32_le(key.filter_mask);
        for (scaled, extent) in key.scaled.iter().zip(&self.chunk_dims) {
            buf.put_u64_le(scaled.saturating_mul(*extent as u64));
        }
        buf.put_u64_le(0);
    }

    fn decode_key(&self, raw: &[u8]) -> Result<ChunkKey> {
        if raw.len() < self.key_size() {
            return Err(ChunkdexError::corrupt("truncated chunk key"));
        }
        let word = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&raw[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let nbytes = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let filter_mask = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let mut scaled = Vec::with_capacity(self.ndims());
        for (i, extent) in self.chunk_dims.iter().enumerate() {
            let offset = word(8 + i * 8);
            let extent = *extent as u64;
            if offset % extent != 0 {
                return Err(ChunkdexError::Corrupt(format!(
                    "chunk offset {} in dimension {} is not a multiple of {}",
                    offset, i, extent
                )));
            }
            scaled.push(offset / extent);
        }
        if word(8 + self.ndims() * 8) != 0 {
            return Err(ChunkdexError::corrupt("chunk key has nonzero element offset"));
        }

        Ok(ChunkKey {
            nbytes,
            filter_mask,
            scaled,
        })
    }

    fn empty_key(&self) -> ChunkKey {
        ChunkKey {
            nbytes: 0,
            filter_mask: 0,
            scaled: vec![0; self.ndims()],
        }
    }

    fn cmp2(&self, left: &ChunkKey, right: &ChunkKey) -> Ordering {
        left.scaled.cmp(&right.scaled)
    }

    fn cmp3(&self, left: &ChunkKey, udata: &ChunkProbe, right: &ChunkKey) -> Ordering {
        if self.ndims() == 1 {
            Self::cmp3_one_dim(&left.scaled, &udata.scaled, &right.scaled)
        } else {
            Self::cmp3_general(&left.scaled, &udata.scaled, &right.scaled)
        }
    }

    fn found(
        &self,
        _file: &StorageFile,
        addr: FileAddr,
        left: &ChunkKey,
        udata: &mut ChunkProbe,
    ) -> Result<bool> {
        if left.scaled != udata.scaled {
            return Ok(false);
        }
        udata.addr = Some(addr);
        udata.nbytes = left.nbytes;
        udata.filter_mask = left.filter_mask;
        Ok(true)
    }

    fn new_node(
        &self,
        _file: &StorageFile,
        op: InsertOp,
        left: &mut ChunkKey,
        udata: &mut ChunkProbe,
        right: &mut ChunkKey,
    ) -> Result<FileAddr> {
        let addr = udata.require_addr()?;
        *left = udata.key();

        // Bound from the right: one past the chunk in the slowest dimension
        if op != InsertOp::Left {
            let mut scaled = udata.scaled.clone();
            scaled[0] = scaled[0].checked_add(1).ok_or_else(|| ChunkdexError::InvalidParameter {
                name: "scaled[0]".to_string(),
                value: udata.scaled[0].to_string(),
            })?;
            *right = ChunkKey {
                nbytes: 0,
                filter_mask: 0,
                scaled,
            };
        }

        udata.status = Some(InsertStatus::Created);
        Ok(addr)
    }

    fn insert(
        &self,
        _file: &StorageFile,
        addr: FileAddr,
        keys: &mut KeyBracket<'_, ChunkKey>,
        md_key: &mut ChunkKey,
        udata: &mut ChunkProbe,
    ) -> Result<(InsertOp, Option<FileAddr>)> {
        if self.cmp3(keys.left, udata, keys.right) == Ordering::Less {
            return Err(ChunkdexError::Internal(format!(
                "chunk {:?} sorts before its bracketing key {:?}",
                udata.scaled, keys.left.scaled
            )));
        }

        if keys.left.scaled == udata.scaled && keys.left.nbytes != 0 {
            if keys.left.nbytes == udata.nbytes {
                udata.addr = Some(addr);
                udata.status = Some(InsertStatus::Unchanged);
                return Ok((InsertOp::Noop, None));
            }

            // Size changed: the caller already moved the chunk
            let new_addr = udata.require_addr()?;
            keys.left.nbytes = udata.nbytes;
            keys.left.filter_mask = udata.filter_mask;
            keys.left_changed = true;
            udata.status = Some(InsertStatus::Changed);
            return Ok((InsertOp::Change, Some(new_addr)));
        }

        // Unit-extent chunks overlap only if they match in every dimension
        let disjoint = keys
            .left
            .scaled
            .iter()
            .zip(&udata.scaled)
            .any(|(a, b)| a != b);
        if !disjoint {
            return Err(ChunkdexError::Internal(format!(
                "chunk {:?} overlaps an existing zero-size key",
                udata.scaled
            )));
        }

        let new_addr = udata.require_addr()?;
        *md_key = udata.key();
        udata.status = Some(InsertStatus::Created);
        Ok((InsertOp::Right, Some(new_addr)))
    }

    fn remove(
        &self,
        file: &StorageFile,
        addr: FileAddr,
        keys: &mut KeyBracket<'_, ChunkKey>,
        _udata: &mut ChunkProbe,
    ) -> Result<InsertOp> {
        // Readers in single-writer mode may still be looking at the bytes
        if !file.is_swmr_write() && keys.left.nbytes > 0 {
            file.free(addr, keys.left.nbytes as u64)?;
        }
        Ok(InsertOp::Remove)
    }
}

/// Chunk index backed by a classic balanced tree.
#[derive(Debug)]
pub struct BtreeIndex {
    root: Option<FileAddr>,
    config: BTreeConfig,
    shared: Option<Arc<SharedIndexState>>,
}

impl BtreeIndex {
    /// Index handle for the tree at `root`, or for a tree not yet created.
    pub fn new(root: Option<FileAddr>, config: BTreeConfig) -> Self {
        Self {
            root,
            config,
            shared: None,
        }
    }

    /// Root node address.
    pub fn root(&self) -> Option<FileAddr> {
        self.root
    }

    /// Shared state, while the index is open.
    pub fn shared_state(&self) -> Option<&Arc<SharedIndexState>> {
        self.shared.as_ref()
    }

    /// Acquires (or re-validates) the shared state for the current root.
    fn state(&mut self, ctx: &IndexContext<'_>, root: FileAddr) -> Result<Arc<SharedIndexState>> {
        if let Some(state) = &self.shared {
            state.patch_file(ctx.file);
            return Ok(state.clone());
        }

        let class = ChunkKeyClass::new(ctx.layout.chunk_dims());
        let config = self.config.clone();
        let state = ctx.registry.acquire(ctx.file, root, ctx.ndims(), || {
            Ok(IndexLayout::Btree(BTreeShared::for_class(&config, &class)?))
        })?;
        if state.btree_layout()?.key_size != class.key_size() {
            return Err(ChunkdexError::Corrupt(format!(
                "classic index at {} has a different key layout",
                root
            )));
        }
        self.shared = Some(state.clone());
        Ok(state)
    }

    pub fn create(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        if let Some(root) = self.root {
            return Err(ChunkdexError::AlreadyCreated(format!(
                "classic index at {}",
                root
            )));
        }

        let class = ChunkKeyClass::new(ctx.layout.chunk_dims());
        let shared = BTreeShared::for_class(&self.config, &class)?;
        let root = BTree::new(ctx.file, &class, &shared).create()?;
        self.root = Some(root);
        self.state(ctx, root)?;

        tracing::debug!(root = %root, ndims = ctx.ndims(), "classic chunk index created");
        Ok(())
    }

    pub fn open(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        if let Some(root) = self.root {
            self.state(ctx, root)?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.shared = None;
    }

    pub fn is_space_allocated(&self) -> bool {
        self.root.is_some()
    }

    pub fn insert_or_update(
        &mut self,
        ctx: &IndexContext<'_>,
        desc: &ChunkDescriptor,
    ) -> Result<Insertion> {
        ctx.layout.check_scaled(&desc.scaled)?;
        let addr = desc.address.ok_or_else(|| ChunkdexError::InvalidParameter {
            name: "address".to_string(),
            value: "none".to_string(),
        })?;
        if self.root.is_none() {
            self.create(ctx)?;
        }
        let root = self.require_root()?;
        let state = self.state(ctx, root)?;
        let file = state.file();
        let class = ChunkKeyClass::new(ctx.layout.chunk_dims());

        let mut probe = ChunkProbe {
            scaled: desc.scaled.clone(),
            nbytes: desc.nbytes,
            filter_mask: desc.filter_mask,
            addr: Some(addr),
            status: None,
        };
        BTree::new(&file, &class, state.btree_layout()?).insert(root, &mut probe)?;

        let status = probe
            .status
            .ok_or_else(|| ChunkdexError::internal("insert finished without a status"))?;
        let addr = probe.require_addr()?;
        tracing::trace!(scaled = ?desc.scaled, %addr, ?status, "classic index insert");
        Ok(Insertion { addr, status })
    }

    pub fn lookup(
        &mut self,
        ctx: &IndexContext<'_>,
        scaled: &[u64],
    ) -> Result<Option<ChunkDescriptor>> {
        ctx.layout.check_scaled(scaled)?;
        let Some(root) = self.root else {
            return Ok(None);
        };
        let state = self.state(ctx, root)?;
        let file = state.file();
        let class = ChunkKeyClass::new(ctx.layout.chunk_dims());

        let mut probe = ChunkProbe::at(scaled);
        if !BTree::new(&file, &class, state.btree_layout()?).find(root, &mut probe)? {
            return Ok(None);
        }
        Ok(Some(ChunkDescriptor {
            scaled: probe.scaled,
            address: probe.addr,
            nbytes: probe.nbytes,
            filter_mask: probe.filter_mask,
        }))
    }

    pub fn iterate<F>(&mut self, ctx: &IndexContext<'_>, mut op: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&ChunkRecord) -> Result<ControlFlow<()>>,
    {
        let Some(root) = self.root else {
            return Ok(ControlFlow::Continue(()));
        };
        let state = self.state(ctx, root)?;
        let file = state.file();
        let class = ChunkKeyClass::new(ctx.layout.chunk_dims());

        BTree::new(&file, &class, state.btree_layout()?).iterate(root, |key, addr, _| {
            op(&ChunkRecord {
                scaled: key.scaled.clone(),
                addr,
                nbytes: key.nbytes,
                filter_mask: key.filter_mask,
            })
        })
    }

    pub fn remove(&mut self, ctx: &IndexContext<'_>, scaled: &[u64]) -> Result<()> {
        if self.lookup(ctx, scaled)?.is_none() {
            return Ok(());
        }
        let root = self.require_root()?;
        let state = self.state(ctx, root)?;
        let file = state.file();
        let class = ChunkKeyClass::new(ctx.layout.chunk_dims());

        BTree::new(&file, &class, state.btree_layout()?).remove(root, &mut ChunkProbe::at(scaled))?;
        tracing::trace!(?scaled, "classic index remove");
        Ok(())
    }

    pub fn delete_all(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        let Some(root) = self.root else {
            return Ok(());
        };
        let state = self.state(ctx, root)?;
        let file = state.file();
        let class = ChunkKeyClass::new(ctx.layout.chunk_dims());

        BTree::new(&file, &class, state.btree_layout()?).delete(root, &mut ChunkProbe::at(&[]))?;
        self.root = None;
        self.shared = None;
        tracing::debug!(root = %root, "classic chunk index deleted");
        Ok(())
    }

    pub fn size_on_disk(&mut self, ctx: &IndexContext<'_>) -> Result<u64> {
        let Some(root) = self.root else {
            return Ok(0);
        };
        let state = self.state(ctx, root)?;
        let file = state.file();
        let class = ChunkKeyClass::new(ctx.layout.chunk_dims());
        Ok(BTree::new(&file, &class, state.btree_layout()?).info(root)?.size)
    }

    pub fn reset(&mut self, reset_addr: bool) {
        if reset_addr {
            self.root = None;
        }
        self.shared = None;
    }

    pub fn destroy(&mut self) {
        self.shared = None;
    }

    fn require_root(&self) -> Result<FileAddr> {
        self.root
            .ok_or_else(|| ChunkdexError::internal("classic index has no root"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ChunkLayout;
    use crate::shared::IndexRegistry;
    use chunkdex_common::StorageConfig;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn key(scaled: Vec<u64>, nbytes: u32) -> ChunkKey {
        ChunkKey {
            nbytes,
            filter_mask: 0,
            scaled,
        }
    }

    #[test]
    fn test_key_codec_uses_byte_offsets() {
        let class = ChunkKeyClass::new(&[2, 3, 4]);
        assert_eq!(class.key_size(), 8 + 4 * 8);

        let original = ChunkKey {
            nbytes: 64,
            filter_mask: 0b101,
            scaled: vec![1, 2, 3],
        };
        let mut buf = BytesMut::new();
        class.encode_key(&original, &mut buf);
        assert_eq!(buf.len(), class.key_size());
        assert_eq!(&buf[8..16], &2u64.to_le_bytes());
        assert_eq!(&buf[16..24], &6u64.to_le_bytes());
        assert_eq!(&buf[24..32], &12u64.to_le_bytes());
        assert_eq!(&buf[32..40], &0u64.to_le_bytes());

        assert_eq!(class.decode_key(&buf).unwrap(), original);
    }

    #[test]
    fn test_key_decode_rejects_unaligned_offset() {
        let class = ChunkKeyClass::new(&[4]);
        let mut raw = BytesMut::new();
        raw.put_u32_le(16);
        raw.put_u32_le(0);
        raw.put_u64_le(6);
        raw.put_u64_le(0);
        assert!(class.decode_key(&raw).unwrap_err().is_corruption());
    }

    #[test]
    fn test_key_decode_rejects_element_offset() {
        let class = ChunkKeyClass::new(&[4]);
        let mut raw = BytesMut::new();
        raw.put_u32_le(16);
        raw.put_u32_le(0);
        raw.put_u64_le(8);
        raw.put_u64_le(1);
        assert!(class.decode_key(&raw).is_err());
    }

    #[test]
    fn test_cmp3_brackets() {
        let class = ChunkKeyClass::new(&[2, 2]);
        let left = key(vec![1, 0], 8);
        let right = key(vec![2, 0], 0);

        assert_eq!(class.cmp3(&left, &ChunkProbe::at(&[0, 5]), &right), Ordering::Less);
        assert_eq!(class.cmp3(&left, &ChunkProbe::at(&[1, 0]), &right), Ordering::Equal);
        assert_eq!(class.cmp3(&left, &ChunkProbe::at(&[1, 9]), &right), Ordering::Equal);
        assert_eq!(class.cmp3(&left, &ChunkProbe::at(&[2, 0]), &right), Ordering::Greater);
    }

    #[test]
    fn test_new_node_bounds_slowest_dimension() {
        let dir = tempdir().unwrap();
        let file = StorageFile::create(dir.path().join("k.bin"), StorageConfig::default()).unwrap();
        let class = ChunkKeyClass::new(&[2, 2, 2]);

        let mut probe = ChunkProbe::at(&[0, 3, 1]);
        probe.nbytes = 64;
        probe.addr = Some(FileAddr::new(100).unwrap());
        let mut left = class.empty_key();
        let mut right = class.empty_key();
        let addr = class
            .new_node(&file, InsertOp::First, &mut left, &mut probe, &mut right)
            .unwrap();

        assert_eq!(addr.get(), 100);
        assert_eq!(left, key(vec![0, 3, 1], 64));
        assert_eq!(right, key(vec![1, 3, 1], 0));
        assert_eq!(probe.status, Some(InsertStatus::Created));
    }

    proptest! {
        #[test]
        fn prop_one_dim_fast_path_matches_general(
            firsts in proptest::collection::vec(0u64..1000, 3),
            tail in proptest::collection::vec(0u64..1000, 0..4),
        ) {
            // Stored keys share their trailing coordinates (the element axis
            // is always zero), so only the first axis can differ
            let (left0, right0) = (firsts[0].min(firsts[1]), firsts[0].max(firsts[1]));
            let with_tail = |first: u64| {
                let mut key = vec![first];
                key.extend(&tail);
                key
            };
            let (left, query, right) = (with_tail(left0), with_tail(firsts[2]), with_tail(right0));
            prop_assert_eq!(
                ChunkKeyClass::cmp3_one_dim(&left, &query, &right),
                ChunkKeyClass::cmp3_general(&left, &query, &right)
            );
        }

        #[test]
        fn prop_first_axis_decides_when_distinct(
            left in proptest::collection::vec(0u64..50, 1..5),
            query in proptest::collection::vec(0u64..50, 1..5),
            right in proptest::collection::vec(0u64..50, 1..5),
        ) {
            let n = left.len().min(query.len()).min(right.len());
            let (left, query, right) = (&left[..n], &query[..n], &right[..n]);
            prop_assume!(left <= right);
            prop_assume!(query[0] != left[0] && query[0] != right[0]);
            prop_assert_eq!(
                ChunkKeyClass::cmp3_one_dim(left, query, right),
                ChunkKeyClass::cmp3_general(left, query, right)
            );
        }

        #[test]
        fn prop_key_codec_roundtrip(
            scaled in proptest::collection::vec(0u64..1 << 20, 1..5),
            nbytes in any::<u32>(),
            mask in any::<u32>(),
        ) {
            let dims: Vec<u32> = (0..scaled.len() as u32).map(|i| i + 3).collect();
            let class = ChunkKeyClass::new(&dims);
            let original = ChunkKey { nbytes, filter_mask: mask, scaled };
            let mut buf = BytesMut::new();
            class.encode_key(&original, &mut buf);
            prop_assert_eq!(class.decode_key(&buf).unwrap(), original);
        }
    }

    #[test]
    fn test_reopened_index_shares_state() {
        let dir = tempdir().unwrap();
        let file = StorageFile::create(dir.path().join("b.bin"), StorageConfig::default()).unwrap();
        let layout = ChunkLayout::new(vec![8], vec![None], vec![2], 4).unwrap();
        let registry = IndexRegistry::new();
        let ctx = IndexContext::new(&file, &layout).with_registry(&registry);

        let mut first = BtreeIndex::new(None, BTreeConfig::default());
        first.create(&ctx).unwrap();
        let mut second = BtreeIndex::new(first.root(), BTreeConfig::default());
        second.open(&ctx).unwrap();

        let a = first.shared_state().unwrap();
        let b = second.shared_state().unwrap();
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(registry.len(), 1);

        first.destroy();
        second.destroy();
        assert!(registry.is_empty());
    }
}
