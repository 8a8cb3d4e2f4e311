//! The chunk index: one contract, three strategies.
//!
//! A dataset stores an `IndexKind` and a root address in its own metadata.
//! `ChunkIndex::from_storage` turns that pair back into a live index; every
//! operation then dispatches to the strategy.
//!
//! ```text
//!                  ChunkIndex
//!       +--------------+--------------+
//!       |              |              |
//!   BtreeIndex     Bt2Index     ImplicitIndex
//!   (classic)      (keyed)      (computed)
//! ```

use crate::bt2_index::Bt2Index;
use crate::btree_index::BtreeIndex;
use crate::context::IndexContext;
use crate::descriptor::{ChunkDescriptor, ChunkRecord, Insertion};
use crate::implicit::ImplicitIndex;
use crate::layout::{ChunkLayout, linearize};
use crate::shared::SharedIndexState;
use chunkdex_common::{FileAddr, IndexConfig, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Which strategy an index uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Classic balanced tree.
    Btree,
    /// Generic keyed tree.
    Bt2,
    /// Computed addresses over a pre-allocated region.
    Implicit,
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexKind::Btree => "btree",
            IndexKind::Bt2 => "bt2",
            IndexKind::Implicit => "implicit",
        };
        f.write_str(name)
    }
}

/// A chunk index of any strategy.
#[derive(Debug)]
pub enum ChunkIndex {
    /// Classic balanced tree.
    Btree(BtreeIndex),
    /// Generic keyed tree.
    Bt2(Bt2Index),
    /// Computed addresses.
    Implicit(ImplicitIndex),
}

impl ChunkIndex {
    /// Picks a strategy for a new dataset.
    ///
    /// Fixed-size unfiltered arrays allocated early need no index at all.
    /// Arrays that grow along more than one axis use the keyed tree, as does
    /// anyone who asks for it.
    pub fn select(
        layout: &ChunkLayout,
        has_filters: bool,
        early_alloc: bool,
        prefer_v2: bool,
    ) -> IndexKind {
        if !layout.is_extensible() && !has_filters && early_alloc {
            IndexKind::Implicit
        } else if prefer_v2 || layout.unlimited_dims() > 1 {
            IndexKind::Bt2
        } else {
            IndexKind::Btree
        }
    }

    /// An index of `kind` with no on-disk structure yet.
    pub fn new(kind: IndexKind, config: &IndexConfig) -> Self {
        Self::from_storage(kind, None, config)
    }

    /// An index of `kind` whose structure lives at `root`.
    pub fn from_storage(kind: IndexKind, root: Option<FileAddr>, config: &IndexConfig) -> Self {
        match kind {
            IndexKind::Btree => ChunkIndex::Btree(BtreeIndex::new(root, config.btree.clone())),
            IndexKind::Bt2 => ChunkIndex::Bt2(Bt2Index::new(root, config.bt2.clone())),
            IndexKind::Implicit => ChunkIndex::Implicit(ImplicitIndex::new(root)),
        }
    }

    /// Strategy of this index.
    pub fn kind(&self) -> IndexKind {
        match self {
            ChunkIndex::Btree(_) => IndexKind::Btree,
            ChunkIndex::Bt2(_) => IndexKind::Bt2,
            ChunkIndex::Implicit(_) => IndexKind::Implicit,
        }
    }

    /// Persistent root address, to be stored in the dataset metadata.
    pub fn root(&self) -> Option<FileAddr> {
        match self {
            ChunkIndex::Btree(index) => index.root(),
            ChunkIndex::Bt2(index) => index.root(),
            ChunkIndex::Implicit(index) => index.root(),
        }
    }

    /// Shared state, while the index is open.
    pub fn shared_state(&self) -> Option<&Arc<SharedIndexState>> {
        match self {
            ChunkIndex::Btree(index) => index.shared_state(),
            ChunkIndex::Bt2(index) => index.shared_state(),
            ChunkIndex::Implicit(index) => index.shared_state(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Allocates the on-disk structure. Fails if it already exists.
    pub fn create(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        match self {
            ChunkIndex::Btree(index) => index.create(ctx),
            ChunkIndex::Bt2(index) => index.create(ctx),
            ChunkIndex::Implicit(index) => index.create(ctx),
        }
    }

    /// Binds to the existing on-disk structure, if there is one.
    pub fn open(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        match self {
            ChunkIndex::Btree(index) => index.open(ctx),
            ChunkIndex::Bt2(index) => index.open(ctx),
            ChunkIndex::Implicit(index) => index.open(ctx),
        }
    }

    /// Unbinds from the on-disk structure. The structure itself is kept.
    pub fn close(&mut self) -> Result<()> {
        match self {
            ChunkIndex::Btree(index) => index.close(),
            ChunkIndex::Bt2(index) => index.close()?,
            ChunkIndex::Implicit(index) => index.close(),
        }
        Ok(())
    }

    /// True once the root address is defined.
    pub fn is_space_allocated(&self) -> bool {
        match self {
            ChunkIndex::Btree(index) => index.is_space_allocated(),
            ChunkIndex::Bt2(index) => index.is_space_allocated(),
            ChunkIndex::Implicit(index) => index.is_space_allocated(),
        }
    }

    /// Clears in-memory state. With `reset_addr` the root is forgotten too.
    pub fn reset(&mut self, reset_addr: bool) {
        match self {
            ChunkIndex::Btree(index) => index.reset(reset_addr),
            ChunkIndex::Bt2(index) => index.reset(reset_addr),
            ChunkIndex::Implicit(index) => index.reset(reset_addr),
        }
    }

    /// Releases in-memory resources when the owning handle closes.
    pub fn destroy(&mut self) -> Result<()> {
        match self {
            ChunkIndex::Btree(index) => index.destroy(),
            ChunkIndex::Bt2(index) => index.destroy()?,
            ChunkIndex::Implicit(index) => index.destroy(),
        }
        Ok(())
    }

    // =========================================================================
    // Mappings
    // =========================================================================

    /// Records the mapping in `desc` and returns the authoritative address.
    ///
    /// Tree indexes create their structure on the first insert.
    pub fn insert_or_update(
        &mut self,
        ctx: &IndexContext<'_>,
        desc: &ChunkDescriptor,
    ) -> Result<Insertion> {
        match self {
            ChunkIndex::Btree(index) => index.insert_or_update(ctx, desc),
            ChunkIndex::Bt2(index) => index.insert_or_update(ctx, desc),
            ChunkIndex::Implicit(index) => index.insert_or_update(ctx, desc),
        }
    }

    /// Resolves a scaled coordinate. `None` means the chunk was never written.
    pub fn lookup(
        &mut self,
        ctx: &IndexContext<'_>,
        scaled: &[u64],
    ) -> Result<Option<ChunkDescriptor>> {
        match self {
            ChunkIndex::Btree(index) => index.lookup(ctx, scaled),
            ChunkIndex::Bt2(index) => index.lookup(ctx, scaled),
            ChunkIndex::Implicit(index) => index.lookup(ctx, scaled),
        }
    }

    /// Visits every mapping once until `op` breaks.
    pub fn iterate<F>(&mut self, ctx: &IndexContext<'_>, op: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&ChunkRecord) -> Result<ControlFlow<()>>,
    {
        match self {
            ChunkIndex::Btree(index) => index.iterate(ctx, op),
            ChunkIndex::Bt2(index) => index.iterate(ctx, op),
            ChunkIndex::Implicit(index) => index.iterate(ctx, op),
        }
    }

    /// Removes one mapping and frees its chunk. Missing mappings are ignored.
    pub fn remove(&mut self, ctx: &IndexContext<'_>, scaled: &[u64]) -> Result<()> {
        match self {
            ChunkIndex::Btree(index) => index.remove(ctx, scaled),
            ChunkIndex::Bt2(index) => index.remove(ctx, scaled),
            ChunkIndex::Implicit(index) => index.remove(ctx, scaled),
        }
    }

    /// Frees every chunk and the structure itself.
    pub fn delete_all(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        match self {
            ChunkIndex::Btree(index) => index.delete_all(ctx),
            ChunkIndex::Bt2(index) => index.delete_all(ctx),
            ChunkIndex::Implicit(index) => index.delete_all(ctx),
        }
    }

    /// Bytes of index metadata, excluding chunk data.
    pub fn size_on_disk(&mut self, ctx: &IndexContext<'_>) -> Result<u64> {
        match self {
            ChunkIndex::Btree(index) => index.size_on_disk(ctx),
            ChunkIndex::Bt2(index) => index.size_on_disk(ctx),
            ChunkIndex::Implicit(index) => Ok(index.size_on_disk()),
        }
    }

    // =========================================================================
    // Extent maintenance
    // =========================================================================

    /// Total bytes of stored chunk data.
    ///
    /// An implicit index counts every slot of its region.
    pub fn allocated_bytes(&mut self, ctx: &IndexContext<'_>) -> Result<u64> {
        let mut total = 0u64;
        let _flow = self.iterate(ctx, |record| {
            total += record.nbytes as u64;
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(total)
    }

    /// Removes every chunk that lies wholly outside the current extents of
    /// `ctx.layout`, freeing its storage, and returns how many were removed.
    ///
    /// Chunks straddling the new edge are kept. An implicit index keeps its
    /// whole region, so nothing is removed from it.
    pub fn prune_by_extent(&mut self, ctx: &IndexContext<'_>) -> Result<u64> {
        if matches!(self, ChunkIndex::Implicit(_)) {
            return Ok(0);
        }
        let chunks = ctx.layout.chunks();

        // Collect first: removal restructures the tree being walked
        let mut outside = Vec::new();
        let _flow = self.iterate(ctx, |record| {
            if record.scaled.iter().zip(&chunks).any(|(s, n)| s >= n) {
                outside.push(record.scaled.clone());
            }
            Ok(ControlFlow::Continue(()))
        })?;

        for scaled in &outside {
            self.remove(ctx, scaled)?;
        }
        if !outside.is_empty() {
            tracing::debug!(kind = %self.kind(), pruned = outside.len(), dims = ?ctx.layout.dims(), "chunks pruned by extent");
        }
        Ok(outside.len() as u64)
    }

    // =========================================================================
    // Copy
    // =========================================================================

    /// Prepares `self` as a copy source and `dst` as a copy destination.
    ///
    /// The destination structure is created if it does not exist yet.
    pub fn copy_setup(
        &mut self,
        src_ctx: &IndexContext<'_>,
        dst: &mut ChunkIndex,
        dst_ctx: &IndexContext<'_>,
    ) -> Result<()> {
        self.open(src_ctx)?;
        if dst.is_space_allocated() {
            dst.open(dst_ctx)?;
        } else {
            dst.create(dst_ctx)?;
        }
        tracing::debug!(src = %self.kind(), dst = %dst.kind(), "chunk index copy prepared");
        Ok(())
    }

    /// Releases what `copy_setup` acquired on the destination.
    pub fn copy_shutdown(&mut self, dst: &mut ChunkIndex) -> Result<()> {
        let closed = dst.close();
        self.close()?;
        closed
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Chunk addresses by linearized position at the current extents.
    ///
    /// Chunks outside the current extents are skipped.
    pub fn address_map(&mut self, ctx: &IndexContext<'_>) -> Result<Vec<Option<FileAddr>>> {
        let chunks = ctx.layout.chunks();
        let down = ctx.layout.down_chunks();
        let mut map = vec![None; ctx.layout.nchunks() as usize];

        let _flow = self.iterate(ctx, |record| {
            let inside = record.scaled.iter().zip(&chunks).all(|(s, n)| s < n);
            if inside {
                map[linearize(&record.scaled, &down) as usize] = Some(record.addr);
            }
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(map)
    }

    /// Renders the kind, root and every mapping.
    pub fn dump(&mut self, ctx: &IndexContext<'_>) -> Result<String> {
        let mut out = String::new();
        let root = self
            .root()
            .map_or_else(|| "undefined".to_string(), |r| r.to_string());
        let _ = writeln!(out, "{} chunk index, root {}", self.kind(), root);

        let mut count = 0u64;
        let _flow = self.iterate(ctx, |record| {
            let _ = writeln!(
                out,
                "  {:?} -> {} ({} bytes, mask {:#x})",
                record.scaled, record.addr, record.nbytes, record.filter_mask
            );
            count += 1;
            Ok(ControlFlow::Continue(()))
        })?;

        let size = self.size_on_disk(ctx)?;
        let _ = writeln!(out, "{} chunks, {} bytes of index metadata", count, size);
        Ok(out)
    }
}
