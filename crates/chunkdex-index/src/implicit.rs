//! Implicit chunk index.
//!
//! No structure is stored. Space for every chunk the array can ever hold
//! is allocated up front as one contiguous region, and a chunk's address is
//! computed from its row-major position at the maximum extents:
//!
//! ```text
//! addr = base + linearize(scaled, max_down_chunks) * chunk_byte_size
//! ```
//!
//! Only usable for fixed-size, unfiltered arrays with early allocation.

use crate::context::IndexContext;
use crate::descriptor::{ChunkDescriptor, ChunkRecord, InsertStatus, Insertion};
use crate::layout::{Odometer, linearize};
use crate::shared::{IndexLayout, SharedIndexState};
use chunkdex_common::{ChunkdexError, FileAddr, Result};
use std::ops::ControlFlow;
use std::sync::Arc;

/// Chunk index that stores nothing but the base of its region.
#[derive(Debug)]
pub struct ImplicitIndex {
    base: Option<FileAddr>,
    shared: Option<Arc<SharedIndexState>>,
}

/// Geometry of the pre-allocated region.
struct Region {
    max_chunks: Vec<u64>,
    max_down: Vec<u64>,
    nchunks: u64,
    chunk_bytes: u64,
}

impl Region {
    fn of(ctx: &IndexContext<'_>) -> Result<Self> {
        let layout = ctx.layout;
        let max_chunks = layout.max_chunks().ok_or_else(|| {
            ChunkdexError::UnsupportedOperation(
                "implicit index needs bounded maximum extents".to_string(),
            )
        })?;
        Ok(Self {
            max_down: crate::layout::down_products(&max_chunks),
            nchunks: max_chunks.iter().product(),
            max_chunks,
            chunk_bytes: layout.chunk_byte_size() as u64,
        })
    }

    fn len(&self) -> u64 {
        self.nchunks * self.chunk_bytes
    }

    fn contains(&self, scaled: &[u64]) -> bool {
        scaled.len() == self.max_chunks.len()
            && scaled.iter().zip(&self.max_chunks).all(|(s, m)| s < m)
    }

    fn address(&self, base: FileAddr, scaled: &[u64]) -> Result<FileAddr> {
        let offset = linearize(scaled, &self.max_down) * self.chunk_bytes;
        base.checked_add(offset).ok_or_else(|| {
            ChunkdexError::Internal(format!("chunk {:?} lies past the end of the address space", scaled))
        })
    }
}

impl ImplicitIndex {
    /// Index handle for the region at `base`, or for a region not yet
    /// allocated.
    pub fn new(base: Option<FileAddr>) -> Self {
        Self { base, shared: None }
    }

    /// Base address of the region.
    pub fn root(&self) -> Option<FileAddr> {
        self.base
    }

    /// Shared state, while the index is open.
    pub fn shared_state(&self) -> Option<&Arc<SharedIndexState>> {
        self.shared.as_ref()
    }

    /// Address of the chunk at `scaled`, which must lie inside the region.
    pub(crate) fn chunk_address(&self, ctx: &IndexContext<'_>, scaled: &[u64]) -> Result<FileAddr> {
        let base = self
            .base
            .ok_or_else(|| ChunkdexError::internal("implicit region is not allocated"))?;
        let region = Region::of(ctx)?;
        if !region.contains(scaled) {
            return Err(ChunkdexError::InvalidParameter {
                name: "scaled".to_string(),
                value: format!("{:?}", scaled),
            });
        }
        region.address(base, scaled)
    }

    fn check_usable(ctx: &IndexContext<'_>) -> Result<()> {
        if ctx.has_filters {
            return Err(ChunkdexError::UnsupportedOperation(
                "implicit index cannot hold filtered chunks".to_string(),
            ));
        }
        Ok(())
    }

    fn acquire_state(&mut self, ctx: &IndexContext<'_>, base: FileAddr, region: &Region) -> Result<()> {
        if let Some(state) = &self.shared {
            state.patch_file(ctx.file);
            return Ok(());
        }
        let layout = IndexLayout::Implicit {
            chunk_byte_size: region.chunk_bytes as u32,
            max_nchunks: region.nchunks,
        };
        self.shared = Some(ctx.registry.acquire(ctx.file, base, ctx.ndims(), || Ok(layout))?);
        Ok(())
    }

    pub fn create(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        if let Some(base) = self.base {
            return Err(ChunkdexError::AlreadyCreated(format!(
                "implicit index at {}",
                base
            )));
        }
        Self::check_usable(ctx)?;
        let region = Region::of(ctx)?;

        let base = ctx.file.allocate(region.len())?;
        self.acquire_state(ctx, base, &region)?;
        self.base = Some(base);

        tracing::debug!(
            base = %base,
            nchunks = region.nchunks,
            bytes = region.len(),
            "implicit chunk region allocated"
        );
        Ok(())
    }

    pub fn open(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        let Some(base) = self.base else {
            return Ok(());
        };
        Self::check_usable(ctx)?;
        let region = Region::of(ctx)?;
        self.acquire_state(ctx, base, &region)
    }

    pub fn close(&mut self) {
        self.shared = None;
    }

    pub fn is_space_allocated(&self) -> bool {
        self.base.is_some()
    }

    /// Resolves the address the chunk must live at. Nothing is stored.
    pub fn insert_or_update(
        &mut self,
        ctx: &IndexContext<'_>,
        desc: &ChunkDescriptor,
    ) -> Result<Insertion> {
        ctx.layout.check_scaled(&desc.scaled)?;
        let base = self
            .base
            .ok_or_else(|| ChunkdexError::internal("implicit region is not allocated"))?;
        let region = Region::of(ctx)?;
        self.acquire_state(ctx, base, &region)?;

        if !region.contains(&desc.scaled) {
            return Err(ChunkdexError::InvalidParameter {
                name: "scaled".to_string(),
                value: format!("{:?}", desc.scaled),
            });
        }
        if desc.nbytes as u64 != region.chunk_bytes {
            return Err(ChunkdexError::InvalidParameter {
                name: "nbytes".to_string(),
                value: desc.nbytes.to_string(),
            });
        }
        let addr = region.address(base, &desc.scaled)?;
        if desc.address.is_some_and(|a| a != addr) {
            return Err(ChunkdexError::InvalidParameter {
                name: "address".to_string(),
                value: format!("{:?}", desc.address),
            });
        }

        Ok(Insertion {
            addr,
            status: InsertStatus::Unchanged,
        })
    }

    pub fn lookup(
        &mut self,
        ctx: &IndexContext<'_>,
        scaled: &[u64],
    ) -> Result<Option<ChunkDescriptor>> {
        ctx.layout.check_scaled(scaled)?;
        let Some(base) = self.base else {
            return Ok(None);
        };
        let region = Region::of(ctx)?;
        self.acquire_state(ctx, base, &region)?;
        if !region.contains(scaled) {
            return Ok(None);
        }

        Ok(Some(ChunkDescriptor {
            scaled: scaled.to_vec(),
            address: Some(region.address(base, scaled)?),
            nbytes: region.chunk_bytes as u32,
            filter_mask: 0,
        }))
    }

    /// Visits every chunk slot in the region in row-major order.
    pub fn iterate<F>(&mut self, ctx: &IndexContext<'_>, mut op: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&ChunkRecord) -> Result<ControlFlow<()>>,
    {
        let Some(base) = self.base else {
            return Ok(ControlFlow::Continue(()));
        };
        let region = Region::of(ctx)?;
        self.acquire_state(ctx, base, &region)?;

        for scaled in Odometer::new(region.max_chunks.clone()) {
            let record = ChunkRecord {
                addr: region.address(base, &scaled)?,
                scaled,
                nbytes: region.chunk_bytes as u32,
                filter_mask: 0,
            };
            if op(&record)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    pub fn remove(&mut self, _ctx: &IndexContext<'_>, scaled: &[u64]) -> Result<()> {
        Err(ChunkdexError::UnsupportedOperation(format!(
            "cannot remove chunk {:?} from an implicit index",
            scaled
        )))
    }

    pub fn delete_all(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        let Some(base) = self.base else {
            return Ok(());
        };
        let region = Region::of(ctx)?;
        ctx.file.free(base, region.len())?;
        self.base = None;
        self.shared = None;
        tracing::debug!(base = %base, "implicit chunk region freed");
        Ok(())
    }

    /// The region holds chunk data only, so no index metadata is counted.
    pub fn size_on_disk(&self) -> u64 {
        0
    }

    pub fn reset(&mut self, reset_addr: bool) {
        if reset_addr {
            self.base = None;
        }
        self.shared = None;
    }

    pub fn destroy(&mut self) {
        self.shared = None;
    }
}
