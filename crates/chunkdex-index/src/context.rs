//! Per-call index context.

use crate::layout::ChunkLayout;
use crate::shared::IndexRegistry;
use chunkdex_common::FileAddr;
use chunkdex_storage::StorageFile;
use std::sync::Arc;

/// Everything an index operation borrows from the dataset layer.
#[derive(Debug, Clone, Copy)]
pub struct IndexContext<'a> {
    /// The open file holding the index.
    pub file: &'a Arc<StorageFile>,
    /// Array and chunk geometry.
    pub layout: &'a ChunkLayout,
    /// True if a filter pipeline with enabled filters is configured.
    pub has_filters: bool,
    /// Address of the dataset metadata that owns the index.
    pub owner: Option<FileAddr>,
    /// Registry the shared index state is kept in.
    pub registry: &'a IndexRegistry,
}

impl<'a> IndexContext<'a> {
    /// Context for an unfiltered dataset using the process-wide registry.
    pub fn new(file: &'a Arc<StorageFile>, layout: &'a ChunkLayout) -> Self {
        Self {
            file,
            layout,
            has_filters: false,
            owner: None,
            registry: IndexRegistry::global(),
        }
    }

    /// Marks the dataset as filtered.
    pub fn with_filters(mut self, has_filters: bool) -> Self {
        self.has_filters = has_filters;
        self
    }

    /// Names the owning dataset metadata record.
    pub fn with_owner(mut self, owner: FileAddr) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Uses `registry` instead of the process-wide one.
    pub fn with_registry(mut self, registry: &'a IndexRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Number of chunked dimensions.
    pub fn ndims(&self) -> usize {
        self.layout.ndims()
    }
}
