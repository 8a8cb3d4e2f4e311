//! Values crossing the index boundary.

use chunkdex_common::FileAddr;

/// One chunk as the dataset layer sees it.
///
/// `address` is `None` until an index resolves or storage is allocated.
/// `filter_mask` records which filter stages were skipped; it is zero when
/// no filter pipeline is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Scaled coordinate of the chunk.
    pub scaled: Vec<u64>,
    /// File address of the chunk bytes.
    pub address: Option<FileAddr>,
    /// Stored size of the chunk in bytes.
    pub nbytes: u32,
    /// Skipped filter stages.
    pub filter_mask: u32,
}

impl ChunkDescriptor {
    /// Describes a chunk with no address yet.
    pub fn new(scaled: Vec<u64>, nbytes: u32) -> Self {
        Self {
            scaled,
            address: None,
            nbytes,
            filter_mask: 0,
        }
    }

    /// Sets the address.
    pub fn with_address(mut self, address: FileAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Sets the filter mask.
    pub fn with_filter_mask(mut self, filter_mask: u32) -> Self {
        self.filter_mask = filter_mask;
        self
    }
}

/// A stored mapping, as handed to iteration callbacks by every strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Scaled coordinate of the chunk.
    pub scaled: Vec<u64>,
    /// File address of the chunk bytes.
    pub addr: FileAddr,
    /// Stored size of the chunk in bytes.
    pub nbytes: u32,
    /// Skipped filter stages.
    pub filter_mask: u32,
}

impl From<ChunkRecord> for ChunkDescriptor {
    fn from(record: ChunkRecord) -> Self {
        Self {
            scaled: record.scaled,
            address: Some(record.addr),
            nbytes: record.nbytes,
            filter_mask: record.filter_mask,
        }
    }
}

/// What `insert_or_update` did to the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    /// No mapping existed; one was created.
    Created,
    /// The mapping existed and was rewritten with a new size or address.
    Changed,
    /// The mapping existed and already matched.
    Unchanged,
}

/// Result of `insert_or_update`: the authoritative address and what changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insertion {
    /// Address the chunk now lives at.
    pub addr: FileAddr,
    /// What happened to the mapping.
    pub status: InsertStatus,
}
