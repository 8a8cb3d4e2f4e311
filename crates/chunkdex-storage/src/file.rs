//! Storage file combining block I/O, space allocation and flush ordering.
//!
//! A `StorageFile` is the handle every index operation runs against. It is
//! shared behind an `Arc`; each open receives a process-unique `FileId` so
//! cached index state can tell when it is looking at a different open of the
//! same path.

use crate::disk::{BlockFile, BlockFileConfig};
use crate::flush::FlushDependencies;
use crate::freespace::{Allocator, FreeSpaceManager};
use parking_lot::{Mutex, MutexGuard};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use chunkdex_common::{ChunkdexError, FileAddr, Result, StorageConfig};

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one open storage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(u64);

impl FileId {
    fn next() -> Self {
        Self(NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// An open backing file with its allocator.
pub struct StorageFile {
    /// Unique identifier for this open.
    id: FileId,
    /// Configuration.
    config: StorageConfig,
    /// Byte-level file access.
    disk: BlockFile,
    /// Space allocator.
    space: Mutex<Box<dyn Allocator>>,
    /// Flush-order constraints between metadata structures.
    deps: Mutex<FlushDependencies>,
}

impl StorageFile {
    /// Creates a new empty file.
    pub fn create(path: impl AsRef<Path>, config: StorageConfig) -> Result<Arc<Self>> {
        let disk = BlockFile::create(path, Self::block_config(&config))?;
        let space = FreeSpaceManager::new(0).with_limit(config.allocation_limit);
        Ok(Self::with_allocator(disk, Box::new(space), config))
    }

    /// Opens an existing file. Allocation resumes at the physical end, which
    /// `allocate` keeps at or past the end of allocated space.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> Result<Arc<Self>> {
        let disk = BlockFile::open(path, Self::block_config(&config))?;
        let space = FreeSpaceManager::new(disk.len()).with_limit(config.allocation_limit);
        Ok(Self::with_allocator(disk, Box::new(space), config))
    }

    /// Wraps an already-open block file with a custom allocator.
    pub fn with_allocator(
        disk: BlockFile,
        space: Box<dyn Allocator>,
        config: StorageConfig,
    ) -> Arc<Self> {
        let id = FileId::next();
        tracing::debug!(file = %id, path = %disk.path().display(), "storage file opened");
        Arc::new(Self {
            id,
            config,
            disk,
            space: Mutex::new(space),
            deps: Mutex::new(FlushDependencies::new()),
        })
    }

    fn block_config(config: &StorageConfig) -> BlockFileConfig {
        BlockFileConfig {
            fsync_enabled: config.fsync_enabled,
            read_only: config.read_only,
        }
    }

    /// Returns the identifier of this open.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        self.disk.path()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Returns true if the file is open in single-writer/multiple-reader write mode.
    pub fn is_swmr_write(&self) -> bool {
        self.config.swmr_write
    }

    /// Returns true if the file is open read-only.
    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Reads `len` bytes at `addr`.
    pub fn read(&self, addr: FileAddr, len: usize) -> Result<Vec<u8>> {
        self.disk.read_at(addr.get(), len)
    }

    /// Writes `data` at `addr`.
    pub fn write(&self, addr: FileAddr, data: &[u8]) -> Result<()> {
        self.disk.write_at(addr.get(), data)
    }

    /// Allocates `size` bytes of file space.
    pub fn allocate(&self, size: u64) -> Result<FileAddr> {
        if self.config.read_only {
            return Err(ChunkdexError::AllocationFailed {
                size,
                reason: "file is read-only".to_string(),
            });
        }
        let mut space = self.space.lock();
        let addr = space.allocate(size)?;
        // Reserve the extent on disk so a reopen cannot hand it out again
        if let Err(e) = self.disk.extend_to(space.eoa()) {
            space.free(addr, size)?;
            return Err(e);
        }
        drop(space);
        tracing::trace!(file = %self.id, %addr, size, "allocated");
        Ok(addr)
    }

    /// Returns `size` bytes at `addr` to the allocator.
    pub fn free(&self, addr: FileAddr, size: u64) -> Result<()> {
        self.space.lock().free(addr, size)?;
        tracing::trace!(file = %self.id, %addr, size, "freed");
        Ok(())
    }

    /// Returns the end of allocated space.
    pub fn eoa(&self) -> u64 {
        self.space.lock().eoa()
    }

    /// Returns the number of bytes on the allocator's free list.
    pub fn free_bytes(&self) -> u64 {
        self.space.lock().free_bytes()
    }

    /// Returns the bytes currently allocated and not freed.
    pub fn allocated_bytes(&self) -> u64 {
        let space = self.space.lock();
        space.eoa() - space.free_bytes()
    }

    /// Registers that `parent` must be flushed no later than `child`.
    pub fn add_flush_dependency(&self, parent: FileAddr, child: FileAddr) -> Result<()> {
        self.deps.lock().add(parent, child)?;
        tracing::debug!(file = %self.id, %parent, %child, "flush dependency added");
        Ok(())
    }

    /// Removes a flush-order constraint.
    pub fn remove_flush_dependency(&self, parent: FileAddr, child: FileAddr) -> Result<()> {
        self.deps.lock().remove(parent, child)
    }

    /// Locks and returns the flush dependency graph.
    pub fn flush_dependencies(&self) -> MutexGuard<'_, FlushDependencies> {
        self.deps.lock()
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.disk.sync()
    }
}

impl std::fmt::Debug for StorageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFile")
            .field("id", &self.id)
            .field("path", &self.disk.path())
            .field("swmr_write", &self.config.swmr_write)
            .finish()
    }
}
