//! Block file for byte-addressed file I/O.
//!
//! Structures are read and written at arbitrary byte offsets. Reads that
//! extend past the physical end of the file are zero-filled, so space that
//! was allocated but never written reads back as zeros.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use chunkdex_common::{ChunkdexError, Result};

/// Configuration for a block file.
#[derive(Debug, Clone)]
pub struct BlockFileConfig {
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
    /// Open without write access.
    pub read_only: bool,
}

impl Default for BlockFileConfig {
    fn default() -> Self {
        Self {
            fsync_enabled: true,
            read_only: false,
        }
    }
}

/// Reads and writes byte ranges of a single backing file.
pub struct BlockFile {
    /// Configuration.
    config: BlockFileConfig,
    /// Path to the file.
    path: PathBuf,
    /// Open file handle and its physical length.
    handle: Mutex<FileHandle>,
}

/// Handle for the open file.
struct FileHandle {
    /// The file handle.
    file: File,
    /// Physical length of the file in bytes.
    len: u64,
}

impl BlockFile {
    /// Creates a new file, truncating any existing content.
    pub fn create(path: impl AsRef<Path>, config: BlockFileConfig) -> Result<Self> {
        if config.read_only {
            return Err(ChunkdexError::ConfigError(
                "cannot create a file read-only".to_string(),
            ));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            config,
            path,
            handle: Mutex::new(FileHandle { file, len: 0 }),
        })
    }

    /// Opens an existing file.
    pub fn open(path: impl AsRef<Path>, config: BlockFileConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(&path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            config,
            path,
            handle: Mutex::new(FileHandle { file, len }),
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the file was opened without write access.
    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Returns the physical length of the file.
    pub fn len(&self) -> u64 {
        self.handle.lock().len
    }

    /// Returns true if nothing has been written to the file.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads `len` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset.checked_add(len as u64).ok_or_else(|| {
            ChunkdexError::IoError(format!("read of {} bytes at {} overflows", len, offset))
        })?;

        let mut handle = self.handle.lock();
        let mut buffer = vec![0u8; len];

        // Only the part below the physical end is backed by the file
        if offset < handle.len {
            let available = (end.min(handle.len) - offset) as usize;
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.read_exact(&mut buffer[..available])?;
        }

        Ok(buffer)
    }

    /// Writes `data` starting at `offset`, extending the file if needed.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.config.read_only {
            return Err(ChunkdexError::IoError(format!(
                "file {} is read-only",
                self.path.display()
            )));
        }
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            ChunkdexError::IoError(format!(
                "write of {} bytes at {} overflows",
                data.len(),
                offset
            ))
        })?;

        let mut handle = self.handle.lock();
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(data)?;

        if self.config.fsync_enabled {
            handle.file.sync_all()?;
        }

        if end > handle.len {
            handle.len = end;
        }

        Ok(())
    }

    /// Grows the file to at least `len` bytes. The new tail reads as zeros.
    pub fn extend_to(&self, len: u64) -> Result<()> {
        let mut handle = self.handle.lock();
        if len <= handle.len {
            return Ok(());
        }
        if self.config.read_only {
            return Err(ChunkdexError::IoError(format!(
                "file {} is read-only",
                self.path.display()
            )));
        }
        handle.file.set_len(len)?;
        handle.len = len;
        Ok(())
    }

    /// Flushes all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        if self.config.read_only {
            return Ok(());
        }
        self.handle.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}
