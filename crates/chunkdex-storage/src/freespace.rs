//! Free space management for file byte ranges.
//!
//! The allocator hands out byte extents of the backing file and takes them
//! back. Space is carved from the end of allocated space (EOA) unless a
//! previously freed extent is large enough. Freed extents are coalesced with
//! their neighbours, and an extent that reaches the EOA shrinks it instead of
//! staying on the free list.
//!
//! ```text
//! 0                                             eoa
//! +--------+======+-----------+=========+--------+
//! | in use | free |  in use   |  free   | in use |
//! +--------+======+-----------+=========+--------+
//! ```

use std::collections::BTreeMap;
use chunkdex_common::{ChunkdexError, FileAddr, Result};

/// Hands out and reclaims byte ranges in the backing file.
pub trait Allocator: Send {
    /// Allocates `size` bytes and returns the start address.
    fn allocate(&mut self, size: u64) -> Result<FileAddr>;

    /// Returns `size` bytes starting at `addr` to the allocator.
    fn free(&mut self, addr: FileAddr, size: u64) -> Result<()>;

    /// Returns the end of allocated space.
    fn eoa(&self) -> u64;

    /// Returns the number of bytes currently on the free list.
    fn free_bytes(&self) -> u64;
}

/// First-fit extent allocator with coalescing.
#[derive(Debug, Clone)]
pub struct FreeSpaceManager {
    /// End of allocated space.
    eoa: u64,
    /// Optional upper bound on the EOA.
    limit: Option<u64>,
    /// Free extents keyed by start offset, value is length.
    extents: BTreeMap<u64, u64>,
    /// Sum of all free extent lengths.
    free_bytes: u64,
}

impl FreeSpaceManager {
    /// Creates an allocator whose first allocation starts at `eoa`.
    pub fn new(eoa: u64) -> Self {
        Self {
            eoa,
            limit: None,
            extents: BTreeMap::new(),
            free_bytes: 0,
        }
    }

    /// Sets an upper bound on the end of allocated space.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Returns the number of free extents.
    pub fn num_extents(&self) -> usize {
        self.extents.len()
    }

    /// Takes `size` bytes from the first free extent that fits.
    fn take_from_free_list(&mut self, size: u64) -> Option<u64> {
        let (start, len) = self
            .extents
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(s, l)| (*s, *l))?;

        self.extents.remove(&start);
        if len > size {
            self.extents.insert(start + size, len - size);
        }
        self.free_bytes -= size;
        Some(start)
    }

    /// Extends the EOA by `size` bytes.
    fn extend(&mut self, size: u64) -> Result<u64> {
        let start = self.eoa;
        let end = start
            .checked_add(size)
            .filter(|end| *end < chunkdex_common::UNDEFINED_ADDR)
            .ok_or_else(|| ChunkdexError::AllocationFailed {
                size,
                reason: "address space exhausted".to_string(),
            })?;

        if let Some(limit) = self.limit {
            if end > limit {
                return Err(ChunkdexError::AllocationFailed {
                    size,
                    reason: format!("end of allocation {} would exceed limit {}", end, limit),
                });
            }
        }

        self.eoa = end;
        Ok(start)
    }
}

impl Allocator for FreeSpaceManager {
    fn allocate(&mut self, size: u64) -> Result<FileAddr> {
        if size == 0 {
            return Err(ChunkdexError::AllocationFailed {
                size,
                reason: "zero-length request".to_string(),
            });
        }

        let start = match self.take_from_free_list(size) {
            Some(start) => start,
            None => self.extend(size)?,
        };

        FileAddr::new(start).ok_or_else(|| ChunkdexError::AllocationFailed {
            size,
            reason: "allocation produced the undefined address".to_string(),
        })
    }

    fn free(&mut self, addr: FileAddr, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        let mut start = addr.get();
        let mut end = start.checked_add(size).ok_or_else(|| {
            ChunkdexError::Internal(format!("free of {} bytes at {} overflows", size, addr))
        })?;

        if end > self.eoa {
            return Err(ChunkdexError::Internal(format!(
                "free of {} bytes at {} extends past end of allocation {}",
                size, addr, self.eoa
            )));
        }

        // Reject any overlap with an extent that is already free
        if let Some((&prev_start, &prev_len)) = self.extents.range(..=start).next_back() {
            if prev_start + prev_len > start {
                return Err(ChunkdexError::Internal(format!(
                    "double free of {} bytes at {}",
                    size, addr
                )));
            }
        }
        if let Some((&next_start, _)) = self.extents.range(start..).next() {
            if next_start < end {
                return Err(ChunkdexError::Internal(format!(
                    "double free of {} bytes at {}",
                    size, addr
                )));
            }
        }

        self.free_bytes += size;

        // Coalesce with the left neighbour
        if let Some((&prev_start, &prev_len)) = self.extents.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.extents.remove(&prev_start);
                start = prev_start;
            }
        }

        // Coalesce with the right neighbour
        if let Some(next_len) = self.extents.remove(&end) {
            end += next_len;
        }

        if end == self.eoa {
            // Tail of the file: shrink instead of tracking
            self.free_bytes -= end - start;
            self.eoa = start;
        } else {
            self.extents.insert(start, end - start);
        }

        Ok(())
    }

    fn eoa(&self) -> u64 {
        self.eoa
    }

    fn free_bytes(&self) -> u64 {
        self.free_bytes
    }
}
