//! Chunk storage allocation.
//!
//! Decides where a chunk's bytes go before its mapping is inserted: keep
//! the old extent when the size is unchanged, move it when the size
//! changes, and compute it when the index is implicit.

use crate::context::IndexContext;
use crate::descriptor::ChunkDescriptor;
use crate::index::ChunkIndex;
use chunkdex_common::{ChunkdexError, Result};

/// Width in bytes of the stored-size field for filtered chunks whose
/// unfiltered size is `chunk_byte_size`.
///
/// Enough bytes for the size itself plus one more, so a filter that grows
/// its input still fits.
pub fn chunk_size_width(chunk_byte_size: u64) -> u8 {
    let log2 = chunk_byte_size.max(1).ilog2() as u64;
    (1 + (log2 + 8) / 8).min(8) as u8
}

/// Gives `new` a file address.
///
/// `old` is the chunk's current mapping, if it has one. Returns true if the
/// caller must then insert `new` into the index; false if the mapping already
/// points at the right place.
pub fn allocate_chunk(
    ctx: &IndexContext<'_>,
    index: &ChunkIndex,
    old: Option<&ChunkDescriptor>,
    new: &mut ChunkDescriptor,
) -> Result<bool> {
    ctx.layout.check_scaled(&new.scaled)?;

    if ctx.has_filters && matches!(index, ChunkIndex::Bt2(_)) {
        let width = chunk_size_width(ctx.layout.chunk_byte_size() as u64);
        if width < 8 && (new.nbytes as u64) >> (8 * width as u32) != 0 {
            return Err(ChunkdexError::InvalidParameter {
                name: "nbytes".to_string(),
                value: new.nbytes.to_string(),
            });
        }
    }

    if let ChunkIndex::Implicit(implicit) = index {
        new.address = Some(implicit.chunk_address(ctx, &new.scaled)?);
        return Ok(false);
    }

    if let Some(old) = old.filter(|old| old.address.is_some()) {
        if old.nbytes == new.nbytes {
            new.address = old.address;
            return Ok(false);
        }
        if let Some(addr) = old.address {
            // Readers in single-writer mode may still be looking at the bytes
            if !ctx.file.is_swmr_write() {
                ctx.file.free(addr, old.nbytes as u64)?;
            }
        }
    }

    let addr = ctx.file.allocate(new.nbytes as u64)?;
    tracing::trace!(scaled = ?new.scaled, %addr, nbytes = new.nbytes, "chunk storage allocated");
    new.address = Some(addr);
    Ok(true)
}
