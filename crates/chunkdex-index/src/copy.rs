//! Whole-index copy between files.

use crate::alloc::allocate_chunk;
use crate::context::IndexContext;
use crate::descriptor::{ChunkDescriptor, ChunkRecord};
use crate::index::ChunkIndex;
use chunkdex_common::Result;
use std::ops::ControlFlow;

/// Copies every chunk of `src` into `dst` and returns how many were copied.
///
/// Chunk bytes are read from the source file and written to freshly
/// allocated (or, for an implicit destination, computed) space in the
/// destination file. Both indexes are shut down again even if the copy fails.
pub fn copy_chunks(
    src: &mut ChunkIndex,
    src_ctx: &IndexContext<'_>,
    dst: &mut ChunkIndex,
    dst_ctx: &IndexContext<'_>,
) -> Result<u64> {
    let copied = src
        .copy_setup(src_ctx, dst, dst_ctx)
        .and_then(|()| copy_records(src, src_ctx, dst, dst_ctx));
    let shutdown = src.copy_shutdown(dst);

    let copied = copied?;
    shutdown?;
    tracing::debug!(copied, src = %src.kind(), dst = %dst.kind(), "chunk index copied");
    Ok(copied)
}

fn copy_records(
    src: &mut ChunkIndex,
    src_ctx: &IndexContext<'_>,
    dst: &mut ChunkIndex,
    dst_ctx: &IndexContext<'_>,
) -> Result<u64> {
    // Collect first: source and destination may share a file
    let mut records: Vec<ChunkRecord> = Vec::new();
    let _flow = src.iterate(src_ctx, |record| {
        records.push(record.clone());
        Ok(ControlFlow::Continue(()))
    })?;

    for record in &records {
        let data = src_ctx.file.read(record.addr, record.nbytes as usize)?;
        let mut desc = ChunkDescriptor::new(record.scaled.clone(), record.nbytes)
            .with_filter_mask(record.filter_mask);
        allocate_chunk(dst_ctx, dst, None, &mut desc)?;

        let insertion = dst.insert_or_update(dst_ctx, &desc)?;
        dst_ctx.file.write(insertion.addr, &data)?;
    }
    Ok(records.len() as u64)
}
