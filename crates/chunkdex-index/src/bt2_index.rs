//! Keyed-tree chunk index.
//!
//! Each record maps one scaled coordinate to a chunk. Unfiltered records
//! leave the size implicit (every chunk is full-sized); filtered records
//! carry the stored size in the narrowest width that holds a full chunk,
//! plus the filter mask.
//!
//! Unfiltered record layout (`8 + ndims * 8` bytes):
//! - addr: 8 bytes
//! - scaled: ndims * 8 bytes
//!
//! Filtered record layout (`8 + w + 4 + ndims * 8` bytes):
//! - addr: 8 bytes
//! - nbytes: w bytes, little-endian
//! - filter_mask: 4 bytes
//! - scaled: ndims * 8 bytes

use crate::alloc::chunk_size_width;
use crate::context::IndexContext;
use crate::descriptor::{ChunkDescriptor, ChunkRecord, InsertStatus, Insertion};
use crate::shared::{IndexLayout, SharedIndexState};
use bytes::{BufMut, BytesMut};
use chunkdex_common::{Bt2Config, ChunkdexError, FileAddr, Result};
use chunkdex_storage::{Bt2, Bt2Class, UpdateStatus};
use std::cmp::Ordering;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Class id for unfiltered chunk records.
pub const UNFILTERED_TYPE_ID: u8 = 10;
/// Class id for filtered chunk records.
pub const FILTERED_TYPE_ID: u8 = 11;

/// Fixed-width little-endian field holding a filtered chunk's stored size.
///
/// The width is chosen once, when the index is created, from the full chunk
/// size and reused for every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeField {
    width: u8,
}

impl SizeField {
    /// Field wide enough for chunks of `chunk_byte_size` bytes plus headroom.
    pub fn for_chunk_size(chunk_byte_size: u32) -> Self {
        Self {
            width: chunk_size_width(chunk_byte_size as u64),
        }
    }

    /// Encoded width in bytes.
    pub fn width(&self) -> u8 {
        self.width
    }

    /// Largest size the field can hold.
    pub fn max_value(&self) -> u64 {
        if self.width >= 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.width as u32)) - 1
        }
    }

    /// Appends `value` in exactly `width()` bytes.
    pub fn encode(&self, value: u64, buf: &mut BytesMut) {
        buf.put_uint_le(value, self.width as usize);
    }

    /// Reads a value from the first `width()` bytes of `raw`.
    pub fn decode(&self, raw: &[u8]) -> u64 {
        let width = self.width as usize;
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&raw[..width]);
        u64::from_le_bytes(bytes)
    }
}

/// Chunk record codec for the keyed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecordClass {
    ndims: usize,
    chunk_byte_size: u32,
    /// Stored-size field; `None` for unfiltered records.
    size_field: Option<SizeField>,
}

impl ChunkRecordClass {
    /// Codec for unfiltered chunks of `chunk_byte_size` bytes.
    pub fn unfiltered(ndims: usize, chunk_byte_size: u32) -> Self {
        Self {
            ndims,
            chunk_byte_size,
            size_field: None,
        }
    }

    /// Codec for filtered chunks whose unfiltered size is `chunk_byte_size`.
    pub fn filtered(ndims: usize, chunk_byte_size: u32) -> Self {
        Self {
            ndims,
            chunk_byte_size,
            size_field: Some(SizeField::for_chunk_size(chunk_byte_size)),
        }
    }

    /// Codec matching the context's filter setting.
    pub fn for_context(ctx: &IndexContext<'_>) -> Self {
        if ctx.has_filters {
            Self::filtered(ctx.ndims(), ctx.layout.chunk_byte_size())
        } else {
            Self::unfiltered(ctx.ndims(), ctx.layout.chunk_byte_size())
        }
    }

    /// Width of the stored size, for filtered records.
    pub fn size_width(&self) -> Option<u8> {
        self.size_field.map(|field| field.width())
    }

    /// Checks that `nbytes` can be stored in a record of this class.
    pub fn check_nbytes(&self, nbytes: u32) -> Result<()> {
        let fits = match self.size_field {
            Some(field) => nbytes as u64 <= field.max_value(),
            None => nbytes == self.chunk_byte_size,
        };
        if fits {
            Ok(())
        } else {
            Err(ChunkdexError::InvalidParameter {
                name: "nbytes".to_string(),
                value: nbytes.to_string(),
            })
        }
    }
}

impl Bt2Class for ChunkRecordClass {
    type Record = ChunkRecord;
    type Key = [u64];

    fn type_id(&self) -> u8 {
        if self.size_field.is_some() {
            FILTERED_TYPE_ID
        } else {
            UNFILTERED_TYPE_ID
        }
    }

    fn record_size(&self) -> usize {
        let sized = self.size_field.map_or(0, |f| f.width() as usize + 4);
        8 + sized + self.ndims * 8
    }

    fn encode(&self, record: &ChunkRecord, buf: &mut BytesMut) {
        buf.put_slice(&FileAddr::encode(Some(record.addr)));
        if let Some(field) = self.size_field {
            field.encode(record.nbytes as u64, buf);
            buf.put_u32_le(record.filter_mask);
        }
        for coord in &record.scaled {
            buf.put_u64_le(*coord);
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<ChunkRecord> {
        if raw.len() < self.record_size() {
            return Err(ChunkdexError::corrupt("truncated chunk record"));
        }
        let addr = FileAddr::decode(raw)
            .ok_or_else(|| ChunkdexError::corrupt("chunk record has undefined address"))?;

        let mut at = 8;
        let (nbytes, filter_mask) = match self.size_field {
            Some(field) => {
                let nbytes = field.decode(&raw[at..]);
                at += field.width() as usize;
                let mask = u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
                at += 4;
                let nbytes = u32::try_from(nbytes).map_err(|_| {
                    ChunkdexError::Corrupt(format!("chunk record size {} is too large", nbytes))
                })?;
                (nbytes, mask)
            }
            None => (self.chunk_byte_size, 0),
        };

        let scaled = raw[at..at + self.ndims * 8]
            .chunks_exact(8)
            .map(|word| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(word);
                u64::from_le_bytes(bytes)
            })
            .collect();

        Ok(ChunkRecord {
            scaled,
            addr,
            nbytes,
            filter_mask,
        })
    }

    fn compare(&self, key: &[u64], record: &ChunkRecord) -> Ordering {
        key.cmp(record.scaled.as_slice())
    }
}

/// Chunk index backed by a keyed tree.
pub struct Bt2Index {
    root: Option<FileAddr>,
    config: Bt2Config,
    shared: Option<Arc<SharedIndexState>>,
    tree: Option<Bt2<ChunkRecordClass>>,
}

impl std::fmt::Debug for Bt2Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bt2Index")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("open", &self.tree.is_some())
            .finish()
    }
}

impl Bt2Index {
    /// Index handle for the tree whose header is at `root`, or for a tree not
    /// yet created.
    pub fn new(root: Option<FileAddr>, config: Bt2Config) -> Self {
        Self {
            root,
            config,
            shared: None,
            tree: None,
        }
    }

    /// Header address.
    pub fn root(&self) -> Option<FileAddr> {
        self.root
    }

    /// Shared state, while the index is open.
    pub fn shared_state(&self) -> Option<&Arc<SharedIndexState>> {
        self.shared.as_ref()
    }

    fn acquire_state(&mut self, ctx: &IndexContext<'_>, root: FileAddr, class: &ChunkRecordClass) -> Result<()> {
        let node_size = self.config.node_size;
        let layout = IndexLayout::Bt2 {
            node_size,
            record_size: class.record_size(),
            size_width: class.size_width(),
        };
        let state = ctx
            .registry
            .acquire(ctx.file, root, ctx.ndims(), || Ok(layout))?;
        self.shared = Some(state);
        Ok(())
    }

    /// Returns the open tree, opening it on first use and patching the file
    /// handle on every call.
    fn tree(&mut self, ctx: &IndexContext<'_>) -> Result<Option<&mut Bt2<ChunkRecordClass>>> {
        let Some(root) = self.root else {
            return Ok(None);
        };

        if self.tree.is_none() {
            let class = ChunkRecordClass::for_context(ctx);
            self.acquire_state(ctx, root, &class)?;
            let mut tree = Bt2::open(ctx.file.clone(), class, root)?;
            if ctx.file.is_swmr_write() {
                if let Some(owner) = ctx.owner {
                    tree.depend(owner)?;
                }
            }
            self.tree = Some(tree);
        }

        if let Some(state) = &self.shared {
            state.patch_file(ctx.file);
        }
        let tree = self.tree.as_mut().map(|tree| {
            tree.patch_file(ctx.file.clone());
            tree
        });
        Ok(tree)
    }

    pub fn create(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        if let Some(root) = self.root {
            return Err(ChunkdexError::AlreadyCreated(format!(
                "keyed index at {}",
                root
            )));
        }

        let class = ChunkRecordClass::for_context(ctx);
        let mut tree = Bt2::create(ctx.file.clone(), class.clone(), &self.config)?;
        let root = tree.addr();
        if ctx.file.is_swmr_write() {
            if let Some(owner) = ctx.owner {
                tree.depend(owner)?;
            }
        }
        self.acquire_state(ctx, root, &class)?;
        self.root = Some(root);
        self.tree = Some(tree);

        tracing::debug!(root = %root, filtered = ctx.has_filters, "keyed chunk index created");
        Ok(())
    }

    pub fn open(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        self.tree(ctx)?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(mut tree) = self.tree.take() {
            tree.undepend()?;
        }
        self.shared = None;
        Ok(())
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
        let tree = self
            .tree(ctx)?
            .ok_or_else(|| ChunkdexError::internal("keyed index has no root"))?;
        tree.class().check_nbytes(desc.nbytes)?;

        let record = ChunkRecord {
            scaled: desc.scaled.clone(),
            addr,
            nbytes: desc.nbytes,
            filter_mask: desc.filter_mask,
        };
        let replacement = record.clone();
        let status = tree.update(desc.scaled.as_slice(), record, |existing| {
            if *existing == replacement {
                return Ok(false);
            }
            *existing = replacement.clone();
            Ok(true)
        })?;

        let status = match status {
            UpdateStatus::Inserted => InsertStatus::Created,
            UpdateStatus::Modified => InsertStatus::Changed,
            UpdateStatus::Unchanged => InsertStatus::Unchanged,
        };
        tracing::trace!(scaled = ?desc.scaled, %addr, ?status, "keyed index insert");
        Ok(Insertion { addr, status })
    }

    pub fn lookup(
        &mut self,
        ctx: &IndexContext<'_>,
        scaled: &[u64],
    ) -> Result<Option<ChunkDescriptor>> {
        ctx.layout.check_scaled(scaled)?;
        let Some(tree) = self.tree(ctx)? else {
            return Ok(None);
        };
        Ok(tree.find(scaled)?.map(ChunkDescriptor::from))
    }

    pub fn iterate<F>(&mut self, ctx: &IndexContext<'_>, op: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&ChunkRecord) -> Result<ControlFlow<()>>,
    {
        match self.tree(ctx)? {
            Some(tree) => tree.iterate(op),
            None => Ok(ControlFlow::Continue(())),
        }
    }

    pub fn remove(&mut self, ctx: &IndexContext<'_>, scaled: &[u64]) -> Result<()> {
        ctx.layout.check_scaled(scaled)?;
        let Some(tree) = self.tree(ctx)? else {
            return Ok(());
        };

        let record = match tree.remove(scaled) {
            Ok(record) => record,
            Err(ChunkdexError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if !ctx.file.is_swmr_write() {
            ctx.file.free(record.addr, record.nbytes as u64)?;
        }
        tracing::trace!(?scaled, addr = %record.addr, "keyed index remove");
        Ok(())
    }

    pub fn delete_all(&mut self, ctx: &IndexContext<'_>) -> Result<()> {
        if self.tree(ctx)?.is_none() {
            return Ok(());
        }
        let Some(tree) = self.tree.take() else {
            return Ok(());
        };

        let file = ctx.file.clone();
        tree.delete(|record| file.free(record.addr, record.nbytes as u64))?;
        tracing::debug!(root = ?self.root, "keyed chunk index deleted");
        self.root = None;
        self.shared = None;
        Ok(())
    }

    pub fn size_on_disk(&mut self, ctx: &IndexContext<'_>) -> Result<u64> {
        match self.tree(ctx)? {
            Some(tree) => tree.size(),
            None => Ok(0),
        }
    }

    pub fn reset(&mut self, reset_addr: bool) {
        if reset_addr {
            self.root = None;
        }
        self.tree = None;
        self.shared = None;
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(scaled: Vec<u64>, addr: u64, nbytes: u32, mask: u32) -> ChunkRecord {
        ChunkRecord {
            scaled,
            addr: FileAddr::new(addr).unwrap(),
            nbytes,
            filter_mask: mask,
        }
    }

    #[test]
    fn test_unfiltered_record_layout() {
        let class = ChunkRecordClass::unfiltered(2, 64);
        assert_eq!(class.type_id(), UNFILTERED_TYPE_ID);
        assert_eq!(class.record_size(), 8 + 16);

        let original = record(vec![3, 4], 4096, 64, 0);
        let mut buf = BytesMut::new();
        class.encode(&original, &mut buf);
        assert_eq!(buf.len(), class.record_size());
        assert_eq!(class.decode(&buf).unwrap(), original);
    }

    #[test]
    fn test_filtered_record_layout() {
        // 1000-byte chunks fit in 2 bytes, plus one byte of headroom
        let class = ChunkRecordClass::filtered(1, 1000);
        assert_eq!(class.type_id(), FILTERED_TYPE_ID);
        assert_eq!(class.size_width(), Some(3));
        assert_eq!(class.record_size(), 8 + 3 + 4 + 8);

        let original = record(vec![7], 512, 731, 0b11);
        let mut buf = BytesMut::new();
        class.encode(&original, &mut buf);
        assert_eq!(&buf[8..11], &[0xDB, 0x02, 0x00]);
        assert_eq!(class.decode(&buf).unwrap(), original);
    }

    #[test]
    fn test_size_field_bounds() {
        let field = SizeField::for_chunk_size(100);
        assert_eq!(field.width(), 2);
        assert_eq!(field.max_value(), 0xFFFF);

        let mut buf = BytesMut::new();
        field.encode(0xBEEF, &mut buf);
        assert_eq!(buf.len(), 2);
        assert_eq!(field.decode(&buf), 0xBEEF);

        assert_eq!(SizeField::for_chunk_size(u32::MAX).width(), 5);
    }

    #[test]
    fn test_unfiltered_decode_uses_full_size() {
        let class = ChunkRecordClass::unfiltered(1, 256);
        let mut buf = BytesMut::new();
        class.encode(&record(vec![1], 64, 256, 0), &mut buf);
        let decoded = class.decode(&buf).unwrap();
        assert_eq!(decoded.nbytes, 256);
        assert_eq!(decoded.filter_mask, 0);
    }

    #[test]
    fn test_decode_undefined_address_is_corrupt() {
        let class = ChunkRecordClass::unfiltered(1, 16);
        let mut raw = vec![0xFF; 8];
        raw.extend_from_slice(&0u64.to_le_bytes());
        assert!(class.decode(&raw).unwrap_err().is_corruption());
    }

    #[test]
    fn test_check_nbytes() {
        let filtered = ChunkRecordClass::filtered(1, 100);
        assert!(filtered.check_nbytes(65_535).is_ok());
        assert!(filtered.check_nbytes(65_536).is_err());

        let unfiltered = ChunkRecordClass::unfiltered(1, 1000);
        assert!(unfiltered.check_nbytes(1000).is_ok());
        assert!(unfiltered.check_nbytes(999).is_err());
    }

    #[test]
    fn test_compare_is_lexicographic() {
        let class = ChunkRecordClass::unfiltered(2, 8);
        let stored = record(vec![1, 5], 0, 8, 0);
        assert_eq!(class.compare(&[1, 5], &stored), Ordering::Equal);
        assert_eq!(class.compare(&[0, 9], &stored), Ordering::Less);
        assert_eq!(class.compare(&[1, 6], &stored), Ordering::Greater);
        assert_eq!(class.compare(&[2, 0], &stored), Ordering::Greater);
    }
}
