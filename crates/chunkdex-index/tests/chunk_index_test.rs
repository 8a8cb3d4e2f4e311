//! Chunk index integration tests.
//!
//! Exercises every strategy through the `ChunkIndex` contract against a real
//! backing file:
//! - classic tree insert, lookup, ordered iteration and removal
//! - keyed tree filtered records and size changes
//! - implicit region allocation and addressing
//! - shared state across handles and file reopens
//! - whole-index copy, address maps and dumps

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

use chunkdex_common::{BTreeConfig, ChunkdexError, FileAddr, IndexConfig, Result, StorageConfig};
use chunkdex_index::{
    ChunkDescriptor, ChunkIndex, ChunkLayout, ChunkRecord, IndexContext, IndexKind,
    IndexRegistry, InsertStatus, Insertion, allocate_chunk, copy_chunks,
};
use chunkdex_storage::{
    Allocator, BlockFile, BlockFileConfig, FreeSpaceManager, StorageFile,
};

// =============================================================================
// Helpers
// =============================================================================

fn test_config() -> StorageConfig {
    StorageConfig {
        fsync_enabled: false,
        ..StorageConfig::default()
    }
}

fn create_test_file(name: &str) -> (Arc<StorageFile>, TempDir) {
    let dir = tempdir().unwrap();
    let file = StorageFile::create(dir.path().join(name), test_config()).unwrap();
    (file, dir)
}

fn small_tree_config() -> IndexConfig {
    IndexConfig {
        btree: BTreeConfig {
            k: 2,
            ..BTreeConfig::default()
        },
        ..IndexConfig::default()
    }
}

/// Allocates space for a chunk, writes `data` there and records the mapping.
fn write_chunk(
    ctx: &IndexContext<'_>,
    index: &mut ChunkIndex,
    scaled: &[u64],
    data: &[u8],
) -> Result<ChunkDescriptor> {
    let old = index.lookup(ctx, scaled)?;
    let mut desc = ChunkDescriptor::new(scaled.to_vec(), data.len() as u32);
    let need_insert = allocate_chunk(ctx, index, old.as_ref(), &mut desc)?;
    if need_insert {
        let Insertion { addr, .. } = index.insert_or_update(ctx, &desc)?;
        desc.address = Some(addr);
    }
    ctx.file.write(desc.address.unwrap(), data)?;
    Ok(desc)
}

fn collect(ctx: &IndexContext<'_>, index: &mut ChunkIndex) -> Vec<ChunkRecord> {
    let mut records = Vec::new();
    let _flow = index
        .iterate(ctx, |record| {
            records.push(record.clone());
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
    records
}

/// Allocator that remembers every extent it is asked to free.
struct RecordingAllocator {
    inner: FreeSpaceManager,
    frees: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl Allocator for RecordingAllocator {
    fn allocate(&mut self, size: u64) -> Result<FileAddr> {
        self.inner.allocate(size)
    }

    fn free(&mut self, addr: FileAddr, size: u64) -> Result<()> {
        self.frees.lock().push((addr.get(), size));
        self.inner.free(addr, size)
    }

    fn eoa(&self) -> u64 {
        self.inner.eoa()
    }

    fn free_bytes(&self) -> u64 {
        self.inner.free_bytes()
    }
}

// =============================================================================
// Classic tree
// =============================================================================

#[test]
fn test_btree_three_dimensional_chunks() {
    let (file, _dir) = create_test_file("btree3d.bin");
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(
        vec![4, 4, 4],
        vec![None, Some(4), Some(4)],
        vec![2, 2, 2],
        8,
    )
    .unwrap();
    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    let mut index = ChunkIndex::new(IndexKind::Btree, &IndexConfig::default());
    assert!(!index.is_space_allocated());

    let a = write_chunk(&ctx, &mut index, &[0, 0, 0], &[1u8; 64]).unwrap();
    let b = write_chunk(&ctx, &mut index, &[0, 0, 1], &[2u8; 64]).unwrap();
    assert!(index.is_space_allocated());

    let records = collect(&ctx, &mut index);
    let scaled: Vec<Vec<u64>> = records.iter().map(|r| r.scaled.clone()).collect();
    assert_eq!(scaled, vec![vec![0, 0, 0], vec![0, 0, 1]]);
    assert_eq!(records[0].addr, a.address.unwrap());
    assert_eq!(records[1].addr, b.address.unwrap());

    let found = index.lookup(&ctx, &[0, 0, 1]).unwrap().unwrap();
    assert_eq!(found.nbytes, 64);
    assert_eq!(found.address, b.address);
    assert_eq!(file.read(found.address.unwrap(), 64).unwrap(), vec![2u8; 64]);

    assert!(index.lookup(&ctx, &[1, 0, 0]).unwrap().is_none());
}

#[test]
fn test_btree_iterates_in_key_order() {
    let (file, _dir) = create_test_file("order.bin");
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![40, 40], vec![None, Some(40)], vec![2, 2], 1).unwrap();
    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    let mut index = ChunkIndex::new(IndexKind::Btree, &small_tree_config());

    let mut coords: Vec<Vec<u64>> = (0..20)
        .flat_map(|i| (0..20).map(move |j| vec![i, j]))
        .collect();
    coords.shuffle(&mut rand::rng());
    for scaled in &coords {
        write_chunk(&ctx, &mut index, scaled, &[0u8; 4]).unwrap();
    }

    let visited: Vec<Vec<u64>> = collect(&ctx, &mut index)
        .into_iter()
        .map(|r| r.scaled)
        .collect();
    let mut expected = coords.clone();
    expected.sort();
    assert_eq!(visited, expected);

    for scaled in &coords {
        assert!(index.lookup(&ctx, scaled).unwrap().is_some(), "missing {:?}", scaled);
    }
    // 400 chunks at 4 children per node
    assert!(index.size_on_disk(&ctx).unwrap() > 100 * 4);
}

#[test]
fn test_btree_resize_reports_change() {
    let (file, _dir) = create_test_file("resize.bin");
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![16], vec![None], vec![16], 1).unwrap();
    let ctx = IndexContext::new(&file, &layout)
        .with_registry(&registry)
        .with_filters(true);
    let mut index = ChunkIndex::new(IndexKind::Btree, &IndexConfig::default());

    write_chunk(&ctx, &mut index, &[0], &[7u8; 12]).unwrap();

    let old = index.lookup(&ctx, &[0]).unwrap().unwrap();
    assert_eq!(old.nbytes, 12);
    let mut shrunk = ChunkDescriptor::new(vec![0], 5).with_filter_mask(0b1);
    assert!(allocate_chunk(&ctx, &index, Some(&old), &mut shrunk).unwrap());
    let insertion = index.insert_or_update(&ctx, &shrunk).unwrap();
    assert_eq!(insertion.status, InsertStatus::Changed);
    // The freed extent is reused for the smaller chunk
    assert_eq!(Some(insertion.addr), old.address);

    let found = index.lookup(&ctx, &[0]).unwrap().unwrap();
    assert_eq!(found.nbytes, 5);
    assert_eq!(found.filter_mask, 1);
    assert_eq!(found.address, Some(insertion.addr));
}

#[test]
fn test_remove_then_lookup_frees_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("frees.bin");
    let frees = Arc::new(Mutex::new(Vec::new()));
    let disk = BlockFile::create(
        &path,
        BlockFileConfig {
            fsync_enabled: false,
            read_only: false,
        },
    )
    .unwrap();
    let allocator = RecordingAllocator {
        inner: FreeSpaceManager::new(0),
        frees: frees.clone(),
    };
    let file = StorageFile::with_allocator(disk, Box::new(allocator), test_config());

    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![100], vec![None], vec![2], 4).unwrap();
    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    let mut index = ChunkIndex::new(IndexKind::Btree, &small_tree_config());

    let mut chunk_addrs = Vec::new();
    for i in 0..50 {
        let desc = write_chunk(&ctx, &mut index, &[i], &[i as u8; 8]).unwrap();
        chunk_addrs.push(desc.address.unwrap().get());
    }

    for i in (0..50).step_by(3) {
        index.remove(&ctx, &[i]).unwrap();
        // Second removal of the same chunk is a no-op
        index.remove(&ctx, &[i]).unwrap();
        assert!(index.lookup(&ctx, &[i]).unwrap().is_none());
    }
    for i in 0..50u64 {
        assert_eq!(index.lookup(&ctx, &[i]).unwrap().is_some(), i % 3 != 0);
    }

    let chunk_set: HashSet<u64> = chunk_addrs.iter().copied().collect();
    let chunk_frees: Vec<(u64, u64)> = frees
        .lock()
        .iter()
        .copied()
        .filter(|(addr, _)| chunk_set.contains(addr))
        .collect();
    assert_eq!(chunk_frees.len(), 17);
    assert!(chunk_frees.iter().all(|(_, size)| *size == 8));

    index.delete_all(&ctx).unwrap();
    assert!(!index.is_space_allocated());
    assert_eq!(file.allocated_bytes(), 0);

    let freed: Vec<u64> = frees
        .lock()
        .iter()
        .map(|(addr, _)| *addr)
        .filter(|addr| chunk_set.contains(addr))
        .collect();
    let unique: HashSet<u64> = freed.iter().copied().collect();
    assert_eq!(freed.len(), 50);
    assert_eq!(unique.len(), 50);
}

// =============================================================================
// Keyed tree
// =============================================================================

#[test]
fn test_bt2_filtered_size_change_reclaims_space() {
    let (file, _dir) = create_test_file("bt2f.bin");
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![256], vec![None], vec![256], 1).unwrap();
    let ctx = IndexContext::new(&file, &layout)
        .with_registry(&registry)
        .with_filters(true);
    let mut index = ChunkIndex::new(IndexKind::Bt2, &IndexConfig::default());

    let mut desc = ChunkDescriptor::new(vec![0], 100).with_filter_mask(0b10);
    assert!(allocate_chunk(&ctx, &index, None, &mut desc).unwrap());
    let created = index.insert_or_update(&ctx, &desc).unwrap();
    assert_eq!(created.status, InsertStatus::Created);
    let index_bytes = index.size_on_disk(&ctx).unwrap();
    assert_eq!(file.allocated_bytes(), index_bytes + 100);

    let old = index.lookup(&ctx, &[0]).unwrap().unwrap();
    assert_eq!(old.nbytes, 100);
    assert_eq!(old.filter_mask, 0b10);

    let mut smaller = ChunkDescriptor::new(vec![0], 50).with_filter_mask(0b10);
    assert!(allocate_chunk(&ctx, &index, Some(&old), &mut smaller).unwrap());
    let changed = index.insert_or_update(&ctx, &smaller).unwrap();
    assert_eq!(changed.status, InsertStatus::Changed);
    assert_eq!(file.allocated_bytes(), index.size_on_disk(&ctx).unwrap() + 50);

    let found = index.lookup(&ctx, &[0]).unwrap().unwrap();
    assert_eq!(found.nbytes, 50);
    assert_eq!(found.address, smaller.address);
}

#[test]
fn test_bt2_two_unlimited_dims() {
    let (file, _dir) = create_test_file("bt2u.bin");
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![10, 10], vec![None, None], vec![2, 5], 2).unwrap();
    assert_eq!(ChunkIndex::select(&layout, false, false, false), IndexKind::Bt2);

    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    let mut index = ChunkIndex::new(IndexKind::Bt2, &IndexConfig::default());

    let mut coords: Vec<Vec<u64>> = (0..30)
        .flat_map(|i| (0..30).map(move |j| vec![i, j]))
        .collect();
    coords.shuffle(&mut rand::rng());
    for scaled in &coords {
        write_chunk(&ctx, &mut index, scaled, &[1u8; 20]).unwrap();
    }

    let visited: Vec<Vec<u64>> = collect(&ctx, &mut index)
        .into_iter()
        .map(|r| r.scaled)
        .collect();
    let mut expected = coords.clone();
    expected.sort();
    assert_eq!(visited, expected);

    for scaled in coords.iter().take(300) {
        index.remove(&ctx, scaled).unwrap();
    }
    assert_eq!(collect(&ctx, &mut index).len(), 600);

    index.delete_all(&ctx).unwrap();
    assert_eq!(file.allocated_bytes(), 0);
}

#[test]
fn test_bt2_swmr_registers_flush_dependency() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        swmr_write: true,
        ..test_config()
    };
    let file = StorageFile::create(dir.path().join("swmr.bin"), config).unwrap();
    let owner = file.allocate(64).unwrap();
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![8], vec![None], vec![4], 1).unwrap();
    let ctx = IndexContext::new(&file, &layout)
        .with_registry(&registry)
        .with_owner(owner);

    let mut index = ChunkIndex::new(IndexKind::Bt2, &IndexConfig::default());
    index.create(&ctx).unwrap();
    let root = index.root().unwrap();
    assert!(file.flush_dependencies().contains(owner, root));

    index.close().unwrap();
    assert!(!file.flush_dependencies().contains(owner, root));
}

// =============================================================================
// Implicit index
// =============================================================================

#[test]
fn test_implicit_preallocates_region() {
    let (file, _dir) = create_test_file("implicit.bin");
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::fixed(vec![6 * 256], vec![256], 4).unwrap();
    assert_eq!(layout.chunk_byte_size(), 1024);
    assert_eq!(ChunkIndex::select(&layout, false, true, false), IndexKind::Implicit);

    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    let mut index = ChunkIndex::new(IndexKind::Implicit, &IndexConfig::default());
    index.create(&ctx).unwrap();
    assert_eq!(file.allocated_bytes(), 6144);
    assert_eq!(index.size_on_disk(&ctx).unwrap(), 0);

    let err = index.remove(&ctx, &[2]).unwrap_err();
    assert!(matches!(err, ChunkdexError::UnsupportedOperation(_)));
    assert!(matches!(
        index.create(&ctx).unwrap_err(),
        ChunkdexError::AlreadyCreated(_)
    ));

    let desc = write_chunk(&ctx, &mut index, &[3], &[9u8; 1024]).unwrap();
    let base = index.root().unwrap().get();
    assert_eq!(desc.address.unwrap().get(), base + 3 * 1024);
    assert_eq!(file.allocated_bytes(), 6144);
    assert_eq!(collect(&ctx, &mut index).len(), 6);
}

// =============================================================================
// Every strategy
// =============================================================================

#[test]
fn test_round_trip_every_strategy() {
    for kind in [IndexKind::Btree, IndexKind::Bt2, IndexKind::Implicit] {
        let (file, _dir) = create_test_file("roundtrip.bin");
        let registry = IndexRegistry::new();
        let layout = ChunkLayout::fixed(vec![8, 8], vec![2, 4], 2).unwrap();
        let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
        let mut index = ChunkIndex::new(kind, &IndexConfig::default());
        if kind == IndexKind::Implicit {
            index.create(&ctx).unwrap();
        }

        let mut written = Vec::new();
        for i in 0..4u64 {
            for j in 0..2u64 {
                let data = vec![(i * 2 + j) as u8; 16];
                written.push(write_chunk(&ctx, &mut index, &[i, j], &data).unwrap());
            }
        }

        for desc in &written {
            let found = index.lookup(&ctx, &desc.scaled).unwrap().unwrap();
            assert_eq!(found.address, desc.address, "{} {:?}", kind, desc.scaled);
            assert_eq!(found.nbytes, 16);
            let data = file.read(found.address.unwrap(), 16).unwrap();
            let expected = (desc.scaled[0] * 2 + desc.scaled[1]) as u8;
            assert!(data.iter().all(|b| *b == expected));
        }
        assert_eq!(collect(&ctx, &mut index).len(), 8, "{}", kind);
    }
}

#[test]
fn test_insert_is_idempotent() {
    for kind in [IndexKind::Btree, IndexKind::Bt2] {
        let (file, _dir) = create_test_file("idem.bin");
        let registry = IndexRegistry::new();
        let layout = ChunkLayout::new(vec![8], vec![None], vec![4], 4).unwrap();
        let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
        let mut index = ChunkIndex::new(kind, &IndexConfig::default());

        let desc = ChunkDescriptor::new(vec![1], 16).with_address(file.allocate(16).unwrap());
        let first = index.insert_or_update(&ctx, &desc).unwrap();
        let second = index.insert_or_update(&ctx, &desc).unwrap();
        assert_eq!(first.status, InsertStatus::Created, "{}", kind);
        assert_eq!(second.status, InsertStatus::Unchanged, "{}", kind);
        assert_eq!(second.addr, first.addr);
        assert_eq!(collect(&ctx, &mut index).len(), 1);
    }
}

#[test]
fn test_iterate_stops_early() {
    for kind in [IndexKind::Btree, IndexKind::Bt2] {
        let (file, _dir) = create_test_file("stop.bin");
        let registry = IndexRegistry::new();
        let layout = ChunkLayout::new(vec![64], vec![None], vec![1], 4).unwrap();
        let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
        let mut index = ChunkIndex::new(kind, &small_tree_config());
        for i in 0..40 {
            write_chunk(&ctx, &mut index, &[i], &[0u8; 4]).unwrap();
        }

        let mut seen = 0;
        let flow = index
            .iterate(&ctx, |_| {
                seen += 1;
                Ok(if seen == 10 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .unwrap();
        assert!(flow.is_break());
        assert_eq!(seen, 10, "{}", kind);
    }
}

#[test]
fn test_lookup_on_unallocated_index() {
    let (file, _dir) = create_test_file("empty.bin");
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![8], vec![None], vec![4], 4).unwrap();
    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);

    for kind in [IndexKind::Btree, IndexKind::Bt2, IndexKind::Implicit] {
        let mut index = ChunkIndex::new(kind, &IndexConfig::default());
        assert!(index.lookup(&ctx, &[0]).unwrap().is_none());
        assert!(collect(&ctx, &mut index).is_empty());
        assert_eq!(index.size_on_disk(&ctx).unwrap(), 0);
        index.delete_all(&ctx).unwrap();
    }
    assert_eq!(file.allocated_bytes(), 0);
}

// =============================================================================
// Shared state
// =============================================================================

#[test]
fn test_shared_state_across_handles_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.bin");
    let first = StorageFile::create(&path, test_config()).unwrap();
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![8], vec![None], vec![4], 4).unwrap();
    let ctx = IndexContext::new(&first, &layout).with_registry(&registry);

    let mut a = ChunkIndex::new(IndexKind::Btree, &IndexConfig::default());
    write_chunk(&ctx, &mut a, &[0], &[5u8; 16]).unwrap();
    first.flush().unwrap();

    let mut b = ChunkIndex::from_storage(IndexKind::Btree, a.root(), &IndexConfig::default());
    b.open(&ctx).unwrap();
    let state = a.shared_state().unwrap().clone();
    assert!(Arc::ptr_eq(&state, b.shared_state().unwrap()));
    assert_eq!(Arc::strong_count(&state), 3);

    // A second open of the same path is patched into the shared state
    let second = StorageFile::open(&path, test_config()).unwrap();
    let reopened = IndexContext::new(&second, &layout).with_registry(&registry);
    let found = b.lookup(&reopened, &[0]).unwrap().unwrap();
    assert_eq!(found.nbytes, 16);
    assert_eq!(state.file().id(), second.id());

    a.destroy().unwrap();
    assert_eq!(registry.len(), 1);
    b.destroy().unwrap();
    drop(state);
    assert!(registry.is_empty());
}

// =============================================================================
// Copy and diagnostics
// =============================================================================

#[test]
fn test_copy_between_files_and_strategies() {
    let dir = tempdir().unwrap();
    let src_file = StorageFile::create(dir.path().join("src.bin"), test_config()).unwrap();
    let dst_file = StorageFile::create(dir.path().join("dst.bin"), test_config()).unwrap();
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![12], vec![None], vec![2], 4).unwrap();
    let src_ctx = IndexContext::new(&src_file, &layout).with_registry(&registry);
    let dst_ctx = IndexContext::new(&dst_file, &layout).with_registry(&registry);

    let mut src = ChunkIndex::new(IndexKind::Btree, &IndexConfig::default());
    for i in 0..6u64 {
        write_chunk(&src_ctx, &mut src, &[i], &[i as u8 + 1; 8]).unwrap();
    }

    let mut dst = ChunkIndex::new(IndexKind::Bt2, &IndexConfig::default());
    let copied = copy_chunks(&mut src, &src_ctx, &mut dst, &dst_ctx).unwrap();
    assert_eq!(copied, 6);
    assert!(dst.is_space_allocated());

    for i in 0..6u64 {
        let found = dst.lookup(&dst_ctx, &[i]).unwrap().unwrap();
        let data = dst_file.read(found.address.unwrap(), 8).unwrap();
        assert_eq!(data, vec![i as u8 + 1; 8]);
    }
    assert_eq!(collect(&src_ctx, &mut src).len(), 6);
}

#[test]
fn test_address_map_and_dump() {
    let (file, _dir) = create_test_file("map.bin");
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![4, 4], vec![None, Some(4)], vec![2, 2], 1).unwrap();
    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    let mut index = ChunkIndex::new(IndexKind::Btree, &IndexConfig::default());

    let b = write_chunk(&ctx, &mut index, &[0, 1], &[0u8; 4]).unwrap();
    let c = write_chunk(&ctx, &mut index, &[1, 0], &[0u8; 4]).unwrap();
    // Beyond the current extents: kept in the index, left out of the map
    write_chunk(&ctx, &mut index, &[5, 0], &[0u8; 4]).unwrap();

    let map = index.address_map(&ctx).unwrap();
    assert_eq!(map, vec![None, b.address, c.address, None]);

    let dump = index.dump(&ctx).unwrap();
    assert!(dump.starts_with("btree chunk index, root @"));
    assert!(dump.contains("[0, 1] ->"));
    assert!(dump.contains("3 chunks"));
}

// =============================================================================
// Bounds and extents
// =============================================================================

#[test]
fn test_implicit_rejects_chunks_outside_region() {
    let (file, _dir) = create_test_file("bounds.bin");
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::fixed(vec![12], vec![4], 4).unwrap();
    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    let mut index = ChunkIndex::new(IndexKind::Implicit, &IndexConfig::default());
    index.create(&ctx).unwrap();
    let base = index.root().unwrap().get();

    let err = write_chunk(&ctx, &mut index, &[3], &[1u8; 16]).unwrap_err();
    assert!(matches!(err, ChunkdexError::InvalidParameter { .. }));
    let err = index
        .insert_or_update(&ctx, &ChunkDescriptor::new(vec![3], 16))
        .unwrap_err();
    assert!(matches!(err, ChunkdexError::InvalidParameter { .. }));

    // Space after the region belongs to whoever allocates it next
    let neighbour = file.allocate(16).unwrap();
    assert_eq!(neighbour.get(), base + 48);
    let last = write_chunk(&ctx, &mut index, &[2], &[2u8; 16]).unwrap();
    assert!(last.address.unwrap().get() + 16 <= neighbour.get());
}

#[test]
fn test_btree_rejects_oversized_coordinate() {
    let (file, _dir) = create_test_file("oversized.bin");
    let registry = IndexRegistry::new();
    let layout = ChunkLayout::new(vec![8], vec![None], vec![4], 1).unwrap();
    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    let mut index = ChunkIndex::new(IndexKind::Btree, &IndexConfig::default());

    let first = write_chunk(&ctx, &mut index, &[0], &[5u8; 4]).unwrap();

    let huge = ChunkDescriptor::new(vec![1 << 62], 4).with_address(file.allocate(4).unwrap());
    let err = index.insert_or_update(&ctx, &huge).unwrap_err();
    assert!(matches!(err, ChunkdexError::InvalidParameter { .. }));
    let mut huge = ChunkDescriptor::new(vec![1 << 62], 4);
    assert!(allocate_chunk(&ctx, &index, None, &mut huge).is_err());

    // The tree is still readable
    let found = index.lookup(&ctx, &[0]).unwrap().unwrap();
    assert_eq!(found.address, first.address);
    assert!(index.lookup(&ctx, &[1 << 62]).is_err());
    assert_eq!(collect(&ctx, &mut index).len(), 1);
}

#[test]
fn test_reopen_keeps_unwritten_region_reserved() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.bin");
    let layout = ChunkLayout::fixed(vec![12], vec![4], 4).unwrap();
    let registry = IndexRegistry::new();

    let root = {
        let file = StorageFile::create(&path, test_config()).unwrap();
        let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
        let mut index = ChunkIndex::new(IndexKind::Implicit, &IndexConfig::default());
        index.create(&ctx).unwrap();
        // Only the first of three chunks is ever written
        write_chunk(&ctx, &mut index, &[0], &[1u8; 16]).unwrap();
        index.close().unwrap();
        file.flush().unwrap();
        index.root().unwrap()
    };

    let file = StorageFile::open(&path, test_config()).unwrap();
    assert_eq!(file.eoa(), root.get() + 48);
    let other = file.allocate(16).unwrap();
    assert!(other.get() >= root.get() + 48);
    file.write(other, &[7u8; 16]).unwrap();

    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    let mut index = ChunkIndex::from_storage(IndexKind::Implicit, Some(root), &IndexConfig::default());
    index.open(&ctx).unwrap();
    let last = write_chunk(&ctx, &mut index, &[2], &[2u8; 16]).unwrap();
    assert_eq!(last.address.unwrap().get(), root.get() + 32);
    assert_eq!(file.read(other, 16).unwrap(), vec![7u8; 16]);
    assert_eq!(file.read(root, 16).unwrap(), vec![1u8; 16]);
}

#[test]
fn test_layout_from_json_is_validated() {
    let bad = r#"{"dims":[4],"max_dims":[4],"chunk_dims":[0],"element_size":1}"#;
    assert!(serde_json::from_str::<ChunkLayout>(bad).is_err());

    let good = r#"{"dims":[4],"max_dims":[null],"chunk_dims":[2],"element_size":1}"#;
    let layout: ChunkLayout = serde_json::from_str(good).unwrap();
    let (file, _dir) = create_test_file("json.bin");
    let registry = IndexRegistry::new();
    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    let mut index = ChunkIndex::new(IndexKind::Btree, &IndexConfig::default());
    write_chunk(&ctx, &mut index, &[1], &[3u8; 2]).unwrap();
    assert!(index.lookup(&ctx, &[0]).unwrap().is_none());
    assert_eq!(index.lookup(&ctx, &[1]).unwrap().unwrap().nbytes, 2);
}

#[test]
fn test_prune_by_extent_removes_outside_chunks() {
    for kind in [IndexKind::Btree, IndexKind::Bt2] {
        let (file, _dir) = create_test_file("prune.bin");
        let registry = IndexRegistry::new();
        let mut layout =
            ChunkLayout::new(vec![8, 8], vec![None, Some(8)], vec![2, 2], 1).unwrap();
        let mut index = ChunkIndex::new(kind, &small_tree_config());

        {
            let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
            for row in 0..4 {
                for col in 0..4 {
                    write_chunk(&ctx, &mut index, &[row, col], &[row as u8; 4]).unwrap();
                }
            }
            assert_eq!(index.allocated_bytes(&ctx).unwrap(), 16 * 4);
            // Nothing lies outside yet
            assert_eq!(index.prune_by_extent(&ctx).unwrap(), 0);
        }

        // 8x8 -> 5x5 keeps chunks 0..3 along both axes, the edge ones partial
        layout.set_dims(vec![5, 5]).unwrap();
        let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
        let before = file.allocated_bytes();
        assert_eq!(index.prune_by_extent(&ctx).unwrap(), 7, "{}", kind);
        assert!(file.allocated_bytes() <= before - 7 * 4, "{}", kind);

        assert_eq!(index.allocated_bytes(&ctx).unwrap(), 9 * 4);
        assert!(index.lookup(&ctx, &[2, 2]).unwrap().is_some());
        assert!(index.lookup(&ctx, &[3, 0]).unwrap().is_none());
        assert!(index.lookup(&ctx, &[0, 3]).unwrap().is_none());
        let kept: HashSet<Vec<u64>> = collect(&ctx, &mut index).into_iter().map(|r| r.scaled).collect();
        assert_eq!(kept.len(), 9);
        assert!(kept.iter().all(|s| s[0] < 3 && s[1] < 3));
        assert_eq!(index.prune_by_extent(&ctx).unwrap(), 0);
    }
}

#[test]
fn test_implicit_prune_keeps_region() {
    let (file, _dir) = create_test_file("prune_implicit.bin");
    let registry = IndexRegistry::new();
    let mut layout = ChunkLayout::fixed(vec![16], vec![4], 2).unwrap();
    let mut index = ChunkIndex::new(IndexKind::Implicit, &IndexConfig::default());
    {
        let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
        index.create(&ctx).unwrap();
    }

    layout.set_dims(vec![6]).unwrap();
    let ctx = IndexContext::new(&file, &layout).with_registry(&registry);
    assert_eq!(index.prune_by_extent(&ctx).unwrap(), 0);
    assert_eq!(index.allocated_bytes(&ctx).unwrap(), 4 * 8);
    assert_eq!(file.allocated_bytes(), 4 * 8);
}
