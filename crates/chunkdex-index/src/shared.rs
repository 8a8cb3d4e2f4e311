//! Index state shared by every handle open on the same on-disk structure.
//!
//! Two dataset handles that open the same index (same file path, same root
//! address) get the same `Arc<SharedIndexState>` from the registry. The
//! `Arc` strong count is the reference count: the state lives while any
//! handle holds it and is torn down in `Drop` when the last one lets go.
//!
//! Everything in the state is fixed after creation except the file handle,
//! which every entry point re-points at the caller's current open.

use chunkdex_common::{ChunkdexError, FileAddr, Result};
use chunkdex_storage::{BTreeShared, StorageFile};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};

type StateMap = HashMap<StateKey, Weak<SharedIndexState>>;

static GLOBAL_REGISTRY: LazyLock<IndexRegistry> = LazyLock::new(IndexRegistry::new);

/// Identity of one on-disk index structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StateKey {
    path: PathBuf,
    root: FileAddr,
}

impl StateKey {
    fn new(path: &Path, root: FileAddr) -> Self {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self { path, root }
    }
}

/// Per-strategy layout facts cached with the shared state.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexLayout {
    /// Classic tree node layout.
    Btree(BTreeShared),
    /// Keyed tree record layout.
    Bt2 {
        /// Size of every tree node.
        node_size: u32,
        /// Encoded record size.
        record_size: usize,
        /// Width of the stored chunk size for filtered records.
        size_width: Option<u8>,
    },
    /// Implicit region layout.
    Implicit {
        /// Bytes per chunk.
        chunk_byte_size: u32,
        /// Chunks in the pre-allocated region.
        max_nchunks: u64,
    },
}

/// In-memory state for one on-disk index, shared across handles.
pub struct SharedIndexState {
    key: StateKey,
    ndims: usize,
    layout: IndexLayout,
    file: RwLock<Arc<StorageFile>>,
    registry: Weak<Mutex<StateMap>>,
}

impl SharedIndexState {
    /// Number of chunked dimensions.
    pub fn ndims(&self) -> usize {
        self.ndims
    }

    /// Cached layout.
    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    /// Root address the state is keyed by.
    pub fn root(&self) -> FileAddr {
        self.key.root
    }

    /// The file handle most recently patched in.
    pub fn file(&self) -> Arc<StorageFile> {
        self.file.read().clone()
    }

    /// Classic tree layout, if this state belongs to a classic index.
    pub fn btree_layout(&self) -> Result<&BTreeShared> {
        match &self.layout {
            IndexLayout::Btree(shared) => Ok(shared),
            other => Err(ChunkdexError::Internal(format!(
                "expected classic tree layout, found {:?}",
                other
            ))),
        }
    }

    /// Re-points the cached file handle. Returns true if it changed.
    pub fn patch_file(&self, file: &Arc<StorageFile>) -> bool {
        let mut current = self.file.write();
        if Arc::ptr_eq(&current, file) {
            return false;
        }
        tracing::warn!(
            root = %self.key.root,
            stale = %current.id(),
            current = %file.id(),
            "patching stale file handle in shared index state"
        );
        *current = file.clone();
        true
    }
}

impl Drop for SharedIndexState {
    fn drop(&mut self) {
        if let Some(states) = self.registry.upgrade() {
            let mut states = states.lock();
            // A newer state may already be registered under the same key
            if states.get(&self.key).is_some_and(|w| w.strong_count() == 0) {
                states.remove(&self.key);
            }
        }
        tracing::debug!(root = %self.key.root, "shared index state released");
    }
}

impl std::fmt::Debug for SharedIndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedIndexState")
            .field("path", &self.key.path)
            .field("root", &self.key.root)
            .field("ndims", &self.ndims)
            .field("layout", &self.layout)
            .finish()
    }
}

/// Registry handing out shared index state.
#[derive(Debug, Clone, Default)]
pub struct IndexRegistry {
    states: Arc<Mutex<StateMap>>,
}

impl IndexRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used unless a context names another.
    pub fn global() -> &'static IndexRegistry {
        &GLOBAL_REGISTRY
    }

    /// Number of live shared states.
    pub fn len(&self) -> usize {
        self.states
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Returns true if no shared state is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the live state for the index rooted at `root` in `file`,
    /// creating it with `layout` if no handle holds one.
    ///
    /// A live state is patched to `file` before it is returned.
    pub fn acquire<F>(
        &self,
        file: &Arc<StorageFile>,
        root: FileAddr,
        ndims: usize,
        layout: F,
    ) -> Result<Arc<SharedIndexState>>
    where
        F: FnOnce() -> Result<IndexLayout>,
    {
        let key = StateKey::new(file.path(), root);
        let mut states = self.states.lock();

        if let Some(state) = states.get(&key).and_then(Weak::upgrade) {
            // `state` may become the last strong reference, and its Drop
            // locks the map
            drop(states);
            if state.ndims != ndims {
                return Err(ChunkdexError::Corrupt(format!(
                    "index at {} has {} dimensions, caller expects {}",
                    root, state.ndims, ndims
                )));
            }
            state.patch_file(file);
            return Ok(state);
        }

        let state = Arc::new(SharedIndexState {
            key: key.clone(),
            ndims,
            layout: layout()?,
            file: RwLock::new(file.clone()),
            registry: Arc::downgrade(&self.states),
        });
        states.insert(key, Arc::downgrade(&state));
        tracing::debug!(root = %root, ndims, "shared index state created");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdex_common::StorageConfig;
    use tempfile::tempdir;

    fn test_config() -> StorageConfig {
        StorageConfig {
            fsync_enabled: false,
            ..StorageConfig::default()
        }
    }

    fn implicit_layout() -> Result<IndexLayout> {
        Ok(IndexLayout::Implicit {
            chunk_byte_size: 16,
            max_nchunks: 4,
        })
    }

    #[test]
    fn test_acquire_shares_state() {
        let dir = tempdir().unwrap();
        let file = StorageFile::create(dir.path().join("s.bin"), test_config()).unwrap();
        let registry = IndexRegistry::new();
        let root = FileAddr::new(0).unwrap();

        let a = registry.acquire(&file, root, 2, implicit_layout).unwrap();
        let b = registry
            .acquire(&file, root, 2, || panic!("layout rebuilt for live state"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(Arc::strong_count(&a), 2);
        assert_eq!(registry.len(), 1);

        drop(a);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rejected_acquire_racing_release() {
        let dir = tempdir().unwrap();
        let file = StorageFile::create(dir.path().join("s.bin"), test_config()).unwrap();
        let registry = IndexRegistry::new();
        let root = FileAddr::new(0).unwrap();
        let (done, finished) = std::sync::mpsc::channel();

        let holder = {
            let (file, registry, done) = (file.clone(), registry.clone(), done.clone());
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let _ = registry.acquire(&file, root, 2, implicit_layout);
                }
                done.send(()).unwrap();
            })
        };
        let mismatched = {
            let (file, registry) = (file.clone(), registry.clone());
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let _ = registry.acquire(&file, root, 3, implicit_layout);
                }
                done.send(()).unwrap();
            })
        };

        for _ in 0..2 {
            finished
                .recv_timeout(std::time::Duration::from_secs(30))
                .expect("registry deadlocked");
        }
        holder.join().unwrap();
        mismatched.join().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_distinct_roots_get_distinct_state() {
        let dir = tempdir().unwrap();
        let file = StorageFile::create(dir.path().join("s.bin"), test_config()).unwrap();
        let registry = IndexRegistry::new();

        let a = registry
            .acquire(&file, FileAddr::new(0).unwrap(), 1, implicit_layout)
            .unwrap();
        let b = registry
            .acquire(&file, FileAddr::new(64).unwrap(), 1, implicit_layout)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_reacquire_patches_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.bin");
        let first = StorageFile::create(&path, test_config()).unwrap();
        let registry = IndexRegistry::new();
        let root = FileAddr::new(0).unwrap();

        let held = registry.acquire(&first, root, 1, implicit_layout).unwrap();
        assert_eq!(held.file().id(), first.id());

        let second = StorageFile::open(&path, test_config()).unwrap();
        let again = registry.acquire(&second, root, 1, implicit_layout).unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        assert_eq!(held.file().id(), second.id());
        assert!(!held.patch_file(&second));
    }

    #[test]
    fn test_dimension_mismatch_is_corrupt() {
        let dir = tempdir().unwrap();
        let file = StorageFile::create(dir.path().join("s.bin"), test_config()).unwrap();
        let registry = IndexRegistry::new();
        let root = FileAddr::new(0).unwrap();

        let _held = registry.acquire(&file, root, 2, implicit_layout).unwrap();
        let err = registry.acquire(&file, root, 3, implicit_layout).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_btree_layout_accessor() {
        let dir = tempdir().unwrap();
        let file = StorageFile::create(dir.path().join("s.bin"), test_config()).unwrap();
        let registry = IndexRegistry::new();
        let state = registry
            .acquire(&file, FileAddr::new(0).unwrap(), 1, implicit_layout)
            .unwrap();
        assert!(matches!(state.btree_layout(), Err(ChunkdexError::Internal(_))));
    }
}
