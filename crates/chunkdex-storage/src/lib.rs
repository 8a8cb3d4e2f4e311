//! Storage layer for chunkdex.
//!
//! This crate provides:
//! - Block file for byte-addressed file I/O
//! - Extent allocator with a coalescing free list
//! - Flush-order dependencies between metadata structures
//! - Storage file tying the three together
//! - Classic balanced tree engine
//! - Keyed B-tree engine with checksummed nodes

pub mod btree;
pub mod btree2;
mod disk;
mod file;
mod flush;
mod freespace;

pub use btree::{BTree, BTreeClass, BTreeNode, BTreeShared, InsertOp, KeyBracket, TreeInfo};
pub use btree2::{Bt2, Bt2Class, Bt2Header, NodePtr, UpdateStatus};
pub use disk::{BlockFile, BlockFileConfig};
pub use file::{FileId, StorageFile};
pub use flush::FlushDependencies;
pub use freespace::{Allocator, FreeSpaceManager};
