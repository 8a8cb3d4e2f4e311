//! Chunk indexes for chunked array storage.
//!
//! A chunked array is split into equal-sized blocks ("chunks"), each stored
//! somewhere in a backing file. A chunk index maps a chunk's scaled
//! coordinate to the file address and stored size of its bytes.
//!
//! Three strategies share one contract (`ChunkIndex`):
//! - `BtreeIndex`: a classic balanced tree with chunk-shaped keys
//! - `Bt2Index`: a keyed B-tree with fixed-size chunk records
//! - `ImplicitIndex`: no structure; addresses computed over a pre-allocated
//!   region
//!
//! Handles opening the same on-disk index share one `SharedIndexState`
//! through an `IndexRegistry`.

mod alloc;
mod bt2_index;
mod btree_index;
mod context;
mod copy;
mod descriptor;
mod implicit;
mod index;
mod layout;
mod shared;

pub use alloc::{allocate_chunk, chunk_size_width};
pub use bt2_index::{Bt2Index, ChunkRecordClass, SizeField};
pub use btree_index::{BtreeIndex, ChunkKey, ChunkKeyClass, ChunkProbe};
pub use context::IndexContext;
pub use copy::copy_chunks;
pub use descriptor::{ChunkDescriptor, ChunkRecord, InsertStatus, Insertion};
pub use implicit::ImplicitIndex;
pub use index::{ChunkIndex, IndexKind};
pub use layout::{ChunkLayout, Odometer, down_products, linearize};
pub use shared::{IndexLayout, IndexRegistry, SharedIndexState};
