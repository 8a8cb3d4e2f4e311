//! Classic on-disk balanced tree with sibling links.
//!
//! A generic engine parameterized by a `BTreeClass` that owns the key format
//! and the leaf callbacks. Used by the classic chunk index, where each leaf
//! child is the file address of one chunk.
//!
//! ## Node Layout
//!
//! ```text
//! +------------------+ 0
//! | magic "TREE"     | 4
//! | node_type: u8    | 5
//! | level: u8        | 6
//! | entries: u16     | 8
//! | left: u64        | 16
//! | right: u64       | 24 (NODE_HEADER_SIZE)
//! +------------------+
//! | key_0            |
//! | child_0: u64     |
//! | key_1            |
//! | ...              |
//! | child_(2K-1)     |
//! | key_2K           |
//! +------------------+
//! ```
//!
//! ## Key Semantics
//!
//! Keys are left-critical: `key[i]` belongs to `child[i]` and `key[i + 1]`
//! bounds it from the right. A lookup target falls in child `i` when
//! `key[i] <= target < key[i + 1]` under the class ordering.
//!
//! ## Structure Changes
//!
//! - Insert splits full nodes by one of three ratios, chosen by whether the
//!   node has siblings. The root keeps its address across splits.
//! - Remove never rebalances. Emptied nodes are unlinked and freed.

mod class;
mod constants;
mod index;
mod node;
mod types;

pub use class::{BTreeClass, BTreeShared};
pub use constants::{NODE_HEADER_SIZE, NODE_MAGIC};
pub use index::BTree;
pub use node::BTreeNode;
pub use types::{InsertOp, KeyBracket, TreeInfo};
