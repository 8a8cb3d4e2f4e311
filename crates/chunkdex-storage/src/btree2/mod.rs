//! Keyed on-disk B-tree with checksummed nodes.
//!
//! Unlike the classic tree, records are stored in internal nodes too, every
//! node is the same size, and each node ends in a CRC32 checksum. The header
//! sits at a fixed address and points at the current root.
//!
//! ## Layout
//!
//! ```text
//! header (fixed) ──► root ──► internal nodes ──► leaves
//!   BTHD             BTIN/BTLF
//! ```
//!
//! A node's record count lives in the pointer leading to it, so a node can
//! only be decoded by walking down from the header.

mod class;
mod header;
mod node;
mod tree;

pub use class::Bt2Class;
pub use header::{Bt2Header, HEADER_SIZE, NodePtr};
pub use node::{Bt2Node, internal_capacity, leaf_capacity};
pub use tree::{Bt2, UpdateStatus};
