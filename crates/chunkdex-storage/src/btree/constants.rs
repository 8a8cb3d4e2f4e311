//! Classic B-tree on-disk constants.

use chunkdex_common::ADDR_SIZE;

/// Signature at the start of every node.
pub const NODE_MAGIC: &[u8; 4] = b"TREE";

/// Node header size: magic (4) + node type (1) + level (1) + entries used (2)
/// + left sibling (8) + right sibling (8).
pub const NODE_HEADER_SIZE: usize = 4 + 1 + 1 + 2 + 2 * ADDR_SIZE;

/// Deepest tree the engine will walk before declaring the structure corrupt.
pub(crate) const MAX_DEPTH: usize = 64;

/// Index into the split ratio triple for a node with no left sibling.
pub(crate) const SPLIT_LEFT: usize = 0;

/// Index into the split ratio triple for a node with both siblings.
pub(crate) const SPLIT_MIDDLE: usize = 1;

/// Index into the split ratio triple for a node with no right sibling.
pub(crate) const SPLIT_RIGHT: usize = 2;
