//! Common types for the classic B-tree engine.

/// Outcome of an insert or remove step, reported upward one level at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOp {
    /// Nothing changed structurally.
    Noop,
    /// The first child of an empty root was created.
    First,
    /// A new child goes to the left of the current one.
    Left,
    /// A new child goes to the right of the current one.
    Right,
    /// The current child now lives at a different address.
    Change,
    /// The current child was removed.
    Remove,
}

/// The two keys bracketing one child, handed to class callbacks.
///
/// A callback that rewrites a key sets the matching `*_changed` flag so the
/// engine can propagate the new bound to parents and siblings.
#[derive(Debug)]
pub struct KeyBracket<'k, K> {
    /// Key to the left of the child.
    pub left: &'k mut K,
    /// Set when `left` was rewritten.
    pub left_changed: bool,
    /// Key to the right of the child.
    pub right: &'k mut K,
    /// Set when `right` was rewritten.
    pub right_changed: bool,
}

impl<'k, K> KeyBracket<'k, K> {
    /// Brackets `keys[idx]` and `keys[idx + 1]`.
    pub(crate) fn around(keys: &'k mut [K], idx: usize) -> Self {
        let (head, tail) = keys.split_at_mut(idx + 1);
        Self {
            left: &mut head[idx],
            left_changed: false,
            right: &mut tail[0],
            right_changed: false,
        }
    }
}

/// Metadata footprint of one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeInfo {
    /// Number of nodes at every level.
    pub num_nodes: u64,
    /// Bytes occupied by those nodes.
    pub size: u64,
    /// Height of the tree (a lone leaf root has height 1).
    pub height: u32,
}
