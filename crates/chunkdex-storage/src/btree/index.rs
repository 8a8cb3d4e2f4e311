//! Classic balanced tree operations.
//!
//! Every node carries left and right sibling pointers, so a level can be
//! walked without going back through the parent. The root never moves: when
//! it splits, its old contents are relocated to a fresh node and a new root
//! is written in place.
//!
//! All traversals keep an explicit path of `Frame`s instead of recursing.
//! Insert and remove descend to a leaf, let the class act on the leaf child,
//! then unwind the path applying the reported changes one level at a time.

use super::class::{BTreeClass, BTreeShared};
use super::constants::{MAX_DEPTH, SPLIT_LEFT, SPLIT_MIDDLE, SPLIT_RIGHT};
use super::node::BTreeNode;
use super::types::{InsertOp, KeyBracket, TreeInfo};
use crate::file::StorageFile;
use std::cmp::Ordering;
use std::ops::ControlFlow;
use chunkdex_common::{ChunkdexError, FileAddr, Result};

/// A node on the descent path and the child slot that was followed.
struct Frame<K> {
    addr: FileAddr,
    node: BTreeNode<K>,
    idx: usize,
}

/// What one level reports to its parent while unwinding.
struct Carry<K> {
    /// Structural change requested of the parent.
    ins: InsertOp,
    /// New or relocated child for `Change`/`Left`/`Right`.
    new_child: Option<FileAddr>,
    /// Key separating the existing child and `new_child`.
    md_key: Option<K>,
    /// New left bound of the subtree, when it changed.
    left: Option<K>,
    /// New right bound of the subtree, when it changed.
    right: Option<K>,
}

/// Classic B-tree bound to one file, class and layout for the duration of
/// a call.
pub struct BTree<'a, C: BTreeClass> {
    file: &'a StorageFile,
    class: &'a C,
    shared: &'a BTreeShared,
}

impl<'a, C: BTreeClass> BTree<'a, C> {
    /// Binds the engine to a file, class and node layout.
    pub fn new(file: &'a StorageFile, class: &'a C, shared: &'a BTreeShared) -> Self {
        Self {
            file,
            class,
            shared,
        }
    }

    // =========================================================================
    // Node I/O
    // =========================================================================

    fn read_node(&self, addr: FileAddr) -> Result<BTreeNode<C::Key>> {
        let raw = self.file.read(addr, self.shared.node_size)?;
        BTreeNode::decode(&raw, addr, self.class, self.shared)
    }

    fn write_node(&self, addr: FileAddr, node: &BTreeNode<C::Key>) -> Result<()> {
        let buf = node.encode(self.class, self.shared)?;
        self.file.write(addr, &buf)
    }

    fn alloc_node(&self) -> Result<FileAddr> {
        self.file.allocate(self.shared.node_size as u64)
    }

    fn free_node(&self, addr: FileAddr) -> Result<()> {
        self.file.free(addr, self.shared.node_size as u64)
    }

    /// Reads the child at `addr` and checks it sits one level below `parent_level`.
    fn read_child(&self, addr: FileAddr, parent_level: u8) -> Result<BTreeNode<C::Key>> {
        let node = self.read_node(addr)?;
        if node.level as u16 + 1 != parent_level as u16 {
            return Err(ChunkdexError::Corrupt(format!(
                "node at {} has level {}, parent is at level {}",
                addr, node.level, parent_level
            )));
        }
        Ok(node)
    }

    /// Upper bound on the number of nodes that can exist in the file.
    fn node_budget(&self) -> u64 {
        self.file.eoa() / self.shared.node_size as u64 + 1
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Binary-searches the node for the child whose range holds the target.
    fn locate(&self, node: &BTreeNode<C::Key>, udata: &C::UserData) -> (usize, Ordering) {
        let (mut lt, mut rt) = (0, node.nchildren());
        let mut idx = 0;
        let mut cmp = Ordering::Greater;

        while lt < rt && cmp != Ordering::Equal {
            idx = (lt + rt) / 2;
            cmp = self
                .class
                .cmp3(&node.keys[idx], udata, &node.keys[idx + 1]);
            if cmp == Ordering::Less {
                rt = idx;
            } else {
                lt = idx + 1;
            }
        }

        (idx, cmp)
    }

    /// Creates an empty tree and returns its root address.
    pub fn create(&self) -> Result<FileAddr> {
        let addr = self.alloc_node()?;
        self.write_node(addr, &BTreeNode::new(0))?;
        tracing::debug!(root = %addr, node_size = self.shared.node_size, "classic B-tree created");
        Ok(addr)
    }

    /// Looks up the target described by `udata`.
    ///
    /// Returns whatever the class `found` callback reports for the leaf child
    /// whose range holds the target, or false if no range holds it.
    pub fn find(&self, root: FileAddr, udata: &mut C::UserData) -> Result<bool> {
        let mut node = self.read_node(root)?;

        for _ in 0..MAX_DEPTH {
            if node.nchildren() == 0 {
                return Ok(false);
            }
            let (idx, cmp) = self.locate(&node, udata);
            if cmp != Ordering::Equal {
                return Ok(false);
            }
            if node.is_leaf() {
                return self
                    .class
                    .found(self.file, node.children[idx], &node.keys[idx], udata);
            }
            node = self.read_child(node.children[idx], node.level)?;
        }

        Err(ChunkdexError::Corrupt(format!(
            "tree at {} is deeper than {} levels",
            root, MAX_DEPTH
        )))
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts the target described by `udata`.
    pub fn insert(&self, root: FileAddr, udata: &mut C::UserData) -> Result<()> {
        let mut path: Vec<Frame<C::Key>> = Vec::new();
        let mut addr = root;
        let mut parent_level = None;

        let (mut frame, mut carry) = loop {
            if path.len() > MAX_DEPTH {
                return Err(ChunkdexError::Corrupt(format!(
                    "tree at {} is deeper than {} levels",
                    root, MAX_DEPTH
                )));
            }
            let mut node = match parent_level {
                Some(level) => self.read_child(addr, level)?,
                None => self.read_node(addr)?,
            };
            let n = node.nchildren();

            if n == 0 {
                if !path.is_empty() {
                    return Err(ChunkdexError::Corrupt(format!(
                        "empty non-root node at {}",
                        addr
                    )));
                }
                node.level = 0;
                node.keys = vec![self.class.empty_key(), self.class.empty_key()];
                let bracket = KeyBracket::around(&mut node.keys, 0);
                let child = self.class.new_node(
                    self.file,
                    InsertOp::First,
                    bracket.left,
                    udata,
                    bracket.right,
                )?;
                node.children.push(child);
                self.write_node(addr, &node)?;
                tracing::trace!(root = %addr, %child, "first child inserted");
                return Ok(());
            }

            let (mut idx, cmp) = self.locate(&node, udata);

            if cmp == Ordering::Less && idx == 0 {
                if !node.is_leaf() {
                    // Target becomes the left-most value of this subtree
                    let child = node.children[0];
                    parent_level = Some(node.level);
                    path.push(Frame { addr, node, idx });
                    addr = child;
                    continue;
                }
                let mut md_key = node.keys[0].clone();
                let child = self.class.new_node(
                    self.file,
                    InsertOp::Left,
                    &mut node.keys[0],
                    udata,
                    &mut md_key,
                )?;
                let left = Some(node.keys[0].clone());
                break (
                    Frame { addr, node, idx },
                    Carry {
                        ins: InsertOp::Left,
                        new_child: Some(child),
                        md_key: Some(md_key),
                        left,
                        right: None,
                    },
                );
            } else if cmp == Ordering::Greater && idx + 1 >= n {
                idx = n - 1;
                if !node.is_leaf() {
                    // Target is past every key: follow the right-most branch
                    let child = node.children[idx];
                    parent_level = Some(node.level);
                    path.push(Frame { addr, node, idx });
                    addr = child;
                    continue;
                }
                let mut md_key = node.keys[n].clone();
                let child = self.class.new_node(
                    self.file,
                    InsertOp::Right,
                    &mut md_key,
                    udata,
                    &mut node.keys[n],
                )?;
                let right = Some(node.keys[n].clone());
                break (
                    Frame { addr, node, idx },
                    Carry {
                        ins: InsertOp::Right,
                        new_child: Some(child),
                        md_key: Some(md_key),
                        left: None,
                        right,
                    },
                );
            } else if cmp != Ordering::Equal {
                return Err(ChunkdexError::Internal(format!(
                    "insert target does not fall between the keys of node {}",
                    addr
                )));
            } else if !node.is_leaf() {
                let child = node.children[idx];
                parent_level = Some(node.level);
                path.push(Frame { addr, node, idx });
                addr = child;
                continue;
            } else {
                let child_addr = node.children[idx];
                let mut md_key = self.class.empty_key();
                let mut bracket = KeyBracket::around(&mut node.keys, idx);
                let (ins, new_child) =
                    self.class
                        .insert(self.file, child_addr, &mut bracket, &mut md_key, udata)?;
                let (left_changed, right_changed) = (bracket.left_changed, bracket.right_changed);
                let left = left_changed.then(|| node.keys[idx].clone());
                let right = right_changed.then(|| node.keys[idx + 1].clone());
                break (
                    Frame { addr, node, idx },
                    Carry {
                        ins,
                        new_child,
                        md_key: Some(md_key),
                        left,
                        right,
                    },
                );
            }
        };

        loop {
            let (out, split) = self.apply_insert(&mut frame, carry)?;
            match path.pop() {
                Some(parent) => {
                    frame = parent;
                    carry = out;
                }
                None => {
                    if let Some((split_addr, split_node)) = split {
                        let md_key = out.md_key.ok_or_else(|| {
                            ChunkdexError::Internal("root split without a middle key".to_string())
                        })?;
                        self.grow_root(root, frame.node, split_addr, split_node, md_key)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Applies a child's report to one node on the insert path.
    ///
    /// Returns the report for the next level up and, if this node split, the
    /// new right half.
    #[allow(clippy::type_complexity)]
    fn apply_insert(
        &self,
        frame: &mut Frame<C::Key>,
        carry: Carry<C::Key>,
    ) -> Result<(Carry<C::Key>, Option<(FileAddr, BTreeNode<C::Key>)>)> {
        let Frame { addr, node, idx } = frame;
        let (addr, mut idx) = (*addr, *idx);
        let n = node.nchildren();
        let mut dirty = false;
        let mut out = Carry {
            ins: InsertOp::Noop,
            new_child: None,
            md_key: None,
            left: None,
            right: None,
        };

        // Bounds only travel upward while this child sits on the node's edge
        if let Some(key) = carry.left {
            node.keys[idx] = key;
            dirty = true;
            if idx == 0 {
                out.left = Some(node.keys[0].clone());
            }
        }
        if let Some(key) = carry.right {
            node.keys[idx + 1] = key;
            dirty = true;
            if idx + 1 >= n {
                out.right = Some(node.keys[n].clone());
            }
        }

        match carry.ins {
            InsertOp::Noop => {}
            InsertOp::Change => {
                node.children[idx] = carry.new_child.ok_or_else(|| {
                    ChunkdexError::Internal("changed child without an address".to_string())
                })?;
                dirty = true;
            }
            InsertOp::Left | InsertOp::Right => {
                let child = carry.new_child.ok_or_else(|| {
                    ChunkdexError::Internal("new child without an address".to_string())
                })?;
                let md_key = carry.md_key.ok_or_else(|| {
                    ChunkdexError::Internal("new child without a middle key".to_string())
                })?;

                if n == self.shared.two_k {
                    let (split_addr, mut split) = self.split(addr, node, idx)?;
                    if idx < node.nchildren() {
                        insert_child(node, idx, child, carry.ins, md_key);
                    } else {
                        idx -= node.nchildren();
                        insert_child(&mut split, idx, child, carry.ins, md_key);
                    }
                    self.write_node(addr, node)?;
                    self.write_node(split_addr, &split)?;

                    out.ins = InsertOp::Right;
                    out.new_child = Some(split_addr);
                    out.md_key = Some(split.keys[0].clone());
                    return Ok((out, Some((split_addr, split))));
                }

                insert_child(node, idx, child, carry.ins, md_key);
                dirty = true;
            }
            InsertOp::First | InsertOp::Remove => {
                return Err(ChunkdexError::Internal(format!(
                    "unexpected {:?} while inserting into node {}",
                    carry.ins, addr
                )));
            }
        }

        if dirty {
            self.write_node(addr, node)?;
        }
        Ok((out, None))
    }

    /// Splits a full node, moving its right part to a new node.
    ///
    /// `idx` is the child slot about to receive a new neighbour; the split
    /// point is nudged so both halves stay non-empty after the insertion.
    fn split(
        &self,
        addr: FileAddr,
        node: &mut BTreeNode<C::Key>,
        idx: usize,
    ) -> Result<(FileAddr, BTreeNode<C::Key>)> {
        let two_k = self.shared.two_k;
        let ratio = if node.right.is_none() {
            self.shared.split_ratios[SPLIT_RIGHT]
        } else if node.left.is_none() {
            self.shared.split_ratios[SPLIT_LEFT]
        } else {
            self.shared.split_ratios[SPLIT_MIDDLE]
        };

        let mut nleft = (two_k as f64 * ratio) as usize;
        if idx < nleft && nleft == two_k {
            nleft -= 1;
        } else if idx >= nleft && nleft == 0 {
            nleft += 1;
        }

        let split_addr = self.alloc_node()?;
        let mut split = BTreeNode::new(node.level);
        split.keys = node.keys[nleft..].to_vec();
        split.children = node.children.split_off(nleft);
        node.keys.truncate(nleft + 1);

        split.left = Some(addr);
        split.right = node.right;
        if let Some(right_addr) = node.right {
            let mut sibling = self.read_node(right_addr)?;
            sibling.left = Some(split_addr);
            self.write_node(right_addr, &sibling)?;
        }
        node.right = Some(split_addr);

        tracing::debug!(
            node = %addr,
            split = %split_addr,
            level = node.level,
            nleft,
            nright = two_k - nleft,
            "classic B-tree node split"
        );
        Ok((split_addr, split))
    }

    /// Relocates the old root and writes a new root above it and its split.
    fn grow_root(
        &self,
        root: FileAddr,
        old_root: BTreeNode<C::Key>,
        split_addr: FileAddr,
        mut split: BTreeNode<C::Key>,
        md_key: C::Key,
    ) -> Result<()> {
        let level = old_root.level.checked_add(1).ok_or_else(|| {
            ChunkdexError::Internal(format!("tree at {} cannot grow past level 255", root))
        })?;

        let old_root_addr = self.alloc_node()?;
        self.write_node(old_root_addr, &old_root)?;
        split.left = Some(old_root_addr);
        self.write_node(split_addr, &split)?;

        let mut new_root = BTreeNode::new(level);
        new_root.keys = vec![
            old_root.keys[0].clone(),
            md_key,
            split.keys[split.nchildren()].clone(),
        ];
        new_root.children = vec![old_root_addr, split_addr];
        self.write_node(root, &new_root)?;

        tracing::debug!(root = %root, level, relocated = %old_root_addr, "classic B-tree root split");
        Ok(())
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes the target described by `udata`.
    ///
    /// Nodes are never rebalanced. A non-root node that loses its last child
    /// is unlinked from its siblings and freed; the root collapses to an
    /// empty leaf.
    pub fn remove(&self, root: FileAddr, udata: &mut C::UserData) -> Result<()> {
        let mut path: Vec<Frame<C::Key>> = Vec::new();
        let mut addr = root;
        let mut parent_level = None;

        let (mut frame, mut carry) = loop {
            if path.len() > MAX_DEPTH {
                return Err(ChunkdexError::Corrupt(format!(
                    "tree at {} is deeper than {} levels",
                    root, MAX_DEPTH
                )));
            }
            let mut node = match parent_level {
                Some(level) => self.read_child(addr, level)?,
                None => self.read_node(addr)?,
            };
            if node.nchildren() == 0 {
                return Err(ChunkdexError::NotFound(format!(
                    "remove target in empty tree at {}",
                    root
                )));
            }

            let (idx, cmp) = self.locate(&node, udata);
            if cmp != Ordering::Equal {
                return Err(ChunkdexError::NotFound(format!(
                    "remove target in tree at {}",
                    root
                )));
            }

            if !node.is_leaf() {
                let child = node.children[idx];
                parent_level = Some(node.level);
                path.push(Frame { addr, node, idx });
                addr = child;
                continue;
            }

            let child_addr = node.children[idx];
            let mut bracket = KeyBracket::around(&mut node.keys, idx);
            let ins = self.class.remove(self.file, child_addr, &mut bracket, udata)?;
            let (left_changed, right_changed) = (bracket.left_changed, bracket.right_changed);
            let left = left_changed.then(|| node.keys[idx].clone());
            let right = right_changed.then(|| node.keys[idx + 1].clone());
            break (
                Frame { addr, node, idx },
                Carry {
                    ins,
                    new_child: None,
                    md_key: None,
                    left,
                    right,
                },
            );
        };

        loop {
            let depth = path.len();
            carry = self.apply_remove(&mut frame, depth, carry)?;
            match path.pop() {
                Some(parent) => frame = parent,
                None => return Ok(()),
            }
        }
    }

    /// Applies a child's report to one node on the remove path.
    fn apply_remove(
        &self,
        frame: &mut Frame<C::Key>,
        depth: usize,
        carry: Carry<C::Key>,
    ) -> Result<Carry<C::Key>> {
        let Frame { addr, node, idx } = frame;
        let (addr, idx) = (*addr, *idx);
        let n = node.nchildren();
        let mut dirty = false;
        let mut out = Carry {
            ins: InsertOp::Noop,
            new_child: None,
            md_key: None,
            left: None,
            right: None,
        };

        if let Some(key) = carry.left {
            node.keys[idx] = key;
            dirty = true;
            if idx == 0 {
                out.left = Some(node.keys[0].clone());
            }
        }
        if let Some(key) = carry.right {
            node.keys[idx + 1] = key;
            dirty = true;
            if idx + 1 >= n {
                out.right = Some(node.keys[n].clone());
            }
        }

        if carry.ins == InsertOp::Remove {
            if n == 1 {
                if depth > 0 {
                    self.unlink(addr, node)?;
                    self.free_node(addr)?;
                    tracing::debug!(node = %addr, level = node.level, "classic B-tree node freed");
                    out.ins = InsertOp::Remove;
                    out.left = None;
                    out.right = None;
                    return Ok(out);
                }
                node.keys.clear();
                node.children.clear();
                node.level = 0;
                out.ins = InsertOp::Remove;
                out.left = None;
                out.right = None;
            } else if idx == 0 {
                // The next child's left key becomes this node's left bound
                node.keys.remove(0);
                node.children.remove(0);
                out.left = Some(node.keys[0].clone());
            } else if idx + 1 == n {
                // Keep the right bound, drop the last child's left key
                node.keys.remove(n - 1);
                node.children.remove(n - 1);
            } else {
                node.keys.remove(idx);
                node.children.remove(idx);
            }
            dirty = true;
        }

        // A new left bound is also the right bound of the left sibling
        if out.left.is_some() {
            if let Some(left_addr) = node.left {
                let mut sibling = self.read_node(left_addr)?;
                let last = sibling.nchildren();
                if last > 0 {
                    sibling.keys[last] = node.keys[0].clone();
                    self.write_node(left_addr, &sibling)?;
                }
            }
        }

        if dirty {
            self.write_node(addr, node)?;
        }
        Ok(out)
    }

    /// Detaches a node that is about to be freed from its siblings.
    fn unlink(&self, addr: FileAddr, node: &BTreeNode<C::Key>) -> Result<()> {
        if let Some(left_addr) = node.left {
            let mut sibling = self.read_node(left_addr)?;
            let last = sibling.nchildren();
            if last > 0 && node.keys.len() > 1 {
                sibling.keys[last] = node.keys[1].clone();
            }
            sibling.right = node.right;
            self.write_node(left_addr, &sibling)?;
        }
        if let Some(right_addr) = node.right {
            let mut sibling = self.read_node(right_addr)?;
            sibling.left = node.left;
            self.write_node(right_addr, &sibling)?;
        }
        tracing::trace!(node = %addr, "unlinked from siblings");
        Ok(())
    }

    // =========================================================================
    // Whole-tree operations
    // =========================================================================

    /// Visits every leaf child in key order.
    ///
    /// The callback receives the left key, the child address and the right
    /// key, and may stop the walk early.
    pub fn iterate<F>(&self, root: FileAddr, mut op: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&C::Key, FileAddr, &C::Key) -> Result<ControlFlow<()>>,
    {
        let mut node = self.read_node(root)?;
        while !node.is_leaf() {
            if node.nchildren() == 0 {
                return Err(ChunkdexError::Corrupt(format!(
                    "empty internal node in tree at {}",
                    root
                )));
            }
            node = self.read_child(node.children[0], node.level)?;
        }

        let budget = self.node_budget();
        let mut visited = 0u64;
        loop {
            visited += 1;
            if visited > budget {
                return Err(ChunkdexError::Corrupt(format!(
                    "leaf sibling chain of tree at {} does not terminate",
                    root
                )));
            }
            for i in 0..node.nchildren() {
                if op(&node.keys[i], node.children[i], &node.keys[i + 1])?.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
            match node.right {
                Some(right) => {
                    node = self.read_node(right)?;
                    if !node.is_leaf() {
                        return Err(ChunkdexError::Corrupt(format!(
                            "leaf sibling at {} is not a leaf",
                            right
                        )));
                    }
                }
                None => return Ok(ControlFlow::Continue(())),
            }
        }
    }

    /// Frees every node and hands every leaf child to the class `remove`.
    pub fn delete(&self, root: FileAddr, udata: &mut C::UserData) -> Result<()> {
        let mut stack = vec![(root, None)];
        let mut freed = 0u64;

        while let Some((addr, parent_level)) = stack.pop() {
            let mut node = match parent_level {
                Some(level) => self.read_child(addr, level)?,
                None => self.read_node(addr)?,
            };
            if node.is_leaf() {
                for idx in 0..node.nchildren() {
                    let child = node.children[idx];
                    let mut bracket = KeyBracket::around(&mut node.keys, idx);
                    self.class.remove(self.file, child, &mut bracket, udata)?;
                }
            } else {
                stack.extend(node.children.iter().map(|c| (*c, Some(node.level))));
            }
            self.free_node(addr)?;
            freed += 1;
        }

        tracing::debug!(root = %root, nodes = freed, "classic B-tree deleted");
        Ok(())
    }

    /// Counts nodes level by level through the sibling chains.
    pub fn info(&self, root: FileAddr) -> Result<TreeInfo> {
        let mut info = TreeInfo::default();
        let budget = self.node_budget();
        let mut level_head = Some(root);

        while let Some(head) = level_head {
            let first = self.read_node(head)?;
            info.height += 1;
            info.num_nodes += 1;

            let mut next = first.right;
            while let Some(addr) = next {
                info.num_nodes += 1;
                if info.num_nodes > budget {
                    return Err(ChunkdexError::Corrupt(format!(
                        "sibling chain of tree at {} does not terminate",
                        root
                    )));
                }
                next = self.read_node(addr)?.right;
            }

            level_head = if first.is_leaf() || first.nchildren() == 0 {
                None
            } else {
                Some(first.children[0])
            };
        }

        info.size = info.num_nodes * self.shared.node_size as u64;
        Ok(info)
    }

    /// Checks structural invariants: key order within nodes, child levels,
    /// and sibling links that agree in both directions.
    pub fn verify(&self, root: FileAddr) -> Result<()> {
        let mut stack = vec![(root, None)];
        while let Some((addr, parent_level)) = stack.pop() {
            let node = match parent_level {
                Some(level) => self.read_child(addr, level)?,
                None => self.read_node(addr)?,
            };
            for pair in node.keys.windows(2) {
                if self.class.cmp2(&pair[0], &pair[1]) == Ordering::Greater {
                    return Err(ChunkdexError::Corrupt(format!(
                        "keys out of order in node {}",
                        addr
                    )));
                }
            }
            if let Some(right) = node.right {
                if self.read_node(right)?.left != Some(addr) {
                    return Err(ChunkdexError::Corrupt(format!(
                        "right sibling of {} does not point back",
                        addr
                    )));
                }
            }
            if !node.is_leaf() {
                stack.extend(node.children.iter().map(|c| (*c, Some(node.level))));
            }
        }
        Ok(())
    }
}

/// Inserts `child` next to slot `idx`, on the side named by `anchor`, with
/// `md_key` separating the two.
fn insert_child<K: Clone>(
    node: &mut BTreeNode<K>,
    idx: usize,
    child: FileAddr,
    anchor: InsertOp,
    md_key: K,
) {
    node.keys.insert(idx + 1, md_key);
    if anchor == InsertOp::Right {
        node.children.insert(idx + 1, child);
    } else {
        node.children.insert(idx, child);
    }
}
