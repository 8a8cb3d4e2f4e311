//! Keyed B-tree operations.
//!
//! Records live in every node, internal ones included. Inserts split full
//! children on the way down and removes top up thin children on the way
//! down, so no operation ever has to walk back up the tree. Only the header
//! has a fixed address; the root moves whenever the tree grows or shrinks.

use super::class::Bt2Class;
use super::header::{Bt2Header, HEADER_SIZE, NodePtr};
use super::node::{Bt2Node, internal_capacity, leaf_capacity};
use crate::file::StorageFile;
use std::ops::ControlFlow;
use std::sync::Arc;
use chunkdex_common::{Bt2Config, ChunkdexError, FileAddr, Result};

/// Fewest records a split or merge threshold may name.
const MIN_SPLIT_NREC: usize = 3;

/// Outcome of `Bt2::update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// No record matched; the new record was inserted.
    Inserted,
    /// A matching record was rewritten.
    Modified,
    /// A matching record was left as it was.
    Unchanged,
}

/// A node on a descent path and the child slot that was followed.
struct Frame<R> {
    addr: FileAddr,
    depth: u16,
    node: Bt2Node<R>,
    idx: usize,
}

/// An open keyed B-tree.
pub struct Bt2<C: Bt2Class> {
    file: Arc<StorageFile>,
    class: C,
    addr: FileAddr,
    header: Bt2Header,
    max_leaf: usize,
    max_internal: usize,
    parent: Option<FileAddr>,
}

impl<C: Bt2Class> Bt2<C> {
    /// Creates an empty tree and writes its header.
    pub fn create(file: Arc<StorageFile>, class: C, config: &Bt2Config) -> Result<Self> {
        config.validate()?;
        let record_size = class.record_size();
        let header = Bt2Header {
            type_id: class.type_id(),
            node_size: config.node_size,
            record_size: u16::try_from(record_size).map_err(|_| {
                ChunkdexError::ConfigError(format!("record size {} is too large", record_size))
            })?,
            depth: 0,
            split_percent: config.split_percent,
            merge_percent: config.merge_percent,
            root: None,
        };
        let (max_leaf, max_internal) = Self::capacities(&header)?;

        let addr = file.allocate(HEADER_SIZE as u64)?;
        let tree = Self {
            file,
            class,
            addr,
            header,
            max_leaf,
            max_internal,
            parent: None,
        };
        tree.write_header()?;

        tracing::debug!(
            header = %addr,
            type_id = tree.header.type_id,
            node_size = config.node_size,
            record_size,
            max_leaf,
            max_internal,
            "keyed B-tree created"
        );
        Ok(tree)
    }

    /// Opens the tree whose header is at `addr`.
    pub fn open(file: Arc<StorageFile>, class: C, addr: FileAddr) -> Result<Self> {
        let raw = file.read(addr, HEADER_SIZE)?;
        let header = Bt2Header::from_bytes(&raw, addr)?;

        if header.type_id != class.type_id() {
            return Err(ChunkdexError::Corrupt(format!(
                "keyed B-tree at {} has type {}, expected {}",
                addr,
                header.type_id,
                class.type_id()
            )));
        }
        if header.record_size as usize != class.record_size() {
            return Err(ChunkdexError::Corrupt(format!(
                "keyed B-tree at {} stores {} byte records, expected {}",
                addr,
                header.record_size,
                class.record_size()
            )));
        }
        let (max_leaf, max_internal) = Self::capacities(&header)?;

        tracing::trace!(header = %addr, depth = header.depth, "keyed B-tree opened");
        Ok(Self {
            file,
            class,
            addr,
            header,
            max_leaf,
            max_internal,
            parent: None,
        })
    }

    fn capacities(header: &Bt2Header) -> Result<(usize, usize)> {
        let node_size = header.node_size as usize;
        let record_size = header.record_size as usize;
        let max_leaf = leaf_capacity(node_size, record_size).min(u16::MAX as usize);
        let max_internal = internal_capacity(node_size, record_size).min(u16::MAX as usize);
        if max_leaf < MIN_SPLIT_NREC || max_internal < MIN_SPLIT_NREC {
            return Err(ChunkdexError::ConfigError(format!(
                "node size {} holds too few {} byte records",
                node_size, record_size
            )));
        }
        Ok((max_leaf, max_internal))
    }

    /// Returns the header address.
    pub fn addr(&self) -> FileAddr {
        self.addr
    }

    /// Returns the file the tree is bound to.
    pub fn file(&self) -> &Arc<StorageFile> {
        &self.file
    }

    /// Returns the record class.
    pub fn class(&self) -> &C {
        &self.class
    }

    /// Returns the decoded header.
    pub fn header(&self) -> &Bt2Header {
        &self.header
    }

    /// Returns the number of records in the tree.
    pub fn record_count(&self) -> u64 {
        self.header.total_records()
    }

    /// Rebinds the tree to another open of the same file.
    pub fn patch_file(&mut self, file: Arc<StorageFile>) {
        if !Arc::ptr_eq(&self.file, &file) {
            tracing::trace!(header = %self.addr, from = %self.file.id(), to = %file.id(), "keyed B-tree file patched");
            self.file = file;
        }
    }

    /// Makes the header a flush dependency child of `parent`.
    pub fn depend(&mut self, parent: FileAddr) -> Result<()> {
        if self.parent == Some(parent) {
            return Ok(());
        }
        self.file.add_flush_dependency(parent, self.addr)?;
        self.parent = Some(parent);
        Ok(())
    }

    /// Drops the flush dependency registered by `depend`, if any.
    pub fn undepend(&mut self) -> Result<()> {
        match self.parent.take() {
            Some(parent) => self.file.remove_flush_dependency(parent, self.addr),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Node I/O
    // =========================================================================

    fn max_nrec(&self, depth: u16) -> usize {
        if depth == 0 {
            self.max_leaf
        } else {
            self.max_internal
        }
    }

    /// Record count at which a node at `depth` is split before descending.
    fn split_nrec(&self, depth: u16) -> usize {
        let max = self.max_nrec(depth);
        (max * self.header.split_percent as usize / 100).clamp(MIN_SPLIT_NREC, max)
    }

    /// Record count at or below which a node at `depth` is topped up before descending.
    fn merge_nrec(&self, depth: u16) -> usize {
        let max = self.max_nrec(depth);
        (max * self.header.merge_percent as usize / 100).clamp(1, (max - 1) / 2)
    }

    fn write_header(&self) -> Result<()> {
        self.file.write(self.addr, &self.header.to_bytes())
    }

    fn read_node(&self, ptr: NodePtr, depth: u16) -> Result<Bt2Node<C::Record>> {
        let raw = self.file.read(ptr.addr, self.header.node_size as usize)?;
        Bt2Node::decode(&raw, ptr, &self.class, depth == 0)
    }

    fn write_node(&self, addr: FileAddr, node: &Bt2Node<C::Record>, depth: u16) -> Result<NodePtr> {
        let buf = node.encode(&self.class, self.header.node_size as usize, depth == 0)?;
        self.file.write(addr, &buf)?;
        Ok(node.pointer(addr))
    }

    fn new_node(&self, node: &Bt2Node<C::Record>, depth: u16) -> Result<NodePtr> {
        let addr = self.file.allocate(self.header.node_size as u64)?;
        self.write_node(addr, node, depth)
    }

    fn free_node(&self, addr: FileAddr) -> Result<()> {
        self.file.free(addr, self.header.node_size as u64)
    }

    /// Binary-searches a node. `Ok(i)` is a match, `Err(i)` the child to follow.
    fn search(&self, node: &Bt2Node<C::Record>, key: &C::Key) -> std::result::Result<usize, usize> {
        node.records
            .binary_search_by(|record| self.class.compare(key, record).reverse())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Returns the record matching `key`.
    pub fn find(&self, key: &C::Key) -> Result<Option<C::Record>> {
        let Some(mut ptr) = self.header.root else {
            return Ok(None);
        };
        let mut depth = self.header.depth;

        loop {
            let node = self.read_node(ptr, depth)?;
            match self.search(&node, key) {
                Ok(i) => return Ok(Some(node.records[i].clone())),
                Err(_) if depth == 0 => return Ok(None),
                Err(i) => {
                    ptr = node.children[i];
                    depth -= 1;
                }
            }
        }
    }

    /// Visits every record in key order until `op` breaks.
    pub fn iterate<F>(&self, mut op: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&C::Record) -> Result<ControlFlow<()>>,
    {
        let Some(root) = self.header.root else {
            return Ok(ControlFlow::Continue(()));
        };

        // Each entry is a node, its depth and its next step. On an internal
        // node even steps descend into a child and odd steps visit a record.
        let mut stack = vec![(self.read_node(root, self.header.depth)?, self.header.depth, 0usize)];
        while let Some((node, depth, step)) = stack.last_mut() {
            let nrec = node.records.len();
            let s = *step;
            *step += 1;

            if *depth == 0 {
                if s >= nrec {
                    stack.pop();
                } else if op(&node.records[s])?.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
                continue;
            }

            if s > 2 * nrec {
                stack.pop();
            } else if s % 2 == 0 {
                let (child, child_depth) = (node.children[s / 2], *depth - 1);
                let child_node = self.read_node(child, child_depth)?;
                stack.push((child_node, child_depth, 0));
            } else if op(&node.records[s / 2])?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    // =========================================================================
    // Insert / Update
    // =========================================================================

    /// Inserts a record that must not already be present.
    pub fn insert(&mut self, key: &C::Key, record: C::Record) -> Result<()> {
        let Some(mut root) = self.header.root else {
            let root = self.new_node(&Bt2Node::leaf(vec![record]), 0)?;
            self.header.depth = 0;
            self.header.root = Some(root);
            self.write_header()?;
            tracing::trace!(header = %self.addr, root = %root.addr, "keyed B-tree root created");
            return Ok(());
        };

        if root.nrec as usize >= self.split_nrec(self.header.depth) {
            let mut top = Bt2Node {
                records: Vec::new(),
                children: vec![root],
            };
            self.split_child(&mut top, 0, self.header.depth)?;
            root = self.new_node(&top, self.header.depth + 1)?;
            self.header.depth += 1;
            self.header.root = Some(root);
            self.write_header()?;
            tracing::debug!(header = %self.addr, depth = self.header.depth, "keyed B-tree grew");
        }

        let (root, inserted) = self.insert_below(root, self.header.depth, key, record)?;
        self.header.root = Some(root);
        self.write_header()?;
        if !inserted {
            return Err(ChunkdexError::Internal(format!(
                "record already present in keyed B-tree at {}",
                self.addr
            )));
        }
        Ok(())
    }

    /// Inserts into the subtree at `ptr`, which has room for one more record.
    ///
    /// Returns the subtree's new pointer and false if the key was already
    /// present. Nodes split on the way down are written back either way.
    fn insert_below(
        &self,
        mut ptr: NodePtr,
        mut depth: u16,
        key: &C::Key,
        record: C::Record,
    ) -> Result<(NodePtr, bool)> {
        let mut path = Vec::new();

        loop {
            let mut node = self.read_node(ptr, depth)?;
            let mut idx = match self.search(&node, key) {
                Ok(_) => return Ok((self.write_path(path, ptr)?, false)),
                Err(i) => i,
            };

            if depth == 0 {
                node.records.insert(idx, record);
                let leaf = self.write_node(ptr.addr, &node, depth)?;
                return Ok((self.write_path(path, leaf)?, true));
            }

            if node.children[idx].nrec as usize >= self.split_nrec(depth - 1) {
                self.split_child(&mut node, idx, depth - 1)?;
                match self.class.compare(key, &node.records[idx]) {
                    std::cmp::Ordering::Equal => {
                        let top = self.write_node(ptr.addr, &node, depth)?;
                        return Ok((self.write_path(path, top)?, false));
                    }
                    std::cmp::Ordering::Greater => idx += 1,
                    std::cmp::Ordering::Less => {}
                }
            }

            let child = node.children[idx];
            path.push(Frame {
                addr: ptr.addr,
                depth,
                node,
                idx,
            });
            ptr = child;
            depth -= 1;
        }
    }

    /// Writes a descent path back bottom-up, pointing each parent at its
    /// rewritten child. Returns the pointer to the top of the path.
    fn write_path(&self, mut path: Vec<Frame<C::Record>>, mut child: NodePtr) -> Result<NodePtr> {
        while let Some(mut frame) = path.pop() {
            frame.node.children[frame.idx] = child;
            child = self.write_node(frame.addr, &frame.node, frame.depth)?;
        }
        Ok(child)
    }

    /// Splits `parent.children[idx]` around its middle record.
    fn split_child(
        &self,
        parent: &mut Bt2Node<C::Record>,
        idx: usize,
        child_depth: u16,
    ) -> Result<()> {
        let ptr = parent.children[idx];
        let mut left = self.read_node(ptr, child_depth)?;
        let mid = left.records.len() / 2;

        let right_records = left.records.split_off(mid + 1);
        let middle = left
            .records
            .pop()
            .ok_or_else(|| ChunkdexError::internal("split of an empty node"))?;
        let right_children = if child_depth > 0 {
            left.children.split_off(mid + 1)
        } else {
            Vec::new()
        };
        let right = Bt2Node {
            records: right_records,
            children: right_children,
        };

        let right_ptr = self.new_node(&right, child_depth)?;
        let left_ptr = self.write_node(ptr.addr, &left, child_depth)?;

        parent.records.insert(idx, middle);
        parent.children[idx] = left_ptr;
        parent.children.insert(idx + 1, right_ptr);

        tracing::trace!(
            left = %left_ptr.addr,
            right = %right_ptr.addr,
            depth = child_depth,
            "keyed B-tree node split"
        );
        Ok(())
    }

    /// Modifies the record matching `key`, or inserts `record` if none does.
    ///
    /// `modify` returns whether it changed the record; unchanged records are
    /// not rewritten.
    pub fn update<F>(&mut self, key: &C::Key, record: C::Record, mut modify: F) -> Result<UpdateStatus>
    where
        F: FnMut(&mut C::Record) -> Result<bool>,
    {
        if let Some(mut ptr) = self.header.root {
            let mut depth = self.header.depth;
            loop {
                let mut node = self.read_node(ptr, depth)?;
                match self.search(&node, key) {
                    Ok(i) => {
                        if !modify(&mut node.records[i])? {
                            return Ok(UpdateStatus::Unchanged);
                        }
                        self.write_node(ptr.addr, &node, depth)?;
                        return Ok(UpdateStatus::Modified);
                    }
                    Err(_) if depth == 0 => break,
                    Err(i) => {
                        ptr = node.children[i];
                        depth -= 1;
                    }
                }
            }
        }

        self.insert(key, record)?;
        Ok(UpdateStatus::Inserted)
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes and returns the record matching `key`.
    pub fn remove(&mut self, key: &C::Key) -> Result<C::Record> {
        let Some(root) = self.header.root else {
            return Err(ChunkdexError::NotFound(format!(
                "record in empty keyed B-tree at {}",
                self.addr
            )));
        };

        let (removed, root) = self.remove_below(root, self.header.depth, key)?;
        self.collapse_root(root)?;
        self.write_header()?;

        removed.ok_or_else(|| {
            ChunkdexError::NotFound(format!("record in keyed B-tree at {}", self.addr))
        })
    }

    /// Replaces an empty root with its only child, or empties the tree.
    fn collapse_root(&mut self, root: NodePtr) -> Result<()> {
        if root.nrec > 0 {
            self.header.root = Some(root);
            return Ok(());
        }

        if self.header.depth == 0 {
            self.free_node(root.addr)?;
            self.header.root = None;
            tracing::debug!(header = %self.addr, "keyed B-tree emptied");
        } else {
            let node = self.read_node(root, self.header.depth)?;
            let child = node
                .children
                .first()
                .copied()
                .ok_or_else(|| ChunkdexError::corrupt("internal root without children"))?;
            self.free_node(root.addr)?;
            self.header.depth -= 1;
            self.header.root = Some(child);
            tracing::debug!(header = %self.addr, depth = self.header.depth, "keyed B-tree shrank");
        }
        Ok(())
    }

    fn remove_below(
        &self,
        mut ptr: NodePtr,
        mut depth: u16,
        key: &C::Key,
    ) -> Result<(Option<C::Record>, NodePtr)> {
        let mut path = Vec::new();

        loop {
            let mut node = self.read_node(ptr, depth)?;

            if depth == 0 {
                let removed = match self.search(&node, key) {
                    Ok(i) => Some(node.records.remove(i)),
                    Err(_) => None,
                };
                let leaf = if removed.is_some() {
                    self.write_node(ptr.addr, &node, depth)?
                } else {
                    ptr
                };
                return Ok((removed, self.write_path(path, leaf)?));
            }

            let child_min = self.merge_nrec(depth - 1);
            let idx = match self.search(&node, key) {
                Ok(i) if node.children[i].nrec as usize > child_min => {
                    let (pred, child) = self.remove_edge(node.children[i], depth - 1, true)?;
                    node.children[i] = child;
                    let removed = std::mem::replace(&mut node.records[i], pred);
                    let top = self.write_node(ptr.addr, &node, depth)?;
                    return Ok((Some(removed), self.write_path(path, top)?));
                }
                Ok(i) if node.children[i + 1].nrec as usize > child_min => {
                    let (succ, child) = self.remove_edge(node.children[i + 1], depth - 1, false)?;
                    node.children[i + 1] = child;
                    let removed = std::mem::replace(&mut node.records[i], succ);
                    let top = self.write_node(ptr.addr, &node, depth)?;
                    return Ok((Some(removed), self.write_path(path, top)?));
                }
                Ok(i) => {
                    // Both neighbours are thin: pull the record down and look there
                    self.merge_children(&mut node, i, depth - 1)?;
                    i
                }
                Err(i) => self.fill_child(&mut node, i, depth - 1)?,
            };

            let child = node.children[idx];
            path.push(Frame {
                addr: ptr.addr,
                depth,
                node,
                idx,
            });
            ptr = child;
            depth -= 1;
        }
    }

    /// Removes the largest (`last`) or smallest record of a subtree.
    fn remove_edge(
        &self,
        mut ptr: NodePtr,
        mut depth: u16,
        last: bool,
    ) -> Result<(C::Record, NodePtr)> {
        let mut path = Vec::new();

        loop {
            let mut node = self.read_node(ptr, depth)?;

            if depth == 0 {
                let record = if last {
                    node.records.pop()
                } else if node.records.is_empty() {
                    None
                } else {
                    Some(node.records.remove(0))
                };
                let record =
                    record.ok_or_else(|| ChunkdexError::corrupt("empty leaf in keyed B-tree"))?;
                let leaf = self.write_node(ptr.addr, &node, depth)?;
                return Ok((record, self.write_path(path, leaf)?));
            }

            let idx = if last { node.children.len() - 1 } else { 0 };
            let idx = self.fill_child(&mut node, idx, depth - 1)?;
            let idx = if last { node.children.len() - 1 } else { idx };

            let child = node.children[idx];
            path.push(Frame {
                addr: ptr.addr,
                depth,
                node,
                idx,
            });
            ptr = child;
            depth -= 1;
        }
    }

    /// Makes sure `node.children[idx]` can lose a record, borrowing from a
    /// sibling or merging with one. Returns the child's possibly new index.
    fn fill_child(
        &self,
        node: &mut Bt2Node<C::Record>,
        idx: usize,
        child_depth: u16,
    ) -> Result<usize> {
        let min = self.merge_nrec(child_depth);
        if node.children[idx].nrec as usize > min {
            return Ok(idx);
        }

        if idx > 0 && node.children[idx - 1].nrec as usize > min {
            self.rotate_right(node, idx - 1, child_depth)?;
            Ok(idx)
        } else if idx + 1 < node.children.len() && node.children[idx + 1].nrec as usize > min {
            self.rotate_left(node, idx, child_depth)?;
            Ok(idx)
        } else if idx > 0 {
            self.merge_children(node, idx - 1, child_depth)?;
            Ok(idx - 1)
        } else {
            self.merge_children(node, idx, child_depth)?;
            Ok(idx)
        }
    }

    /// Moves the last record of child `idx` up and the separator down into child `idx + 1`.
    fn rotate_right(
        &self,
        node: &mut Bt2Node<C::Record>,
        idx: usize,
        child_depth: u16,
    ) -> Result<()> {
        let mut left = self.read_node(node.children[idx], child_depth)?;
        let mut right = self.read_node(node.children[idx + 1], child_depth)?;

        let up = left
            .records
            .pop()
            .ok_or_else(|| ChunkdexError::corrupt("borrow from empty node"))?;
        let down = std::mem::replace(&mut node.records[idx], up);
        right.records.insert(0, down);
        if child_depth > 0 {
            let moved = left
                .children
                .pop()
                .ok_or_else(|| ChunkdexError::corrupt("internal node without children"))?;
            right.children.insert(0, moved);
        }

        node.children[idx] = self.write_node(node.children[idx].addr, &left, child_depth)?;
        node.children[idx + 1] = self.write_node(node.children[idx + 1].addr, &right, child_depth)?;
        Ok(())
    }

    /// Moves the first record of child `idx + 1` up and the separator down into child `idx`.
    fn rotate_left(
        &self,
        node: &mut Bt2Node<C::Record>,
        idx: usize,
        child_depth: u16,
    ) -> Result<()> {
        let mut left = self.read_node(node.children[idx], child_depth)?;
        let mut right = self.read_node(node.children[idx + 1], child_depth)?;
        if right.records.is_empty() {
            return Err(ChunkdexError::corrupt("borrow from empty node"));
        }

        let up = right.records.remove(0);
        let down = std::mem::replace(&mut node.records[idx], up);
        left.records.push(down);
        if child_depth > 0 {
            if right.children.is_empty() {
                return Err(ChunkdexError::corrupt("internal node without children"));
            }
            left.children.push(right.children.remove(0));
        }

        node.children[idx] = self.write_node(node.children[idx].addr, &left, child_depth)?;
        node.children[idx + 1] = self.write_node(node.children[idx + 1].addr, &right, child_depth)?;
        Ok(())
    }

    /// Merges child `idx + 1` and the separator between them into child `idx`.
    fn merge_children(
        &self,
        node: &mut Bt2Node<C::Record>,
        idx: usize,
        child_depth: u16,
    ) -> Result<()> {
        let mut left = self.read_node(node.children[idx], child_depth)?;
        let right_ptr = node.children[idx + 1];
        let right = self.read_node(right_ptr, child_depth)?;

        left.records.push(node.records.remove(idx));
        left.records.extend(right.records);
        left.children.extend(right.children);
        node.children.remove(idx + 1);

        node.children[idx] = self.write_node(node.children[idx].addr, &left, child_depth)?;
        self.free_node(right_ptr.addr)?;
        tracing::trace!(into = %node.children[idx].addr, freed = %right_ptr.addr, "keyed B-tree nodes merged");
        Ok(())
    }

    // =========================================================================
    // Whole-tree operations
    // =========================================================================

    /// Returns the bytes used by the header and every node.
    pub fn size(&self) -> Result<u64> {
        let mut nodes = 0u64;
        if let Some(root) = self.header.root {
            let mut stack = vec![(root, self.header.depth)];
            while let Some((ptr, depth)) = stack.pop() {
                nodes += 1;
                if depth > 0 {
                    let node = self.read_node(ptr, depth)?;
                    stack.extend(node.children.iter().map(|c| (*c, depth - 1)));
                }
            }
        }
        Ok(HEADER_SIZE as u64 + nodes * self.header.node_size as u64)
    }

    /// Frees every node and the header, handing each record to `op` first.
    pub fn delete<F>(mut self, mut op: F) -> Result<()>
    where
        F: FnMut(&C::Record) -> Result<()>,
    {
        if let Some(root) = self.header.root {
            let mut stack = vec![(root, self.header.depth)];
            while let Some((ptr, depth)) = stack.pop() {
                let node = self.read_node(ptr, depth)?;
                for record in &node.records {
                    op(record)?;
                }
                if depth > 0 {
                    stack.extend(node.children.iter().map(|c| (*c, depth - 1)));
                }
                self.free_node(ptr.addr)?;
            }
        }

        self.undepend()?;
        self.file.free(self.addr, HEADER_SIZE as u64)?;
        tracing::debug!(header = %self.addr, "keyed B-tree deleted");
        Ok(())
    }
}
