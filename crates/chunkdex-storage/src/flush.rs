//! Flush-order dependencies between metadata structures.
//!
//! A dependency `parent -> child` means the parent must reach stable storage
//! no later than the child. In single-writer/multiple-reader mode a chunk
//! index registers its header as a child of the owning dataset's metadata
//! record, so a reader never finds an index that its dataset record does not
//! yet describe.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use chunkdex_common::{ChunkdexError, FileAddr, Result};

/// Directed acyclic graph of flush-order constraints.
#[derive(Debug, Default, Clone)]
pub struct FlushDependencies {
    /// child -> parents
    parents: BTreeMap<FileAddr, BTreeSet<FileAddr>>,
    /// parent -> children
    children: BTreeMap<FileAddr, BTreeSet<FileAddr>>,
}

impl FlushDependencies {
    /// Creates an empty dependency graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of registered dependencies.
    pub fn len(&self) -> usize {
        self.parents.values().map(BTreeSet::len).sum()
    }

    /// Returns true if no dependency is registered.
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Registers that `parent` must be flushed no later than `child`.
    pub fn add(&mut self, parent: FileAddr, child: FileAddr) -> Result<()> {
        if parent == child {
            return Err(ChunkdexError::Internal(format!(
                "flush dependency of {} on itself",
                parent
            )));
        }
        if self.reaches(child, parent) {
            return Err(ChunkdexError::Internal(format!(
                "flush dependency {} -> {} would create a cycle",
                parent, child
            )));
        }

        self.parents.entry(child).or_default().insert(parent);
        self.children.entry(parent).or_default().insert(child);
        Ok(())
    }

    /// Removes a previously registered dependency.
    pub fn remove(&mut self, parent: FileAddr, child: FileAddr) -> Result<()> {
        let removed = self
            .parents
            .get_mut(&child)
            .map(|set| set.remove(&parent))
            .unwrap_or(false);
        if !removed {
            return Err(ChunkdexError::NotFound(format!(
                "flush dependency {} -> {}",
                parent, child
            )));
        }

        if self.parents.get(&child).is_some_and(BTreeSet::is_empty) {
            self.parents.remove(&child);
        }
        if let Some(set) = self.children.get_mut(&parent) {
            set.remove(&child);
            if set.is_empty() {
                self.children.remove(&parent);
            }
        }
        Ok(())
    }

    /// Returns true if `parent -> child` is registered.
    pub fn contains(&self, parent: FileAddr, child: FileAddr) -> bool {
        self.parents
            .get(&child)
            .is_some_and(|set| set.contains(&parent))
    }

    /// Returns every direct parent of `child`.
    pub fn parents_of(&self, child: FileAddr) -> Vec<FileAddr> {
        self.parents
            .get(&child)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops every dependency that mentions `addr`.
    pub fn forget(&mut self, addr: FileAddr) {
        if let Some(parents) = self.parents.remove(&addr) {
            for parent in parents {
                if let Some(set) = self.children.get_mut(&parent) {
                    set.remove(&addr);
                    if set.is_empty() {
                        self.children.remove(&parent);
                    }
                }
            }
        }
        if let Some(children) = self.children.remove(&addr) {
            for child in children {
                if let Some(set) = self.parents.get_mut(&child) {
                    set.remove(&addr);
                    if set.is_empty() {
                        self.parents.remove(&child);
                    }
                }
            }
        }
    }

    /// Returns every address in an order where parents precede children.
    pub fn flush_order(&self) -> Vec<FileAddr> {
        let mut indegree: BTreeMap<FileAddr, usize> = BTreeMap::new();
        for (parent, children) in &self.children {
            indegree.entry(*parent).or_insert(0);
            for child in children {
                *indegree.entry(*child).or_insert(0) += 1;
            }
        }

        let mut ready: VecDeque<FileAddr> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(a, _)| *a)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());

        while let Some(addr) = ready.pop_front() {
            order.push(addr);
            if let Some(children) = self.children.get(&addr) {
                for child in children {
                    if let Some(d) = indegree.get_mut(child) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push_back(*child);
                        }
                    }
                }
            }
        }

        order
    }

    /// Returns true if `to` is reachable from `from` along parent -> child edges.
    fn reaches(&self, from: FileAddr, to: FileAddr) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(addr) = stack.pop() {
            if addr == to {
                return true;
            }
            if !seen.insert(addr) {
                continue;
            }
            if let Some(children) = self.children.get(&addr) {
                stack.extend(children.iter().copied());
            }
        }
        false
    }
}
