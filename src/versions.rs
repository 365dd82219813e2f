//! Version graph for mutable, version-managed data.
//!
//! A directed acyclic graph of `(index, id)` version names.  Every
//! non-root version has exactly one parent; leaves are "tips" (branch
//! heads).  Two caps bound the structure: `max_versions` total nodes
//! (oldest roots are garbage-collected past it) and `max_branches` tips
//! (further forks are rejected).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::VaultError;
use crate::name::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionName {
    pub index: u64,
    pub id: Identity,
}

impl VersionName {
    pub fn new(index: u64, id: Identity) -> Self {
        VersionName { index, id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Node {
    parent: Option<VersionName>,
    child_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredDataVersions {
    max_versions: usize,
    max_branches: usize,
    nodes: BTreeMap<VersionName, Node>,
}

impl StructuredDataVersions {
    pub fn new(max_versions: usize, max_branches: usize) -> Self {
        StructuredDataVersions { max_versions, max_branches, nodes: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Current branch heads, in name order.
    pub fn tips(&self) -> Vec<VersionName> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.child_count == 0)
            .map(|(name, _)| *name)
            .collect()
    }

    /// Append `new` with `old` as its parent.  `old == None` starts the
    /// graph (only valid while it is empty).  Appending to a non-tip
    /// ancestor forks a new branch, bounded by `max_branches`.
    pub fn put(&mut self, old: Option<VersionName>, new: VersionName) -> Result<(), VaultError> {
        if self.nodes.contains_key(&new) {
            // Same action applied twice by the merge pipeline.
            return Ok(());
        }
        match old {
            None => {
                if !self.nodes.is_empty() {
                    return Err(VaultError::UnknownVersion);
                }
            }
            Some(parent) => {
                let parent_node =
                    self.nodes.get(&parent).ok_or(VaultError::UnknownVersion)?;
                let forks = parent_node.child_count > 0;
                if forks && self.tips().len() >= self.max_branches {
                    return Err(VaultError::TooManyBranches);
                }
            }
        }
        if self.nodes.len() >= self.max_versions {
            self.evict_oldest_root()?;
        }
        // The eviction may have removed `old` itself; the new version then
        // becomes the root.
        let parent = old.filter(|p| self.nodes.contains_key(p));
        if let Some(parent) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.child_count += 1;
            }
        }
        self.nodes.insert(new, Node { parent, child_count: 0 });
        Ok(())
    }

    /// The chain from `tip` back to (and including) the root, tip first.
    pub fn get_branch(&self, tip: &VersionName) -> Result<Vec<VersionName>, VaultError> {
        let mut node = self.nodes.get(tip).ok_or(VaultError::UnknownVersion)?;
        if node.child_count != 0 {
            return Err(VaultError::UnknownVersion);
        }
        let mut branch = vec![*tip];
        while let Some(parent) = node.parent {
            branch.push(parent);
            node = match self.nodes.get(&parent) {
                Some(n) => n,
                None => break, // parent was GC'd; chain ends here
            };
        }
        Ok(branch)
    }

    /// Remove the branch from `tip` back until (excluding) the first
    /// version another branch still depends on.
    pub fn delete_branch_until_fork(&mut self, tip: &VersionName) -> Result<usize, VaultError> {
        if self.nodes.get(tip).map(|n| n.child_count) != Some(0) {
            return Err(VaultError::UnknownVersion);
        }
        let mut removed = 0;
        let mut current = *tip;
        loop {
            let node = match self.nodes.get(&current) {
                Some(n) if n.child_count == 0 => n.clone(),
                _ => break,
            };
            self.nodes.remove(&current);
            removed += 1;
            match node.parent {
                Some(parent) => {
                    if let Some(parent_node) = self.nodes.get_mut(&parent) {
                        parent_node.child_count -= 1;
                        if parent_node.child_count > 0 {
                            break; // hit the fork
                        }
                    } else {
                        break;
                    }
                    current = parent;
                }
                None => break,
            }
        }
        Ok(removed)
    }

    /// Drop the oldest single-child root to make room for a new version.
    /// Fails if the graph has forked right at the root, since removing it
    /// would orphan a whole branch.
    fn evict_oldest_root(&mut self) -> Result<(), VaultError> {
        let root = self
            .nodes
            .iter()
            .find(|(_, node)| node.parent.is_none())
            .map(|(name, node)| (*name, node.child_count));
        match root {
            Some((name, child_count)) if child_count <= 1 => {
                self.nodes.remove(&name);
                // The root's child becomes the new root.
                for node in self.nodes.values_mut() {
                    if node.parent == Some(name) {
                        node.parent = None;
                    }
                }
                Ok(())
            }
            _ => Err(VaultError::TooManyVersions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::IDENTITY_SIZE;

    fn version(index: u64, fill: u8) -> VersionName {
        VersionName::new(index, Identity([fill; IDENTITY_SIZE]))
    }

    #[test]
    fn linear_chain_has_one_tip() {
        let mut sdv = StructuredDataVersions::new(100, 2);
        let v0 = version(0, 0);
        let v1 = version(1, 1);
        let v2 = version(2, 2);
        sdv.put(None, v0).unwrap();
        sdv.put(Some(v0), v1).unwrap();
        sdv.put(Some(v1), v2).unwrap();
        assert_eq!(sdv.tips(), vec![v2]);
        assert_eq!(sdv.get_branch(&v2).unwrap(), vec![v2, v1, v0]);
    }

    #[test]
    fn fork_grows_tip_set_until_cap() {
        let mut sdv = StructuredDataVersions::new(100, 2);
        let root = version(0, 0);
        let v1 = version(1, 1);
        let v2 = version(2, 2);
        let v3 = version(2, 3);
        let v4 = version(2, 4);
        sdv.put(None, root).unwrap();
        sdv.put(Some(root), v1).unwrap();
        sdv.put(Some(v1), v2).unwrap();
        assert_eq!(sdv.tips(), vec![v2]);
        sdv.put(Some(v1), v3).unwrap();
        assert_eq!(sdv.tips().len(), 2);
        assert_eq!(sdv.put(Some(v1), v4), Err(VaultError::TooManyBranches));
    }

    #[test]
    fn put_under_unknown_parent_is_rejected() {
        let mut sdv = StructuredDataVersions::new(100, 2);
        sdv.put(None, version(0, 0)).unwrap();
        assert_eq!(
            sdv.put(Some(version(9, 9)), version(10, 1)),
            Err(VaultError::UnknownVersion)
        );
    }

    #[test]
    fn put_is_idempotent() {
        let mut sdv = StructuredDataVersions::new(100, 2);
        let v0 = version(0, 0);
        sdv.put(None, v0).unwrap();
        sdv.put(None, v0).unwrap();
        assert_eq!(sdv.len(), 1);
    }

    #[test]
    fn oldest_root_is_evicted_at_version_cap() {
        let mut sdv = StructuredDataVersions::new(3, 2);
        let versions: Vec<_> = (0..5).map(|i| version(i, i as u8)).collect();
        sdv.put(None, versions[0]).unwrap();
        for window in versions.windows(2) {
            sdv.put(Some(window[0]), window[1]).unwrap();
        }
        assert_eq!(sdv.len(), 3);
        assert_eq!(sdv.tips(), vec![versions[4]]);
        // The surviving chain no longer reaches the evicted roots.
        let branch = sdv.get_branch(&versions[4]).unwrap();
        assert_eq!(branch, vec![versions[4], versions[3], versions[2]]);
    }

    #[test]
    fn delete_branch_until_fork_keeps_shared_prefix() {
        let mut sdv = StructuredDataVersions::new(100, 2);
        let root = version(0, 0);
        let a1 = version(1, 1);
        let a2 = version(2, 2);
        let b1 = version(1, 3);
        sdv.put(None, root).unwrap();
        sdv.put(Some(root), a1).unwrap();
        sdv.put(Some(a1), a2).unwrap();
        sdv.put(Some(root), b1).unwrap();

        let removed = sdv.delete_branch_until_fork(&a2).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(sdv.tips(), vec![b1]);
        assert!(sdv.nodes.contains_key(&root));
    }

    #[test]
    fn deleting_last_branch_empties_graph() {
        let mut sdv = StructuredDataVersions::new(100, 2);
        let v0 = version(0, 0);
        let v1 = version(1, 1);
        sdv.put(None, v0).unwrap();
        sdv.put(Some(v0), v1).unwrap();
        sdv.delete_branch_until_fork(&v1).unwrap();
        assert!(sdv.is_empty());
    }

    #[test]
    fn graph_stays_within_caps_after_mixed_ops() {
        let mut sdv = StructuredDataVersions::new(10, 3);
        let mut tip = version(0, 0);
        sdv.put(None, tip).unwrap();
        for i in 1..40u64 {
            let next = version(i, i as u8);
            sdv.put(Some(tip), next).unwrap();
            tip = next;
            assert!(sdv.len() <= 10);
            assert!(sdv.tips().len() <= 3);
        }
    }
}
