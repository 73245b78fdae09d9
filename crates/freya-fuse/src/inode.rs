//! Inode management for the FUSE filesystem.
//!
//! Maps FUSE inode numbers to logical paths of the volume and back. Entry
//! kinds are not stored: the backing directory and the metadata store are
//! consulted on every attribute query, so an inode only needs its path.

use dashmap::DashMap;
use freya_core::path;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Logical path within the volume.
    pub path: String,
    /// Lookup count for proper `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    pub fn new(path: String) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(1),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the lookup count by `count` and returns the new value.
    /// Returns `None` if the count would go negative.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::SeqCst);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::SeqCst);
            None
        } else {
            Some(old - count)
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::SeqCst)
    }
}

/// Thread-safe bidirectional map between inodes and logical paths.
pub struct InodeTable {
    path_to_inode: DashMap<String, u64>,
    inode_to_entry: DashMap<u64, InodeEntry>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Creates a new inode table with the root directory pre-allocated.
    pub fn new() -> Self {
        let table = Self {
            path_to_inode: DashMap::new(),
            inode_to_entry: DashMap::new(),
            // inode 1 is reserved for root
            next_inode: AtomicU64::new(2),
        };
        table
            .path_to_inode
            .insert(path::ROOT.to_string(), ROOT_INODE);
        table
            .inode_to_entry
            .insert(ROOT_INODE, InodeEntry::new(path::ROOT.to_string()));
        table
    }

    /// Returns the inode for `path`, allocating one if needed, and counts
    /// one kernel lookup against it.
    pub fn get_or_insert(&self, path: &str) -> u64 {
        if let Some(inode) = self.path_to_inode.get(path) {
            let ino = *inode;
            drop(inode);
            if let Some(entry) = self.inode_to_entry.get(&ino) {
                entry.inc_nlookup();
                return ino;
            }
        }

        let inode = self
            .path_to_inode
            .entry(path.to_string())
            .or_insert_with(|| {
                let ino = self.next_inode.fetch_add(1, Ordering::SeqCst);
                self.inode_to_entry
                    .insert(ino, InodeEntry::new(path.to_string()));
                ino
            });
        *inode
    }

    /// Logical path currently bound to `inode`.
    pub fn path_of(&self, inode: u64) -> Option<String> {
        self.inode_to_entry.get(&inode).map(|e| e.path.clone())
    }

    pub fn get(&self, inode: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, InodeEntry>> {
        self.inode_to_entry.get(&inode)
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(path).map(|r| *r)
    }

    /// Decrements the lookup count for an inode.
    /// Returns `true` if the inode was evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }

        if let Some(entry) = self.inode_to_entry.get(&inode)
            && let Some(remaining) = entry.dec_nlookup(nlookup)
            && remaining == 0
        {
            drop(entry);
            return self.evict(inode);
        }
        false
    }

    fn evict(&self, inode: u64) -> bool {
        if let Some((_, entry)) = self.inode_to_entry.remove(&inode) {
            // the path may already belong to a newer inode
            self.path_to_inode
                .remove_if(&entry.path, |_, ino| *ino == inode);
            true
        } else {
            false
        }
    }

    /// Drops the path mapping after a delete; the inode lives on until
    /// `forget()`.
    pub fn invalidate_path(&self, path: &str) {
        self.path_to_inode.remove(path);
    }

    /// Rebinds the inode at `path` to `key` after its open file was
    /// detached, so handles follow the file instead of the name.
    pub fn detach(&self, path: &str, key: &str) {
        if let Some((_, inode)) = self.path_to_inode.remove(path) {
            self.path_to_inode.insert(key.to_string(), inode);
            if let Some(mut entry) = self.inode_to_entry.get_mut(&inode) {
                entry.path = key.to_string();
            }
        }
    }

    /// Rebinds the inode at `old` to `new`, dropping any mapping at `new`.
    pub fn rename(&self, old: &str, new: &str) {
        self.path_to_inode.remove(new);
        if let Some((_, inode)) = self.path_to_inode.remove(old) {
            self.path_to_inode.insert(new.to_string(), inode);
            if let Some(mut entry) = self.inode_to_entry.get_mut(&inode) {
                entry.path = new.to_string();
            }
        }
    }

    /// Rebinds every inode strictly below the directory `old_prefix`.
    pub fn rename_prefix(&self, old_prefix: &str, new_prefix: &str) {
        let moved: Vec<(u64, String, String)> = self
            .inode_to_entry
            .iter()
            .filter(|e| e.path != old_prefix && path::is_under(&e.path, old_prefix))
            .filter_map(|e| {
                path::rebase(&e.path, old_prefix, new_prefix).map(|new| (*e.key(), e.path.clone(), new))
            })
            .collect();

        for (inode, old, new) in moved {
            self.path_to_inode.remove_if(&old, |_, ino| *ino == inode);
            self.path_to_inode.insert(new.clone(), inode);
            if let Some(mut entry) = self.inode_to_entry.get_mut(&inode) {
                entry.path = new;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_entry.len()
    }

    /// Returns true if the table only contains the root inode.
    pub fn is_empty(&self) -> bool {
        self.inode_to_entry.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
