//! Inode number to virtual path mapping for the FUSE bridge
//!
//! The kernel addresses entries by inode number while the dispatcher works
//! on paths. Numbers are allocated when an entry is handed to the kernel and
//! stay stable until the entry is removed or the kernel forgets every
//! lookup it was given.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct Tables {
    next_ino: u64,
    paths: HashMap<u64, PathBuf>,
    inos: HashMap<PathBuf, u64>,
    /// Outstanding kernel lookups per inode
    lookups: HashMap<u64, u64>,
}

impl Tables {
    fn drop_ino(&mut self, ino: u64) {
        if let Some(path) = self.paths.remove(&ino) {
            self.inos.remove(&path);
        }
        self.lookups.remove(&ino);
    }
}

/// Bidirectional ino <-> virtual path table
#[derive(Debug)]
pub struct InodeTable {
    tables: RwLock<Tables>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut paths = HashMap::new();
        let mut inos = HashMap::new();
        paths.insert(ROOT_INO, PathBuf::from("/"));
        inos.insert(PathBuf::from("/"), ROOT_INO);

        Self {
            tables: RwLock::new(Tables {
                next_ino: ROOT_INO + 1,
                paths,
                inos,
                lookups: HashMap::new(),
            }),
        }
    }

    /// Virtual path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.tables.read().paths.get(&ino).cloned()
    }

    /// Virtual path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Inode already assigned to a path, if any
    pub fn ino(&self, path: &Path) -> Option<u64> {
        self.tables.read().inos.get(path).copied()
    }

    /// Inode for a path handed to the kernel in an entry reply
    ///
    /// Allocates a number on first use and counts one kernel lookup.
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut tables = self.tables.write();
        let ino = match tables.inos.get(path) {
            Some(ino) => *ino,
            None => {
                let ino = tables.next_ino;
                tables.next_ino += 1;
                tables.paths.insert(ino, path.to_path_buf());
                tables.inos.insert(path.to_path_buf(), ino);
                ino
            }
        };
        if ino != ROOT_INO {
            *tables.lookups.entry(ino).or_insert(0) += 1;
        }
        ino
    }

    /// Drop the mapping for a removed path
    pub fn remove_path(&self, path: &Path) {
        let mut tables = self.tables.write();
        if let Some(ino) = tables.inos.get(path).copied() {
            if ino != ROOT_INO {
                tables.drop_ino(ino);
            }
        }
    }

    /// Move `from` and everything below it to `to`
    pub fn rename(&self, from: &Path, to: &Path) {
        if from == to {
            return;
        }
        let mut tables = self.tables.write();

        // The destination is replaced by the rename
        let replaced: Vec<u64> = tables
            .paths
            .iter()
            .filter(|(_, p)| p.starts_with(to))
            .map(|(ino, _)| *ino)
            .collect();
        for ino in replaced {
            tables.drop_ino(ino);
        }

        let moved: Vec<(u64, PathBuf)> = tables
            .paths
            .iter()
            .filter(|(_, p)| p.starts_with(from))
            .map(|(ino, p)| {
                let rest = p.strip_prefix(from).unwrap_or(Path::new(""));
                let new_path = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                (*ino, new_path)
            })
            .collect();

        for (ino, new_path) in moved {
            if let Some(old_path) = tables.paths.insert(ino, new_path.clone()) {
                tables.inos.remove(&old_path);
            }
            tables.inos.insert(new_path, ino);
        }
    }

    /// Kernel dropped `nlookup` references to `ino`; the mapping goes when none remain
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut tables = self.tables.write();
        let remaining = match tables.lookups.get_mut(&ino) {
            Some(count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            tables.drop_ino(ino);
        }
    }

    pub fn len(&self) -> usize {
        self.tables.read().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().paths.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
