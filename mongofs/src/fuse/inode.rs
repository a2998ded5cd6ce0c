//! Inode <-> virtual path mapping for the FUSE glue.
//!
//! The kernel addresses everything by inode while the filesystem adapter is
//! path based. Inodes are handed out sequentially per distinct path; the
//! root directory is always inode 1. Lookup counts follow the kernel's
//! `lookup`/`forget` protocol so entries can be dropped again.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::vfs::path::{self, PathKind};

pub const ROOT_INO: u64 = 1;

struct InodeEntry {
    path: String,
    nlookup: u64,
}

struct Inner {
    next: u64,
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<String, u64>,
}

pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let root = path::page_path(0);
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(
            ROOT_INO,
            InodeEntry {
                path: root.clone(),
                nlookup: 0,
            },
        );
        by_path.insert(root, ROOT_INO);
        Self {
            inner: Mutex::new(Inner {
                next: ROOT_INO + 1,
                by_ino,
                by_path,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.lock().by_ino.get(&ino).map(|e| e.path.clone())
    }

    /// Inode for `path`, allocating one if needed. Does not count a lookup.
    pub fn ino_of(&self, path: &str) -> u64 {
        self.get_or_insert(path, 0)
    }

    /// Inode for `path`, counting one kernel lookup.
    pub fn lookup(&self, path: &str) -> u64 {
        self.get_or_insert(path, 1)
    }

    fn get_or_insert(&self, path: &str, lookups: u64) -> u64 {
        let mut inner = self.lock();
        if let Some(&ino) = inner.by_path.get(path) {
            if let Some(entry) = inner.by_ino.get_mut(&ino) {
                entry.nlookup += lookups;
            }
            return ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.by_ino.insert(
            ino,
            InodeEntry {
                path: path.to_owned(),
                nlookup: lookups,
            },
        );
        inner.by_path.insert(path.to_owned(), ino);
        ino
    }

    /// Drop `nlookup` kernel references; the mapping goes away at zero.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.lock();
        let remove = match inner.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.nlookup = entry.nlookup.saturating_sub(nlookup);
                entry.nlookup == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = inner.by_ino.remove(&ino) {
                inner.by_path.remove(&entry.path);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Virtual path of `name` inside the directory at `parent`.
///
/// Directory paths end with `/`, so `name` is first tried as a document and
/// then as a pagination marker (`it` names the next page).
pub fn child_path(parent: &str, name: &str) -> Option<String> {
    let as_file = format!("{parent}{name}");
    if path::parse(&as_file).kind != PathKind::Invalid {
        return Some(as_file);
    }
    let as_dir = format!("{as_file}/");
    (path::parse(&as_dir).kind != PathKind::Invalid).then_some(as_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OID: &str = "5a53e2bc0ddba4a6e4d2b1f0";

    #[test]
    fn test_child_path() {
        assert_eq!(child_path("/", OID), Some(format!("/{OID}")));
        assert_eq!(child_path("/", "it"), Some("/it/".to_string()));
        assert_eq!(child_path("/it/", "it"), Some("/it/it/".to_string()));
        assert_eq!(child_path("/it/", OID), Some(format!("/it/{OID}")));
        assert_eq!(child_path("/", "hello.txt"), None);
        assert_eq!(child_path("/", "."), None);
    }

    #[test]
    fn test_lookup_and_forget() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).as_deref(), Some("/"));

        let doc = format!("/{OID}");
        let ino = table.lookup(&doc);
        assert_ne!(ino, ROOT_INO);
        assert_eq!(table.lookup(&doc), ino);
        assert_eq!(table.ino_of(&doc), ino);
        assert_eq!(table.path_of(ino), Some(doc.clone()));

        table.forget(ino, 1);
        assert_eq!(table.path_of(ino), Some(doc.clone()));
        table.forget(ino, 1);
        assert_eq!(table.path_of(ino), None);

        // root is never forgotten
        table.forget(ROOT_INO, 10);
        assert!(table.path_of(ROOT_INO).is_some());
        assert_eq!(table.len(), 1);
    }
}
