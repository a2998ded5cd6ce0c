//! Path-based filesystem operations over a document collection.
//!
//! Every call classifies its path with `path::parse`, then goes through the
//! document cache. Directory listings bypass the cache and query the store
//! for one page of ids each time.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use super::path::{self, DocumentId, PathKind};
use crate::cache::{CacheConfig, CacheSlot, CacheStats, DocumentCache};
use crate::error::{FsError, FsResult};
use crate::store::DocumentStore;

/// Default number of ids per directory page.
pub const DEFAULT_PAGE_SIZE: u64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Dir,
    File,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub kind: FileType,
    pub size: u64,
    pub nlink: u32,
    pub perm: u16,
}

impl FileAttr {
    fn dir() -> Self {
        Self {
            kind: FileType::Dir,
            size: 0,
            nlink: 2,
            perm: 0o755,
        }
    }

    fn file(size: u64) -> Self {
        Self {
            kind: FileType::File,
            size,
            nlink: 1,
            perm: 0o644,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

/// An open document. Valid until passed back to `MongoFs::release`.
pub struct FileHandle {
    slot: Arc<CacheSlot>,
}

impl FileHandle {
    pub fn id(&self) -> &DocumentId {
        self.slot.id()
    }
}

pub struct MongoFs<S: DocumentStore> {
    store: Arc<S>,
    cache: DocumentCache<S>,
    page_size: u64,
}

impl<S: DocumentStore> MongoFs<S> {
    pub fn new(store: Arc<S>, cache: CacheConfig, page_size: u64) -> Self {
        Self {
            cache: DocumentCache::new(store.clone(), cache),
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    fn document_id(path: &str) -> FsResult<DocumentId> {
        let vp = path::parse(path);
        match vp.kind {
            PathKind::Document(id) => Ok(id),
            PathKind::Root => Err(FsError::IsDirectory),
            PathKind::Invalid => Err(FsError::BadPath),
        }
    }

    pub async fn attributes(&self, path: &str) -> FsResult<FileAttr> {
        match path::parse(path).kind {
            PathKind::Root => Ok(FileAttr::dir()),
            PathKind::Document(id) => {
                let slot = self.cache.acquire(&id, true).await?;
                Ok(FileAttr::file(slot.len()))
            }
            PathKind::Invalid => Err(FsError::NotFound),
        }
    }

    /// Feed `.`, `..` and one page of document ids to `filler`. A `false`
    /// from `filler` aborts the listing with an I/O error.
    pub async fn list<F>(&self, path: &str, mut filler: F) -> FsResult<()>
    where
        F: FnMut(DirEntry) -> bool,
    {
        let vp = path::parse(path);
        if !vp.is_root() {
            return Err(FsError::NotFound);
        }
        let skip = vp.page_depth.saturating_mul(self.page_size);
        debug!(path, skip, limit = self.page_size, "list page");

        for name in [".", ".."] {
            let entry = DirEntry {
                name: name.to_owned(),
                kind: FileType::Dir,
            };
            if !filler(entry) {
                return Err(FsError::Io("directory buffer full".into()));
            }
        }

        let mut ids = self.store.list_ids(skip, self.page_size).await?;
        while let Some(item) = ids.next().await {
            let name = item.map_err(|e| {
                warn!(path, error = %e, "listing cursor failed");
                FsError::from(e)
            })?;
            if !filler(DirEntry {
                name,
                kind: FileType::File,
            }) {
                return Err(FsError::Io("directory buffer full".into()));
            }
        }
        Ok(())
    }

    /// Collect a listing into a vector.
    pub async fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let mut out = Vec::new();
        self.list(path, |e| {
            out.push(e);
            true
        })
        .await?;
        Ok(out)
    }

    pub async fn open(&self, path: &str) -> FsResult<FileHandle> {
        self.open_with(path, false).await
    }

    /// Open, optionally emptying the buffer first (`O_TRUNC`).
    pub async fn open_with(&self, path: &str, truncate: bool) -> FsResult<FileHandle> {
        let id = Self::document_id(path)?;
        let slot = self.cache.acquire(&id, true).await?;
        if truncate {
            slot.resize(0)?;
        }
        self.cache.mark_open(&slot).await;
        debug!(%id, truncate, "open");
        Ok(FileHandle { slot })
    }

    pub fn read(&self, handle: &FileHandle, offset: u64, len: usize) -> Vec<u8> {
        handle.slot.read_range(offset, len)
    }

    pub fn write(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> FsResult<usize> {
        handle.slot.write_range(offset, data)
    }

    /// Resize the document at `path`. Addresses the slot by id, so it works
    /// with or without an open handle.
    pub async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        let id = Self::document_id(path)?;
        let slot = self.cache.acquire(&id, true).await?;
        debug!(%id, size, "truncate");
        slot.resize(size)
    }

    /// Persist an open document now; it stays open and cached.
    pub async fn fsync(&self, handle: &FileHandle) -> FsResult<()> {
        self.cache.sync(&handle.slot).await
    }

    /// Write back now if `handle` is the only open reference to its document,
    /// so the closing caller sees the outcome. Other closes are no-ops.
    pub async fn flush(&self, handle: &FileHandle) -> FsResult<()> {
        self.cache.flush_last(&handle.slot).await
    }

    /// Close a handle. Call exactly once per successful `open`.
    pub async fn release(&self, handle: FileHandle) -> FsResult<()> {
        debug!(id = %handle.id(), "release");
        self.cache.release(handle.slot).await
    }

    /// Write back every dirty document that is not open. Returns the number
    /// of documents that could not be written.
    pub async fn flush_all(&self) -> usize {
        self.cache.flush_all().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }
}
