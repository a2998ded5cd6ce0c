//! FUSE adapter
//!
//! Implements the rfuse3 `Filesystem` trait on top of [`MongoFs`]. The kernel
//! speaks inodes and file handles; this layer translates them into virtual
//! paths (see [`inode`]) and open [`FileHandle`]s, and maps `FsError` values
//! to errno codes.
//!
//! - `inode`: inode <-> path table and child name resolution.
//! - `mount`: mount helpers (unprivileged via fusermount3, or privileged).
pub mod inode;
pub mod mount;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyData, ReplyDirectory, ReplyDirectoryPlus,
    ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{Errno, FileType as FuseFileType, Result as FuseResult, SetAttr, Timestamp};
use tracing::{debug, info, warn};

use crate::store::DocumentStore;
use crate::vfs::fs::{FileAttr, FileHandle, FileType, MongoFs};
use crate::vfs::path;
use inode::{InodeTable, ROOT_INO, child_path};

const TTL: Duration = Duration::from_secs(1);

/// One directory entry resolved to its virtual path.
struct Listed {
    name: String,
    kind: FileType,
    path: String,
}

pub struct MongoFuse<S: DocumentStore> {
    fs: Arc<MongoFs<S>>,
    inodes: InodeTable,
    handles: Mutex<HashMap<u64, Arc<FileHandle>>>,
    next_fh: AtomicU64,
}

impl<S: DocumentStore> MongoFuse<S> {
    pub fn new(fs: Arc<MongoFs<S>>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn fs(&self) -> &Arc<MongoFs<S>> {
        &self.fs
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, Arc<FileHandle>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn open_handles(&self) -> usize {
        self.handles().len()
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path_of(ino).ok_or_else(|| libc::ENOENT.into())
    }

    fn handle(&self, fh: u64) -> FuseResult<Arc<FileHandle>> {
        self.handles()
            .get(&fh)
            .cloned()
            .ok_or_else(|| libc::EBADF.into())
    }

    /// Resolve `name` under `parent`, counting a kernel lookup on success.
    async fn lookup_child(&self, parent: u64, name: &OsStr) -> FuseResult<(u64, FileAttr)> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str().ok_or_else(|| Errno::from(libc::ENOENT))?;
        let child = child_path(&parent_path, name).ok_or_else(|| Errno::from(libc::ENOENT))?;
        let attr = self.fs.attributes(&child).await?;
        Ok((self.inodes.lookup(&child), attr))
    }

    async fn open_fh(&self, ino: u64, flags: u32) -> FuseResult<u64> {
        let path = self.path_of(ino)?;
        // 内核启用 FUSE_ATOMIC_O_TRUNC 后 O_TRUNC 只随 open 到达，不再有 setattr
        let truncate = (flags as i32 & libc::O_TRUNC) != 0;
        let handle = self.fs.open_with(&path, truncate).await?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles().insert(fh, Arc::new(handle));
        Ok(fh)
    }

    async fn release_fh(&self, fh: u64) -> FuseResult<()> {
        let Some(handle) = self.handles().remove(&fh) else {
            return Err(libc::EBADF.into());
        };
        // fh 已从表中移除，不会再有新的克隆；等待进行中的请求结束
        let mut shared = handle;
        let handle = loop {
            match Arc::try_unwrap(shared) {
                Ok(handle) => break handle,
                Err(still_shared) => {
                    debug!(fh, "release waits for in-flight requests");
                    shared = still_shared;
                    tokio::task::yield_now().await;
                }
            }
        };
        let id = handle.id().clone();
        self.fs.release(handle).await.map_err(|e| {
            warn!(%id, error = %e, "write-back on release failed");
            Errno::from(e)
        })
    }

    /// `.`, `..` and one page of documents for the directory at `ino`.
    async fn listing(&self, ino: u64) -> FuseResult<Vec<Listed>> {
        let dir = self.path_of(ino)?;
        let vp = path::parse(&dir);
        if !vp.is_root() {
            return Err(libc::ENOTDIR.into());
        }
        let parent = path::page_path(vp.page_depth.saturating_sub(1));
        let entries = self.fs.readdir(&dir).await?;
        Ok(entries
            .into_iter()
            .map(|e| {
                let path = match e.name.as_str() {
                    "." => dir.clone(),
                    ".." => parent.clone(),
                    name => format!("{dir}{name}"),
                };
                Listed {
                    name: e.name,
                    kind: e.kind,
                    path,
                }
            })
            .collect())
    }

    fn dir_entries(&self, listing: Vec<Listed>, offset: i64) -> Vec<DirectoryEntry> {
        let start = offset.max(0) as usize;
        listing
            .into_iter()
            .enumerate()
            .skip(start)
            .map(|(i, l)| DirectoryEntry {
                inode: self.inodes.ino_of(&l.path),
                kind: kind_to_fuse(l.kind),
                name: OsString::from(l.name),
                offset: i as i64 + 1,
            })
            .collect()
    }
}

impl<S> Filesystem for MongoFuse<S>
where
    S: DocumentStore + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(1024 * 1024).unwrap_or(NonZeroU32::MIN);
        info!(page_size = self.fs.page_size(), "filesystem initialised");
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        let failed = self.fs.flush_all().await;
        if failed > 0 {
            warn!(failed, "documents left unwritten at unmount");
        }
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let (ino, attr) = self.lookup_child(parent, name).await?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(ino, &attr, req.uid, req.gid),
            generation: 0,
        })
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes.forget(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            self.inodes.forget(inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        let attr = self.fs.attributes(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &attr, req.uid, req.gid),
        })
    }

    // 仅支持 size（truncate），其余属性忽略
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        if let Some(size) = set_attr.size {
            self.fs.truncate(&path, size).await?;
        }
        let attr = self.fs.attributes(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &attr, req.uid, req.gid),
        })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let fh = self.open_fh(ino, flags).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let handle = self.handle(fh)?;
        let data = self.fs.read(&handle, offset, size as usize);
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let handle = self.handle(fh)?;
        let written = self.fs.write(&handle, offset, data)? as u32;
        Ok(ReplyWrite { written })
    }

    // 最后一个句柄关闭时在此写回，使 close() 能看到写回失败
    async fn flush(&self, _req: Request, _inode: u64, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        let handle = self.handle(fh)?;
        Ok(self.fs.flush(&handle).await?)
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        let handle = self.handle(fh)?;
        Ok(self.fs.fsync(&handle).await?)
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.release_fh(fh).await
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        if !path::parse(&path).is_root() {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let listing = self.listing(ino).await?;
        let entries = self.dir_entries(listing, offset);
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    // 属性按需获取：只为实际发给内核的条目读取文档
    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let listing = self.listing(ino).await?;
        let (uid, gid) = (req.uid, req.gid);
        let entries = stream::iter(listing.into_iter().enumerate().skip(offset as usize))
            .filter_map(move |(i, l)| async move {
                let attr = match self.fs.attributes(&l.path).await {
                    Ok(attr) => attr,
                    Err(e) => {
                        debug!(path = %l.path, error = %e, "skip entry without attributes");
                        return None;
                    }
                };
                let inode = if l.name == "." || l.name == ".." {
                    self.inodes.ino_of(&l.path)
                } else {
                    self.inodes.lookup(&l.path)
                };
                Some(Ok(DirectoryEntryPlus {
                    inode,
                    generation: 0,
                    kind: kind_to_fuse(l.kind),
                    name: OsString::from(l.name),
                    offset: i as i64 + 1,
                    attr: to_fuse_attr(inode, &attr, uid, gid),
                    entry_ttl: TTL,
                    attr_ttl: TTL,
                }))
            });
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(entries);
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(&self, _req: Request, _inode: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let stats = self.fs.cache_stats().await;
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: stats.occupied as u64,
            ffree: stats.capacity.saturating_sub(stats.occupied) as u64,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }
}

fn kind_to_fuse(k: FileType) -> FuseFileType {
    match k {
        FileType::Dir => FuseFileType::Directory,
        FileType::File => FuseFileType::RegularFile,
    }
}

fn to_fuse_attr(ino: u64, attr: &FileAttr, uid: u32, gid: u32) -> rfuse3::raw::reply::FileAttr {
    let now = Timestamp::from(SystemTime::now());
    rfuse3::raw::reply::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: now,
        mtime: now,
        ctime: now,
        #[cfg(target_os = "macos")]
        crtime: now,
        kind: kind_to_fuse(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid,
        gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, WritebackPolicy};
    use crate::store::memory::InMemoryStore;

    fn oid(n: u32) -> String {
        format!("{:024x}", n)
    }

    fn adapter(store: &Arc<InMemoryStore>) -> MongoFuse<InMemoryStore> {
        let fs = MongoFs::new(
            store.clone(),
            CacheConfig {
                capacity: 4,
                writeback: WritebackPolicy::Evict,
            },
            3,
        );
        MongoFuse::new(Arc::new(fs))
    }

    #[tokio::test]
    async fn test_lookup_resolves_documents_and_pages() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(&oid(1), r#"{"a":1}"#);
        let fuse = adapter(&store);

        let (ino, attr) = fuse.lookup_child(ROOT_INO, OsStr::new(&oid(1))).await.unwrap();
        assert_eq!(attr.size, 7);
        assert_eq!(fuse.path_of(ino).unwrap(), format!("/{}", oid(1)));

        let (page, attr) = fuse.lookup_child(ROOT_INO, OsStr::new("it")).await.unwrap();
        assert_eq!(attr.kind, FileType::Dir);
        assert_eq!(fuse.path_of(page).unwrap(), "/it/");

        let missing = fuse.lookup_child(ROOT_INO, OsStr::new(&oid(2))).await;
        assert_eq!(missing.unwrap_err(), Errno::from(libc::ENOENT));
        let bogus = fuse.lookup_child(ROOT_INO, OsStr::new("notes.txt")).await;
        assert_eq!(bogus.unwrap_err(), Errno::from(libc::ENOENT));
        assert_eq!(fuse.path_of(999).unwrap_err(), Errno::from(libc::ENOENT));
    }

    #[tokio::test]
    async fn test_directory_entries_follow_offsets() {
        let store = Arc::new(InMemoryStore::new());
        for n in 0..5 {
            store.insert(&oid(n), "{}");
        }
        let fuse = adapter(&store);

        let all = fuse.dir_entries(fuse.listing(ROOT_INO).await.unwrap(), 0);
        let names: Vec<_> = all.iter().map(|e| e.name.to_string_lossy().into_owned()).collect();
        assert_eq!(names, [".", "..", &oid(0), &oid(1), &oid(2)]);
        assert_eq!(all[0].inode, ROOT_INO);
        assert_eq!(all[1].inode, ROOT_INO);
        assert_eq!(all.last().map(|e| e.offset), Some(5));

        let rest = fuse.dir_entries(fuse.listing(ROOT_INO).await.unwrap(), 3);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].offset, 4);

        let (page, _) = fuse.lookup_child(ROOT_INO, OsStr::new("it")).await.unwrap();
        let second = fuse.dir_entries(fuse.listing(page).await.unwrap(), 0);
        assert_eq!(second[0].inode, page);
        assert_eq!(second[1].inode, ROOT_INO);
        assert_eq!(second[2].name, OsString::from(oid(3)));

        let (doc, _) = fuse.lookup_child(ROOT_INO, OsStr::new(&oid(0))).await.unwrap();
        assert_eq!(fuse.listing(doc).await.err(), Some(Errno::from(libc::ENOTDIR)));
    }

    #[tokio::test]
    async fn test_handles_write_back_on_release() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(&oid(1), "{}");
        let fuse = adapter(&store);
        let (ino, _) = fuse.lookup_child(ROOT_INO, OsStr::new(&oid(1))).await.unwrap();

        let fh = fuse.open_fh(ino, 0).await.unwrap();
        assert_eq!(fuse.open_handles(), 1);
        let handle = fuse.handle(fh).unwrap();
        fuse.fs.truncate(&fuse.path_of(ino).unwrap(), 0).await.unwrap();
        fuse.fs.write(&handle, 0, br#"{"b":2}"#).unwrap();
        drop(handle);

        fuse.release_fh(fh).await.unwrap();
        assert_eq!(fuse.open_handles(), 0);
        assert_eq!(store.get(&oid(1)).unwrap(), br#"{"b":2}"#);

        assert_eq!(fuse.handle(fh).err(), Some(Errno::from(libc::EBADF)));
        assert_eq!(fuse.release_fh(fh).await.err(), Some(Errno::from(libc::EBADF)));
        assert_eq!(fuse.open_fh(ROOT_INO, 0).await.err(), Some(Errno::from(libc::EISDIR)));
    }

    #[tokio::test]
    async fn test_release_failure_reports_io_error() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(&oid(1), "{}");
        let fuse = adapter(&store);
        let (ino, _) = fuse.lookup_child(ROOT_INO, OsStr::new(&oid(1))).await.unwrap();

        let fh = fuse.open_fh(ino, 0).await.unwrap();
        fuse.fs.write(&fuse.handle(fh).unwrap(), 0, b"{ }").unwrap();
        store.set_fail_replace(true);
        assert_eq!(fuse.release_fh(fh).await.err(), Some(Errno::from(libc::EIO)));
        assert_eq!(fuse.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_open_with_o_trunc_empties_document() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(&oid(1), r#"{"long":"value-value-value"}"#);
        let fuse = adapter(&store);
        let (ino, _) = fuse.lookup_child(ROOT_INO, OsStr::new(&oid(1))).await.unwrap();

        let flags = (libc::O_WRONLY | libc::O_TRUNC) as u32;
        let fh = fuse.open_fh(ino, flags).await.unwrap();
        let handle = fuse.handle(fh).unwrap();
        assert_eq!(fuse.fs.read(&handle, 0, 64), b"");
        fuse.fs.write(&handle, 0, br#"{"a":1}"#).unwrap();
        drop(handle);
        fuse.release_fh(fh).await.unwrap();
        assert_eq!(store.get(&oid(1)).unwrap(), br#"{"a":1}"#);

        // 不带 O_TRUNC 时保留原内容
        let fh = fuse.open_fh(ino, libc::O_RDWR as u32).await.unwrap();
        assert_eq!(fuse.fs.read(&fuse.handle(fh).unwrap(), 0, 64), br#"{"a":1}"#);
        fuse.release_fh(fh).await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_writes_back_on_last_handle() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(&oid(1), "{}");
        let fuse = adapter(&store);
        let (ino, _) = fuse.lookup_child(ROOT_INO, OsStr::new(&oid(1))).await.unwrap();

        let first = fuse.open_fh(ino, 0).await.unwrap();
        let second = fuse.open_fh(ino, 0).await.unwrap();
        let handle = fuse.handle(first).unwrap();
        fuse.fs.write(&handle, 0, b"oops").unwrap();

        // 仍有其他句柄打开：flush 不写回
        fuse.fs.flush(&handle).await.unwrap();
        assert_eq!(store.replace_count(), 0);
        fuse.release_fh(second).await.unwrap();

        // 最后一个句柄：校验失败在 flush 时就报告给调用方
        let err = fuse.fs.flush(&handle).await.unwrap_err();
        assert_eq!(Errno::from(err), Errno::from(libc::EINVAL));

        fuse.fs.truncate(&fuse.path_of(ino).unwrap(), 0).await.unwrap();
        fuse.fs.write(&handle, 0, br#"{"c":3}"#).unwrap();
        store.set_fail_replace(true);
        let err = fuse.fs.flush(&handle).await.unwrap_err();
        assert_eq!(Errno::from(err), Errno::from(libc::EIO));

        store.set_fail_replace(false);
        fuse.fs.flush(&handle).await.unwrap();
        assert_eq!(store.get(&oid(1)).unwrap(), br#"{"c":3}"#);
        drop(handle);

        // release 发现已是干净的，不再写回
        fuse.release_fh(first).await.unwrap();
        assert_eq!(store.replace_count(), 1);
    }

    #[tokio::test]
    async fn test_release_waits_for_in_flight_handle() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(&oid(1), "{}");
        let fuse = Arc::new(adapter(&store));
        let (ino, _) = fuse.lookup_child(ROOT_INO, OsStr::new(&oid(1))).await.unwrap();

        let fh = fuse.open_fh(ino, 0).await.unwrap();
        let in_flight = fuse.handle(fh).unwrap();
        fuse.fs.write(&in_flight, 0, b"{ }").unwrap();

        let release = tokio::spawn({
            let fuse = fuse.clone();
            async move { fuse.release_fh(fh).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fuse.open_handles(), 0);
        assert_eq!(store.replace_count(), 0);

        drop(in_flight);
        release.await.unwrap().unwrap();
        assert_eq!(store.get(&oid(1)).unwrap(), b"{ }");
        let stats = fuse.fs.cache_stats().await;
        assert_eq!((stats.pinned, stats.dirty), (0, 0));
    }

    #[test]
    fn test_attr_conversion() {
        let attr = FileAttr {
            kind: FileType::File,
            size: 1025,
            nlink: 1,
            perm: 0o644,
        };
        let fattr = to_fuse_attr(9, &attr, 1000, 100);
        assert_eq!(fattr.ino, 9);
        assert_eq!(fattr.blocks, 3);
        assert_eq!(fattr.perm, 0o644);
        assert_eq!((fattr.uid, fattr.gid), (1000, 100));
        assert!(matches!(fattr.kind, FuseFileType::RegularFile));
    }
}
