//! Bounded document cache
//!
//! Responsibilities:
//! - Hold at most `capacity` document buffers, one slot per document id.
//! - Pin slots while files are open (`open_count`) so they are never evicted
//!   or written back underneath a handle.
//! - Track dirty buffers and write them back to the store with a single
//!   atomic replace when the last handle closes, or when a dirty slot has to
//!   make room for a new document.
//!
//! Locking:
//! - The slot table sits behind one async mutex. Lookups, misses (including
//!   the store fetch), eviction and write-back all run under it, so two
//!   callers can never populate the same id twice.
//! - Each slot's bytes sit behind a short std mutex; reads and writes on a
//!   pinned slot only take that lock. Concurrent writers on one id race,
//!   last writer wins.
//! - Every `Arc<CacheSlot>` handed out counts as a reference. A slot whose
//!   Arc is shared outside the table is treated as pinned.

mod slot;

pub use slot::CacheSlot;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FsError, FsResult};
use crate::store::{DocumentStore, validate_document};
use crate::vfs::path::DocumentId;

/// Default number of slots.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Upper bound for a single document buffer (the store's document limit).
pub const MAX_DOCUMENT_SIZE: u64 = 16 * 1024 * 1024;

/// What happens to a slot after its buffer was written back successfully
/// on the last close.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WritebackPolicy {
    /// Free the slot; the next open fetches from the store again.
    #[default]
    Evict,
    /// Keep the slot as a clean cached entry.
    Retain,
}

#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub capacity: usize,
    pub writeback: WritebackPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            writeback: WritebackPolicy::default(),
        }
    }
}

struct SlotEntry {
    slot: Arc<CacheSlot>,
    open_count: usize,
}

impl SlotEntry {
    /// Pinned by an open handle or by a reference held outside the table.
    fn is_pinned(&self) -> bool {
        self.open_count > 0 || Arc::strong_count(&self.slot) > 1
    }
}

struct SlotTable {
    entries: Vec<Option<SlotEntry>>,
}

impl SlotTable {
    fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
        }
    }

    fn find(&self, id: &DocumentId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.slot.id() == id))
    }

    fn free_index(&self) -> Option<usize> {
        self.entries.iter().position(Option::is_none)
    }

    /// Entry at `index` if it still holds exactly `slot`.
    fn entry_for(&mut self, slot: &Arc<CacheSlot>) -> Option<&mut SlotEntry> {
        self.entries
            .get_mut(slot.index())
            .and_then(Option::as_mut)
            .filter(|e| Arc::ptr_eq(&e.slot, slot))
    }

    fn occupied(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

/// Point-in-time counters for logging and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    pub occupied: usize,
    pub pinned: usize,
    pub dirty: usize,
}

pub struct DocumentCache<S: DocumentStore> {
    store: Arc<S>,
    table: Mutex<SlotTable>,
    config: CacheConfig,
}

impl<S: DocumentStore> DocumentCache<S> {
    pub fn new(store: Arc<S>, config: CacheConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            store,
            table: Mutex::new(SlotTable::new(capacity)),
            config: CacheConfig { capacity, ..config },
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Find the cached slot for `id`, or (with `create_if_missing`) load it
    /// from the store, evicting an unpinned slot if the table is full.
    ///
    /// Without `create_if_missing`, an uncached id yields `NotFound`.
    pub async fn acquire(&self, id: &DocumentId, create_if_missing: bool) -> FsResult<Arc<CacheSlot>> {
        let mut table = self.table.lock().await;
        if let Some(index) = table.find(id) {
            if let Some(entry) = &table.entries[index] {
                return Ok(entry.slot.clone());
            }
        }
        if !create_if_missing {
            return Err(FsError::NotFound);
        }

        let index = match table.free_index() {
            Some(index) => index,
            None => self.evict(&mut table).await?,
        };

        let content = self.store.fetch_by_id(id).await.map_err(FsError::from)?;
        debug!(%id, index, len = content.len(), "cache fill");
        let slot = Arc::new(CacheSlot::new(index, id.clone(), content));
        table.entries[index] = Some(SlotEntry {
            slot: slot.clone(),
            open_count: 0,
        });
        Ok(slot)
    }

    /// Free one slot, preferring clean unpinned entries over dirty ones.
    async fn evict(&self, table: &mut SlotTable) -> FsResult<usize> {
        let clean = table.entries.iter().position(|e| {
            e.as_ref()
                .is_some_and(|e| !e.is_pinned() && !e.slot.is_dirty())
        });
        if let Some(index) = clean {
            if let Some(entry) = table.entries[index].take() {
                debug!(id = %entry.slot.id(), index, "evict clean slot");
            }
            return Ok(index);
        }

        for index in 0..table.entries.len() {
            let candidate = match &table.entries[index] {
                Some(e) if !e.is_pinned() && e.slot.is_dirty() => e.slot.clone(),
                _ => continue,
            };
            let result = self.write_back(&candidate).await;
            drop(candidate);
            match result {
                Ok(()) => {
                    table.entries[index] = None;
                    debug!(index, "evict dirty slot after write-back");
                    return Ok(index);
                }
                Err(e) => {
                    warn!(index, error = %e, "write-back during eviction failed, skipping slot");
                }
            }
        }

        warn!(capacity = table.entries.len(), "no evictable slot");
        Err(FsError::ResourceExhausted)
    }

    /// Persist the slot's buffer. Clears `dirty` unless the buffer changed
    /// while the store call was in flight.
    async fn write_back(&self, slot: &CacheSlot) -> FsResult<()> {
        let (content, version) = slot.snapshot();
        validate_document(&content)?;
        self.store
            .replace_by_id(slot.id(), &content)
            .await
            .map_err(FsError::from)?;
        if !slot.mark_clean(version) {
            debug!(id = %slot.id(), "buffer changed during write-back, stays dirty");
        }
        Ok(())
    }

    /// Pin `slot` for an open handle.
    pub async fn mark_open(&self, slot: &Arc<CacheSlot>) {
        let mut table = self.table.lock().await;
        match table.entry_for(slot) {
            Some(entry) => entry.open_count += 1,
            None => warn!(id = %slot.id(), "mark_open on a slot that is no longer cached"),
        }
    }

    /// Drop one open reference. The last close of a dirty slot writes it
    /// back; a failed write-back leaves the slot cached and dirty.
    pub async fn release(&self, slot: Arc<CacheSlot>) -> FsResult<()> {
        let mut table = self.table.lock().await;
        let Some(entry) = table.entry_for(&slot) else {
            warn!(id = %slot.id(), "release on a slot that is no longer cached");
            return Ok(());
        };
        entry.open_count = entry.open_count.saturating_sub(1);
        if entry.open_count > 0 || !entry.slot.is_dirty() {
            return Ok(());
        }

        let index = slot.index();
        let id = slot.id().clone();
        drop(slot);
        let target = entry.slot.clone();
        let result = self.write_back(&target).await;
        drop(target);

        match result {
            Ok(()) => {
                let evict = self.config.writeback == WritebackPolicy::Evict;
                let freeable = table.entries[index]
                    .as_ref()
                    .is_some_and(|e| !e.is_pinned() && !e.slot.is_dirty());
                if evict && freeable {
                    table.entries[index] = None;
                }
                info!(%id, evicted = evict && freeable, "document written back");
                Ok(())
            }
            Err(e) => {
                warn!(%id, error = %e, "write-back on close failed, slot kept dirty");
                Err(e)
            }
        }
    }

    /// Write back a slot on explicit request (fsync). The slot stays cached.
    pub async fn sync(&self, slot: &Arc<CacheSlot>) -> FsResult<()> {
        let _table = self.table.lock().await;
        if !slot.is_dirty() {
            return Ok(());
        }
        self.write_back(slot).await
    }

    /// Write back `slot` if it is dirty and held by exactly one open handle.
    /// The slot stays cached; the following release finds it clean.
    pub async fn flush_last(&self, slot: &Arc<CacheSlot>) -> FsResult<()> {
        let mut table = self.table.lock().await;
        let last = table
            .entry_for(slot)
            .is_some_and(|e| e.open_count == 1 && e.slot.is_dirty());
        if !last {
            return Ok(());
        }
        self.write_back(slot).await.inspect_err(|e| {
            warn!(id = %slot.id(), error = %e, "write-back on flush failed");
        })
    }

    /// Write back every dirty unpinned slot. Returns how many failed.
    pub async fn flush_all(&self) -> usize {
        let mut table = self.table.lock().await;
        let mut failed = 0;
        for index in 0..table.entries.len() {
            let candidate = match &table.entries[index] {
                Some(e) if !e.is_pinned() && e.slot.is_dirty() => e.slot.clone(),
                _ => continue,
            };
            let result = self.write_back(&candidate).await;
            drop(candidate);
            match result {
                Ok(()) => {
                    if self.config.writeback == WritebackPolicy::Evict {
                        table.entries[index] = None;
                    }
                }
                Err(e) => {
                    failed += 1;
                    warn!(index, error = %e, "flush: write-back failed");
                }
            }
        }
        failed
    }

    pub async fn stats(&self) -> CacheStats {
        let table = self.table.lock().await;
        let live = table.entries.iter().flatten();
        CacheStats {
            capacity: table.entries.len(),
            occupied: table.occupied(),
            pinned: live.clone().filter(|e| e.open_count > 0).count(),
            dirty: live.filter(|e| e.slot.is_dirty()).count(),
        }
    }

    /// Open count of the cached slot for `id`, `None` if not cached.
    pub async fn open_count(&self, id: &DocumentId) -> Option<usize> {
        let table = self.table.lock().await;
        let index = table.find(id)?;
        table.entries[index].as_ref().map(|e| e.open_count)
    }
}
