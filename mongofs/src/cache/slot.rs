//! A single cached document buffer.

use std::sync::{Mutex, MutexGuard};

use super::MAX_DOCUMENT_SIZE;
use crate::error::{FsError, FsResult};
use crate::vfs::path::DocumentId;

struct SlotData {
    buffer: Vec<u8>,
    dirty: bool,
    // 每次修改递增，用于判断写回期间缓冲区是否又被改动
    version: u64,
}

/// Buffered content of one document. The buffer length is the file length.
pub struct CacheSlot {
    index: usize,
    id: DocumentId,
    data: Mutex<SlotData>,
}

impl CacheSlot {
    pub(super) fn new(index: usize, id: DocumentId, content: Vec<u8>) -> Self {
        Self {
            index,
            id,
            data: Mutex::new(SlotData {
                buffer: content,
                dirty: false,
                version: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn len(&self) -> u64 {
        self.lock().buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Up to `max_len` bytes starting at `offset`; empty past the end.
    pub fn read_range(&self, offset: u64, max_len: usize) -> Vec<u8> {
        let data = self.lock();
        let len = data.buffer.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start + max_len.min(len - start);
        data.buffer[start..end].to_vec()
    }

    /// Copy `bytes` to `offset`, growing the buffer if needed. Marks dirty.
    /// An empty write changes nothing, like a zero-length `pwrite`.
    pub fn write_range(&self, offset: u64, bytes: &[u8]) -> FsResult<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(bytes.len() as u64)
            .filter(|end| *end <= MAX_DOCUMENT_SIZE)
            .ok_or(FsError::TooLarge)?;
        let (start, end) = (offset as usize, end as usize);

        let mut data = self.lock();
        if end > data.buffer.len() {
            data.buffer.resize(end, 0);
        }
        data.buffer[start..end].copy_from_slice(bytes);
        data.dirty = true;
        data.version += 1;
        Ok(bytes.len())
    }

    /// Set the length to `new_len`; growth is zero-filled. Marks dirty.
    pub fn resize(&self, new_len: u64) -> FsResult<()> {
        if new_len > MAX_DOCUMENT_SIZE {
            return Err(FsError::TooLarge);
        }
        let mut data = self.lock();
        data.buffer.resize(new_len as usize, 0);
        data.dirty = true;
        data.version += 1;
        Ok(())
    }

    /// Copy of the buffer together with its mutation version.
    pub(super) fn snapshot(&self) -> (Vec<u8>, u64) {
        let data = self.lock();
        (data.buffer.clone(), data.version)
    }

    /// Clear `dirty` if nothing changed since `version` was observed.
    pub(super) fn mark_clean(&self, version: u64) -> bool {
        let mut data = self.lock();
        if data.version == version {
            data.dirty = false;
            true
        } else {
            false
        }
    }
}
