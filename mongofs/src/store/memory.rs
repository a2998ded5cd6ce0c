//! In-process document store (implements DocumentStore).
//!
//! Keeps documents in a sorted map, so listing order is id order. Failure
//! switches let tests drive the store-error branches of the cache.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream;

use super::{DocumentStore, IdStream, validate_document};
use crate::error::{StoreError, StoreResult};
use crate::vfs::path::DocumentId;

#[derive(Default)]
pub struct InMemoryStore {
    docs: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_fetch: AtomicBool,
    fail_replace: AtomicBool,
    // cursor 在产出 n 个 id 后报错
    fail_list_after: Mutex<Option<usize>>,
    fetches: AtomicUsize,
    replaces: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a document directly, bypassing validation.
    pub fn insert(&self, id: &str, content: impl Into<Vec<u8>>) {
        self.lock_docs().insert(id.to_owned(), content.into());
    }

    /// Current stored content of `id`, if any.
    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.lock_docs().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_docs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_list_after(&self, after: Option<usize>) {
        *self
            .fail_list_after
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = after;
    }

    /// Number of `fetch_by_id` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of successful `replace_by_id` calls so far.
    pub fn replace_count(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    fn lock_docs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn fetch_by_id(&self, id: &DocumentId) -> StoreResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected fetch failure".into()));
        }
        self.get(id.as_str()).ok_or(StoreError::NotFound)
    }

    async fn list_ids(&self, skip: u64, limit: u64) -> StoreResult<IdStream> {
        let ids: Vec<String> = self
            .lock_docs()
            .keys()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        let fail_after = *self
            .fail_list_after
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let mut items: Vec<StoreResult<String>> = ids.into_iter().map(Ok).collect();
        if let Some(n) = fail_after {
            items.truncate(n);
            items.push(Err(StoreError::Io("injected cursor failure".into())));
        }
        Ok(Box::pin(stream::iter(items)))
    }

    async fn replace_by_id(&self, id: &DocumentId, content: &[u8]) -> StoreResult<()> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected replace failure".into()));
        }
        validate_document(content).map_err(|e| StoreError::Validation(e.to_string()))?;
        self.lock_docs().insert(id.as_str().to_owned(), content.to_vec());
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn id(n: u8) -> DocumentId {
        DocumentId::parse(&format!("{:024x}", n)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_and_replace() {
        let store = InMemoryStore::new();
        assert_eq!(store.fetch_by_id(&id(1)).await, Err(StoreError::NotFound));

        store.replace_by_id(&id(1), br#"{"a":1}"#).await.unwrap();
        assert_eq!(store.fetch_by_id(&id(1)).await.unwrap(), br#"{"a":1}"#);
        assert_eq!(store.replace_count(), 1);

        let err = store.replace_by_id(&id(1), b"not json").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        // 校验失败不应改动已有内容
        assert_eq!(store.get(id(1).as_str()).unwrap(), br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_list_window_and_cursor_failure() {
        let store = InMemoryStore::new();
        for n in 0..10 {
            store.insert(id(n).as_str(), "{}");
        }
        let page: Vec<String> = store.list_ids(3, 4).await.unwrap().try_collect().await.unwrap();
        assert_eq!(page, (3..7).map(|n| id(n).to_string()).collect::<Vec<_>>());

        store.set_fail_list_after(Some(2));
        let res: StoreResult<Vec<String>> =
            store.list_ids(0, 10).await.unwrap().try_collect().await;
        assert!(matches!(res, Err(StoreError::Io(_))));
    }
}
