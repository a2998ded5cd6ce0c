//! Document store adapter
//!
//! The cache and the filesystem adapter only see the `DocumentStore` trait:
//! fetch by id, a paginated id listing, and an atomic replace by id.
//!
//! Submodules:
//! - `memory`: in-process store used by tests and local runs
//! - `mongo`: MongoDB collection backend
pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{FsError, FsResult, StoreResult};
use crate::vfs::path::DocumentId;

/// Lazily produced ids of one listing window. Errors may appear mid-stream.
pub type IdStream = BoxStream<'static, StoreResult<String>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Serialized content of the document `id`.
    async fn fetch_by_id(&self, id: &DocumentId) -> StoreResult<Vec<u8>>;

    /// Ids in store order, skipping `skip` and yielding at most `limit`.
    async fn list_ids(&self, skip: u64, limit: u64) -> StoreResult<IdStream>;

    /// Replace the document `id` with `content` in a single atomic operation.
    async fn replace_by_id(&self, id: &DocumentId, content: &[u8]) -> StoreResult<()>;
}

/// Check that `content` is a well-formed document (a JSON object).
pub fn validate_document(content: &[u8]) -> FsResult<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_slice::<serde_json::Value>(content) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(FsError::Malformed(format!(
            "expected a JSON object, found {}",
            json_kind(&other)
        ))),
        Err(e) => Err(FsError::Malformed(e.to_string())),
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_document() {
        assert!(validate_document(br#"{"x":1}"#).is_ok());
        assert!(validate_document(b"{\n  \"a\": [1, 2]\n}\n").is_ok());
        assert!(matches!(validate_document(b""), Err(FsError::Malformed(_))));
        assert!(matches!(validate_document(b"[1,2]"), Err(FsError::Malformed(_))));
        assert!(matches!(validate_document(b"42"), Err(FsError::Malformed(_))));
        assert!(matches!(validate_document(br#"{"x":1} junk"#), Err(FsError::Malformed(_))));
        // truncate 扩展出的零字节不是合法 JSON
        assert!(matches!(validate_document(b"{\"x\":1}\0\0"), Err(FsError::Malformed(_))));
    }
}
