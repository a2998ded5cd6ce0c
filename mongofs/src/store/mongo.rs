//! MongoDB collection backend (implements DocumentStore).
//!
//! Documents are exposed as relaxed Extended JSON. Write-back parses the
//! buffer back into BSON and issues one `replace_one` with upsert, so the
//! server never observes the document missing.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc, oid::ObjectId};
use mongodb::{Client, Collection};
use tracing::debug;

use super::{DocumentStore, IdStream, validate_document};
use crate::error::{StoreError, StoreResult};
use crate::vfs::path::DocumentId;

pub struct MongoStore {
    collection: Collection<Document>,
}

impl MongoStore {
    pub fn new(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    /// Connect to `uri` and bind to `database.collection`.
    pub async fn connect(uri: &str, database: &str, collection: &str) -> StoreResult<Self> {
        let client = Client::with_uri_str(uri).await.map_err(io_error)?;
        Ok(Self::new(client.database(database).collection(collection)))
    }

    pub fn namespace(&self) -> String {
        self.collection.namespace().to_string()
    }
}

fn io_error(e: mongodb::error::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

fn object_id(id: &DocumentId) -> StoreResult<ObjectId> {
    ObjectId::parse_str(id.as_str()).map_err(|e| StoreError::Validation(e.to_string()))
}

/// Render a document the way it appears in a file.
fn render(document: Document) -> StoreResult<Vec<u8>> {
    let value = Bson::Document(document).into_relaxed_extjson();
    let mut out =
        serde_json::to_vec_pretty(&value).map_err(|e| StoreError::Io(e.to_string()))?;
    out.push(b'\n');
    Ok(out)
}

/// Parse file content into the BSON document stored under `oid`.
fn to_document(oid: ObjectId, content: &[u8]) -> StoreResult<Document> {
    let map = validate_document(content).map_err(|e| StoreError::Validation(e.to_string()))?;
    let mut document =
        Document::try_from(map).map_err(|e| StoreError::Validation(e.to_string()))?;
    // 文件名即 _id，内容中的 _id 不能改变文档身份
    document.insert("_id", oid);
    Ok(document)
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn fetch_by_id(&self, id: &DocumentId) -> StoreResult<Vec<u8>> {
        let oid = object_id(id)?;
        let found = self
            .collection
            .find_one(doc! { "_id": oid })
            .await
            .map_err(io_error)?;
        match found {
            Some(document) => render(document),
            None => Err(StoreError::NotFound),
        }
    }

    async fn list_ids(&self, skip: u64, limit: u64) -> StoreResult<IdStream> {
        let cursor = self
            .collection
            .find(doc! {})
            .projection(doc! { "_id": 1 })
            .skip(skip)
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await
            .map_err(io_error)?;

        // Only ObjectId keys can be addressed by path; others are skipped.
        let ids = cursor
            .map_err(io_error)
            .try_filter_map(|document| async move {
                Ok(match document.get("_id") {
                    Some(Bson::ObjectId(oid)) => Some(oid.to_hex()),
                    other => {
                        debug!(?other, "skip document without ObjectId _id");
                        None
                    }
                })
            });
        Ok(Box::pin(ids))
    }

    async fn replace_by_id(&self, id: &DocumentId, content: &[u8]) -> StoreResult<()> {
        let oid = object_id(id)?;
        let document = to_document(oid, content)?;
        let result = self
            .collection
            .replace_one(doc! { "_id": oid }, document)
            .upsert(true)
            .await
            .map_err(io_error)?;
        debug!(
            %id,
            matched = result.matched_count,
            modified = result.modified_count,
            "replaced document"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OID: &str = "5a53e2bc0ddba4a6e4d2b1f0";

    #[test]
    fn test_render_is_relaxed_extjson() {
        let oid = ObjectId::parse_str(OID).unwrap();
        let out = render(doc! { "_id": oid, "x": 1 }).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["_id"]["$oid"], OID);
        assert_eq!(value["x"], 1);
    }

    #[test]
    fn test_to_document_pins_id() {
        let oid = ObjectId::parse_str(OID).unwrap();
        let other = r#"{"_id": {"$oid": "000000000000000000000000"}, "name": "a"}"#;
        let document = to_document(oid, other.as_bytes()).unwrap();
        assert_eq!(document.get_object_id("_id").unwrap(), oid);
        assert_eq!(document.get_str("name").unwrap(), "a");

        let without_id = to_document(oid, br#"{"x":1}"#).unwrap();
        assert_eq!(without_id.get_object_id("_id").unwrap(), oid);
    }

    #[test]
    fn test_to_document_rejects_non_objects() {
        let oid = ObjectId::parse_str(OID).unwrap();
        assert!(matches!(to_document(oid, b"[1]"), Err(StoreError::Validation(_))));
        assert!(matches!(to_document(oid, b"{"), Err(StoreError::Validation(_))));
    }
}
