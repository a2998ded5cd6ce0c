//! Virtual path resolution.
//!
//! The mount exposes a flat namespace:
//! - `/` is the root directory (page 0)
//! - `/it` repeated N times followed by `/` is the root directory at page N
//! - `/` followed by a 24-char lowercase hex id is a document file
//!
//! Anything else is invalid and resolves to not-found. Parsing is pure and
//! never touches the cache or the store.

use std::fmt;

/// Marker prefix consumed once per pagination hop.
pub const PAGE_MARKER: &str = "/it";

/// Length of a document id in hex characters (12-byte object id).
pub const DOCUMENT_ID_LEN: usize = 24;

/// A 24-character lowercase hexadecimal document identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    /// Validate `s` and wrap it; `None` if it is not exactly 24 lowercase hex digits.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == DOCUMENT_ID_LEN
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What a path names once pagination markers are stripped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathKind {
    Root,
    Document(DocumentId),
    Invalid,
}

/// Parsed form of a virtual path.
///
/// `page_depth` is recorded for every path but only listings consult it;
/// `/it/<id>` and `/<id>` address the same document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualPath {
    pub page_depth: u64,
    pub kind: PathKind,
}

impl VirtualPath {
    pub fn is_root(&self) -> bool {
        matches!(self.kind, PathKind::Root)
    }

    pub fn document_id(&self) -> Option<&DocumentId> {
        match &self.kind {
            PathKind::Document(id) => Some(id),
            _ => None,
        }
    }
}

/// Classify a virtual path.
pub fn parse(path: &str) -> VirtualPath {
    let mut rest = path;
    let mut page_depth = 0u64;
    while let Some(stripped) = rest.strip_prefix(PAGE_MARKER) {
        rest = stripped;
        page_depth += 1;
    }

    let kind = match rest.strip_prefix('/') {
        Some("") => PathKind::Root,
        Some(name) if name.len() == DOCUMENT_ID_LEN => match DocumentId::parse(name) {
            Some(id) => PathKind::Document(id),
            None => PathKind::Invalid,
        },
        _ => PathKind::Invalid,
    };
    VirtualPath { page_depth, kind }
}

/// Path of the root directory at `page_depth`, e.g. `/it/it/` for page 2.
pub fn page_path(page_depth: u64) -> String {
    let mut p = PAGE_MARKER.repeat(page_depth as usize);
    p.push('/');
    p
}
