//! MongoFS: expose the documents of one collection as files.
//!
//! Each document is a file named by its 24-hex id, directory listings are
//! pages of the collection, and writes are buffered in a bounded cache and
//! written back on close.

pub mod cache;
pub mod config;
pub mod error;
pub mod fuse;
pub mod logging;
pub mod store;
pub mod vfs;
