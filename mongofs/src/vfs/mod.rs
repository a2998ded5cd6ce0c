//! VFS layer (virtual filesystem)
//!
//! Responsibilities:
//! - Classify virtual paths into the root page directories and document files.
//! - Implement the file operations (attributes, list, open, read, write,
//!   truncate, release) on top of the document cache.
//! - Translate cache and store outcomes into `FsError`.
//!
//! Submodules:
//! - `path`: virtual path parsing and document id validation
//! - `fs`: the path-based filesystem adapter
pub mod fs;
pub mod path;
