//! Error types shared by the store, cache and filesystem layers.

use thiserror::Error;

/// Outcome of a store call that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,

    #[error("document rejected by store: {0}")]
    Validation(String),

    #[error("store I/O error: {0}")]
    Io(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the cache and the filesystem adapter.
///
/// `errno` is the only place these turn into filesystem error codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("malformed path")]
    BadPath,

    #[error("no such document")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("document cache is full of open entries")]
    ResourceExhausted,

    #[error("buffer is not a valid document: {0}")]
    Malformed(String),

    #[error("is a directory")]
    IsDirectory,

    #[error("document exceeds the maximum size")]
    TooLarge,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::BadPath | FsError::NotFound => libc::ENOENT,
            FsError::Io(_) => libc::EIO,
            FsError::ResourceExhausted => libc::ENFILE,
            FsError::Malformed(_) => libc::EINVAL,
            FsError::IsDirectory => libc::EISDIR,
            FsError::TooLarge => libc::EFBIG,
        }
    }
}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => FsError::NotFound,
            StoreError::Validation(msg) => FsError::Malformed(msg),
            StoreError::Io(msg) => FsError::Io(msg),
        }
    }
}

impl From<FsError> for rfuse3::Errno {
    fn from(e: FsError) -> Self {
        e.errno().into()
    }
}
