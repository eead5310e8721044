//! Crate-wide error taxonomy.
//!
//! A flat `thiserror` enum, one variant per caller-distinguishable failure,
//! so callers can branch on `NotFound` vs `Repeated` vs `Dead` vs
//! `LockTimeout`, … rather than matching on formatted error strings.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database is closed")]
    DbClosed,

    #[error("transaction is closed")]
    TxnClosed,

    #[error("transaction is invalid")]
    TxnInvalid,

    #[error("key cannot be empty")]
    KeyEmpty,

    #[error("key exceeds the configured maximum size")]
    KeyTooLarge,

    #[error("value cannot be empty")]
    ValueEmpty,

    #[error("value exceeds the configured maximum size")]
    ValueTooLarge,

    #[error("timed out acquiring lock for key")]
    LockTimeout,

    #[error("entry does not exist")]
    NotFound,

    #[error("entry already exists and cannot be inserted repeatedly")]
    Repeated,

    #[error("entry is dead")]
    Dead,

    #[error("failed to read page into cache")]
    BufferCorruption,

    #[error("short read from storage at page {page_id}: got {got} of {want} bytes")]
    ShortRead {
        page_id: u64,
        got: usize,
        want: usize,
    },

    #[error("short write to storage at page {page_id}: wrote {wrote} of {want} bytes")]
    ShortWrite {
        page_id: u64,
        wrote: usize,
        want: usize,
    },

    #[error("page {page_id} failed checksum verification")]
    Checksum { page_id: u64 },

    #[error("meta page magic mismatch")]
    Magic,

    #[error("meta page version {found} is older than the minimum supported version {min}")]
    Version { found: u64, min: u64 },

    #[error("node too small to split")]
    SplitNode,

    #[error("buffer pool exhausted: no evictable page after a full clock sweep")]
    NoBuffer,

    #[error("memory pool min size must be <= max size")]
    MemoryMinMaxSize,

    #[error("buffer pool capacity cannot be zero")]
    ZeroBufferCapacity,

    #[error("redirect target not found among parent's index entries")]
    RedirectNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
