//! Crate-wide constants and the primitive types used throughout the engine.

use std::time::Duration;

/// 64 KiB pages, addressable by 16-bit in-page offsets.
pub const PAGE_SIZE: usize = 65_536;

/// Last 8 bytes of every page hold a CRC32C checksum of the rest.
pub const CHECKSUM_SIZE: usize = 8;

/// Page header: pageId(8) lower(2) upper(2) level(2) left(8) right(8).
pub const PAGE_HEADER_SIZE: usize = 30;

pub const HDR_PAGE_ID: usize = 0;
pub const HDR_LOWER: usize = 8;
pub const HDR_UPPER: usize = 10;
pub const HDR_LEVEL: usize = 12;
pub const HDR_LEFT: usize = 14;
pub const HDR_RIGHT: usize = 22;

/// Width of a slot (a big-endian `u16` byte offset into the page).
pub const SLOT_SIZE: usize = 2;

/// Page id 0 is reserved for the meta page; it also serves as the
/// "invalid" sentinel for left/right links and child pointers.
pub const META_PID: PageId = 0;
pub const INVALID_PAGE_ID: PageId = 0;

/// Transaction ids and commit sequence numbers are monotonic u64s; 0 is invalid.
pub const INVALID_TID: TransactionId = 0;
pub const INVALID_CSN: CommitSequenceNumber = 0;

/// Undo chain pointers are opaque u64s; 0 means "no prior version".
pub const INVALID_UNDO_PTR: UndoPtr = 0;

pub type PageId = u64;
pub type BufferId = u32;
/// Offset within a page. 64KiB pages fit in a u16, but usize avoids casts.
pub type ItemPointer = usize;
pub type Key = Vec<u8>;
pub type Value = Vec<u8>;
pub type TransactionId = u64;
pub type CommitSequenceNumber = u64;
pub type UndoPtr = u64;

pub const B: usize = 1;
pub const KIB: usize = 1024 * B;

pub const MAX_KEY_SIZE: usize = KIB;
pub const MAX_VALUE_SIZE: usize = KIB;

/// Number of cached level hints (`levels[L]`); generous enough that no
/// realistic tree height ever exceeds it.
pub const LEVEL_HINTS: usize = 32;

/// Condition variables used to let waiters block on an in-flight buffer load.
pub const N_BUSY_EVENTS: usize = 8;

/// Clock-sweep usage counter ceiling.
pub const MAX_USAGE: u32 = 5;

/// Configuration accepted by [`crate::Engine::open`].
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Maximum accepted key size in bytes.
    pub key_size: usize,
    /// Maximum accepted value size in bytes.
    pub value_size: usize,
    /// Whether keys/values passed across the transaction boundary are
    /// copied into pool-owned buffers before use.
    pub copy_inputs: bool,
    /// Number of buffer slots in the page cache.
    pub buffer_capacity: usize,
    /// Number of hash buckets backing the buffer cache's page index.
    pub buffer_bucket_num: usize,
    /// Memory pool minimum size class (rounded up to a power of two).
    pub mem_min: u32,
    /// Memory pool maximum size class (rounded down to a power of two).
    pub mem_max: u32,
    /// Timeout for acquiring a per-key write lock.
    pub lock_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            key_size: MAX_KEY_SIZE,
            value_size: MAX_VALUE_SIZE,
            copy_inputs: true,
            buffer_capacity: 2048, // 2048 * 64KiB = 128MiB
            buffer_bucket_num: 256,
            mem_min: 16,
            mem_max: 64 * KIB as u32,
            lock_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;
        if self.key_size > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if self.value_size > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }
        if self.buffer_capacity == 0 || self.buffer_bucket_num == 0 {
            return Err(Error::ZeroBufferCapacity);
        }
        let min = crate::mempool::align_up_pow2(self.mem_min);
        let max = crate::mempool::align_down_pow2(self.mem_max);
        if min > max {
            return Err(Error::MemoryMinMaxSize);
        }
        Ok(())
    }

    pub fn check_key(&self, key: &[u8]) -> crate::error::Result<()> {
        use crate::error::Error;
        if key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        if key.len() > self.key_size {
            return Err(Error::KeyTooLarge);
        }
        Ok(())
    }

    pub fn check_value(&self, value: &[u8]) -> crate::error::Result<()> {
        use crate::error::Error;
        if value.is_empty() {
            return Err(Error::ValueEmpty);
        }
        if value.len() > self.value_size {
            return Err(Error::ValueTooLarge);
        }
        Ok(())
    }
}
