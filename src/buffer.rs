//! Clock-sweep buffer pool.
//!
//! Bucketed (one `RwLock` per hash bucket) so lookups for unrelated pages
//! don't serialize, and pages are reclaimed by a clock sweep over a
//! fixed-size buffer array rather than by list splicing.
//!
//! `pin` (a reference count keeping a buffer from being evicted) and
//! `latch` (the reader/writer lock guarding concurrent access to a buffer's
//! bytes) are kept as distinct concepts throughout: a thread can hold a pin
//! without a latch while deciding what to do next,
//! and the crabbing protocol in `tree.rs` needs to hand a latch from one
//! page to the next without ever dropping below one held latch — something
//! `std::sync::RwLock`'s scoped guards can't express, hence the `Latch`
//! type below.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use crate::config::{BufferId, PageId, INVALID_PAGE_ID, MAX_USAGE, N_BUSY_EVENTS, PAGE_SIZE};
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::page::Page;

// ---------------------------------------------------------------------
// Latch: explicit-acquire/explicit-release reader/writer lock
// ---------------------------------------------------------------------

struct LatchState {
    readers: u32,
    writer: bool,
}

/// A reader/writer lock with `lock`/`unlock` pairs instead of scoped
/// guards. Latch crabbing needs to acquire the next page's latch before
/// releasing the current one, which a function that returns a `RwLock`
/// guard cannot do without the guard outliving the call that produced it.
/// Rather than fight the borrow checker with self-referential structs,
/// this mirrors the original's explicit `RLock`/`RUnlock`/`Lock`/`Unlock`
/// calls: the caller is trusted to pair them correctly, same as it would
/// be trusted to in the source this was ported from.
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Latch {
            state: Mutex::new(LatchState { readers: 0, writer: false }),
            cond: Condvar::new(),
        }
    }

    pub fn r_lock(&self) {
        let mut s = self.state.lock().unwrap();
        while s.writer {
            s = self.cond.wait(s).unwrap();
        }
        s.readers += 1;
    }

    pub fn r_unlock(&self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.readers > 0);
        s.readers -= 1;
        if s.readers == 0 {
            self.cond.notify_all();
        }
    }

    pub fn w_lock(&self) {
        let mut s = self.state.lock().unwrap();
        while s.writer || s.readers > 0 {
            s = self.cond.wait(s).unwrap();
        }
        s.writer = true;
    }

    pub fn w_unlock(&self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.writer);
        s.writer = false;
        self.cond.notify_all();
    }
}

// ---------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------

/// One slot in the fixed-size buffer array. `pin` and `latch` are
/// orthogonal: a pin keeps the slot from being reassigned to a different
/// page; the latch guards concurrent reads/writes of the resident page's
/// bytes.
struct Buffer {
    pid: AtomicU64,
    pin: AtomicU32,
    usage: AtomicU32,
    dirty: AtomicBool,
    valid: AtomicBool,
    loading: AtomicBool,
    latch: Latch,
    bytes: UnsafeCell<Box<[u8]>>,
}

// SAFETY: `bytes` is only ever read or written while the caller holds
// `latch` in the matching mode (enforced by convention in `tree.rs` and
// this module, not by the type system — the same contract the original's
// `RWMutex`-guarded byte slice relied on).
unsafe impl Sync for Buffer {}

impl Buffer {
    fn empty() -> Self {
        Buffer {
            pid: AtomicU64::new(INVALID_PAGE_ID),
            pin: AtomicU32::new(0),
            usage: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            latch: Latch::new(),
            bytes: UnsafeCell::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        }
    }

    /// # Safety
    /// Caller must hold `latch` (read or write) for the duration the
    /// returned slice is used.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self) -> &mut [u8] {
        &mut *self.bytes.get()
    }
}

// ---------------------------------------------------------------------
// BufferPool
// ---------------------------------------------------------------------

struct BusySlot {
    mutex: Mutex<()>,
    cond: Condvar,
}

/// Fixed-capacity page cache with clock-sweep eviction.
pub struct BufferPool {
    disk: Arc<Disk>,
    buffers: Vec<Buffer>,
    buckets: Vec<RwLock<HashMap<PageId, BufferId>>>,
    sweep_cursor: AtomicUsize,
    busy: Vec<BusySlot>,
}

fn bucket_for(pid: PageId, n_buckets: usize) -> usize {
    (pid as usize).wrapping_mul(0x9E37_79B9) % n_buckets
}

impl BufferPool {
    pub fn new(disk: Arc<Disk>, capacity: usize, n_buckets: usize) -> Self {
        BufferPool {
            disk,
            buffers: (0..capacity).map(|_| Buffer::empty()).collect(),
            buckets: (0..n_buckets).map(|_| RwLock::new(HashMap::new())).collect(),
            sweep_cursor: AtomicUsize::new(0),
            busy: (0..N_BUSY_EVENTS)
                .map(|_| BusySlot { mutex: Mutex::new(()), cond: Condvar::new() })
                .collect(),
        }
    }

    fn busy_slot(&self, buffer_id: BufferId) -> &BusySlot {
        &self.busy[buffer_id as usize % self.busy.len()]
    }

    /// Pin the buffer holding `pid`, loading it from disk (or zero-filling
    /// it, if `is_new`) if it is not already resident. Returns a
    /// [`BufferId`]; the caller is responsible for latching before
    /// touching the page bytes and for calling [`Self::unpin`] when done.
    ///
    /// Bucket lookup, clock-sweep victim selection with an abort-and-retry
    /// if a concurrent loader wins the race for the same page, and an
    /// I/O-in-progress barrier so concurrent pins of a page mid-load block
    /// instead of double-reading.
    pub fn get_buffer_data(&self, pid: PageId, is_new: bool) -> Result<BufferId> {
        let bucket_idx = bucket_for(pid, self.buckets.len());

        // 1. fast path: already resident.
        if let Some(&bid) = self.buckets[bucket_idx].read().unwrap().get(&pid) {
            self.pin_and_wait_loaded(bid);
            return Ok(bid);
        }

        // 2. not resident: find and evict a victim under this bucket's
        // write lock, so concurrent loaders of the same pid serialize here.
        let mut bucket = self.buckets[bucket_idx].write().unwrap();
        if let Some(&bid) = bucket.get(&pid) {
            drop(bucket);
            self.pin_and_wait_loaded(bid);
            return Ok(bid);
        }

        let victim = self.find_victim()?;
        let had_old = self.buffers[victim].valid.load(Ordering::Acquire);
        let old_pid = self.buffers[victim].pid.load(Ordering::Acquire);
        let old_bucket_idx = bucket_for(old_pid, self.buckets.len());

        if !had_old || old_bucket_idx == bucket_idx {
            self.evict_and_install(victim, had_old, old_pid)?;
            if had_old {
                bucket.remove(&old_pid);
            }
            bucket.insert(pid, victim as BufferId);
        } else {
            // Two distinct buckets need mutating: always acquire them in
            // ascending index order so a concurrent eviction going the
            // other way can't deadlock against this one.
            drop(bucket);
            let (lo, hi) = (old_bucket_idx.min(bucket_idx), old_bucket_idx.max(bucket_idx));
            let mut lo_guard = self.buckets[lo].write().unwrap();
            let mut hi_guard = self.buckets[hi].write().unwrap();
            self.evict_and_install(victim, had_old, old_pid)?;
            let (old_guard, new_guard) = if old_bucket_idx == lo {
                (&mut lo_guard, &mut hi_guard)
            } else {
                (&mut hi_guard, &mut lo_guard)
            };
            old_guard.remove(&old_pid);
            new_guard.insert(pid, victim as BufferId);
        }

        self.buffers[victim].pin.fetch_add(1, Ordering::AcqRel);
        self.load_into(victim, pid, is_new)?;
        Ok(victim as BufferId)
    }

    fn pin_and_wait_loaded(&self, bid: BufferId) {
        self.buffers[bid as usize].pin.fetch_add(1, Ordering::AcqRel);
        let slot = self.busy_slot(bid);
        let buf = &self.buffers[bid as usize];
        let mut guard = slot.mutex.lock().unwrap();
        while buf.loading.load(Ordering::Acquire) {
            guard = slot.cond.wait(guard).unwrap();
        }
    }

    fn evict_and_install(&self, victim: usize, had_old: bool, old_pid: PageId) -> Result<()> {
        let buf = &self.buffers[victim];
        if had_old && buf.dirty.load(Ordering::Acquire) {
            buf.latch.r_lock();
            // SAFETY: held read latch for the duration of the disk write.
            let bytes: &[u8] = unsafe { buf.bytes_mut() };
            let mut page_buf = [0u8; PAGE_SIZE];
            page_buf.copy_from_slice(bytes);
            buf.latch.r_unlock();
            self.disk.write_page(old_pid, &page_buf)?;
            buf.dirty.store(false, Ordering::Release);
        }
        buf.valid.store(false, Ordering::Release);
        Ok(())
    }

    fn load_into(&self, victim: usize, pid: PageId, is_new: bool) -> Result<()> {
        let buf = &self.buffers[victim];
        buf.loading.store(true, Ordering::Release);
        buf.pid.store(pid, Ordering::Release);
        buf.usage.store(1, Ordering::Release);

        let result: Result<()> = (|| {
            buf.latch.w_lock();
            // SAFETY: write latch held.
            let bytes = unsafe { buf.bytes_mut() };
            if is_new {
                bytes.iter_mut().for_each(|b| *b = 0);
            } else {
                let mut page_buf = [0u8; PAGE_SIZE];
                self.disk.read_page(pid, &mut page_buf)?;
                bytes.copy_from_slice(&page_buf);
                if !Page::new(bytes).verify_checksum() {
                    buf.latch.w_unlock();
                    return Err(Error::BufferCorruption);
                }
            }
            buf.latch.w_unlock();
            Ok(())
        })();

        buf.valid.store(result.is_ok(), Ordering::Release);
        buf.loading.store(false, Ordering::Release);
        let slot = self.busy_slot(victim as BufferId);
        let _g = slot.mutex.lock().unwrap();
        slot.cond.notify_all();
        result
    }

    /// Clock sweep: walk buffers looking for one with `pin == 0`, decaying
    /// `usage` each pass it is skipped. Fails with [`Error::NoBuffer`]
    /// after a bounded number of full revolutions.
    fn find_victim(&self) -> Result<usize> {
        let n = self.buffers.len();
        let max_sweeps = n.saturating_mul((MAX_USAGE as usize) + 1).max(n) + n;
        for _ in 0..max_sweeps {
            let idx = self.sweep_cursor.fetch_add(1, Ordering::AcqRel) % n;
            let buf = &self.buffers[idx];
            if buf.pin.load(Ordering::Acquire) != 0 {
                continue;
            }
            let usage = buf.usage.load(Ordering::Acquire);
            if usage > 0 {
                buf.usage.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            return Ok(idx);
        }
        Err(Error::NoBuffer)
    }

    /// Release a pin acquired by [`Self::get_buffer_data`]. `touched`
    /// bumps the clock-sweep usage counter, capped at `MAX_USAGE`.
    pub fn unpin(&self, bid: BufferId, touched: bool) {
        let buf = &self.buffers[bid as usize];
        if touched {
            let _ = buf
                .usage
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                    Some((u + 1).min(MAX_USAGE))
                });
        }
        buf.pin.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn mark_dirty(&self, bid: BufferId) {
        self.buffers[bid as usize].dirty.store(true, Ordering::Release);
    }

    pub fn r_lock(&self, bid: BufferId) {
        self.buffers[bid as usize].latch.r_lock();
    }
    pub fn r_unlock(&self, bid: BufferId) {
        self.buffers[bid as usize].latch.r_unlock();
    }
    pub fn w_lock(&self, bid: BufferId) {
        self.buffers[bid as usize].latch.w_lock();
    }
    pub fn w_unlock(&self, bid: BufferId) {
        self.buffers[bid as usize].latch.w_unlock();
    }

    pub fn page_id(&self, bid: BufferId) -> PageId {
        self.buffers[bid as usize].pid.load(Ordering::Acquire)
    }

    /// # Safety
    /// Caller must hold the buffer's latch (read or write) for as long as
    /// the returned slice is used.
    pub unsafe fn page_bytes(&self, bid: BufferId) -> &mut [u8] {
        self.buffers[bid as usize].bytes_mut()
    }

    /// Force every dirty buffer to disk, e.g. on a clean shutdown.
    pub fn flush_all(&self) -> Result<()> {
        for buf in &self.buffers {
            if !buf.valid.load(Ordering::Acquire) || !buf.dirty.load(Ordering::Acquire) {
                continue;
            }
            let pid = buf.pid.load(Ordering::Acquire);
            buf.latch.r_lock();
            let mut page_buf = [0u8; PAGE_SIZE];
            {
                let bytes = unsafe { buf.bytes_mut() };
                Page::new(bytes).write_checksum();
                page_buf.copy_from_slice(bytes);
            }
            buf.latch.r_unlock();
            self.disk.write_page(pid, &page_buf)?;
            buf.dirty.store(false, Ordering::Release);
        }
        self.disk.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool(capacity: usize) -> BufferPool {
        let dir = std::env::temp_dir().join(format!("ingens-buffer-test-{}-{}", std::process::id(), capacity));
        let disk = Arc::new(Disk::open(&dir, "data.ingens").unwrap());
        BufferPool::new(disk, capacity, 4)
    }

    #[test]
    fn new_page_round_trips_through_pin_and_flush() {
        let bp = pool(4);
        let bid = bp.get_buffer_data(1, true).unwrap();
        bp.w_lock(bid);
        unsafe {
            let bytes = bp.page_bytes(bid);
            Page::new(bytes).init(1, 0);
        }
        bp.w_unlock(bid);
        bp.mark_dirty(bid);
        bp.unpin(bid, true);
        bp.flush_all().unwrap();

        let bid2 = bp.get_buffer_data(1, false).unwrap();
        bp.r_lock(bid2);
        let level = unsafe { Page::new(bp.page_bytes(bid2)).level() };
        bp.r_unlock(bid2);
        assert_eq!(level, 0);
        bp.unpin(bid2, false);
    }

    #[test]
    fn eviction_starves_when_everything_is_pinned() {
        let bp = pool(2);
        let b1 = bp.get_buffer_data(1, true).unwrap();
        let b2 = bp.get_buffer_data(2, true).unwrap();
        assert_ne!(b1, b2);
        let result = bp.get_buffer_data(3, true);
        assert!(matches!(result, Err(Error::NoBuffer)));
        bp.unpin(b1, false);
        bp.unpin(b2, false);
    }
}
