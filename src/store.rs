//! The embeddable engine handle: owns the buffer pool, memory pool,
//! lock/transaction/undo managers, the root/level-hint state and the
//! background flush loop.
//!
//! Tree state (`root`/`page_num`/`levels`) lives directly on `Engine`
//! rather than behind a separate tree type, since nothing else ever shares
//! it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::config::{EngineOptions, LEVEL_HINTS, PageId, PAGE_SIZE};
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::lock_manager::LockManager;
use crate::mempool::MemoryPool;
use crate::meta::MetaPage;
use crate::transaction::Transaction;
use crate::txn_manager::TransactionManager;
use crate::undo::UndoManager;

const META_FILE: &str = "data.ingens";
const AUTO_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

struct ActiveTxns {
    count: Mutex<u64>,
    drained: Condvar,
}

/// A single open database. Cheap to share: every public method takes
/// `&self`, so the usual embedding pattern is `Arc<Engine>` (or just
/// `Engine` behind a reference) shared across threads.
pub struct Engine {
    pub(crate) disk: Arc<Disk>,
    pub(crate) bp: BufferPool,
    pub(crate) mem: MemoryPool,
    pub(crate) lock_mgr: LockManager,
    pub(crate) txn_mgr: TransactionManager,
    pub(crate) undo_mgr: UndoManager,
    pub(crate) root: AtomicU64,
    pub(crate) page_num: AtomicU64,
    pub(crate) levels: Vec<AtomicU64>,
    pub(crate) opts: EngineOptions,
    closed: AtomicBool,
    active: ActiveTxns,
    flush_stop: Arc<(Mutex<bool>, Condvar)>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open (creating if necessary) the database file at `path`.
    pub fn open(path: &Path, opts: EngineOptions) -> Result<Arc<Engine>> {
        opts.validate()?;
        let disk = Arc::new(Disk::open(path, META_FILE)?);
        let is_new = disk.len()? == 0;

        let bp = BufferPool::new(disk.clone(), opts.buffer_capacity, opts.buffer_bucket_num);

        let meta = if is_new {
            info!("initializing new database at {}", path.display());
            let meta = MetaPage::fresh();
            let bid = bp.get_buffer_data(0, true)?;
            bp.w_lock(bid);
            {
                let mut buf = [0u8; PAGE_SIZE];
                meta.write_to(&mut buf);
                unsafe { bp.page_bytes(bid) }.copy_from_slice(&buf);
            }
            bp.w_unlock(bid);
            bp.mark_dirty(bid);
            bp.unpin(bid, true);

            let leaf_bid = bp.get_buffer_data(1, true)?;
            bp.w_lock(leaf_bid);
            {
                let bytes = unsafe { bp.page_bytes(leaf_bid) };
                let mut page = crate::page::Page::new(bytes);
                page.init(1, 0);
                page.write_checksum();
            }
            bp.w_unlock(leaf_bid);
            bp.mark_dirty(leaf_bid);
            bp.unpin(leaf_bid, true);
            bp.flush_all()?;
            meta
        } else {
            debug!("opening existing database at {}", path.display());
            let bid = bp.get_buffer_data(0, false)?;
            bp.r_lock(bid);
            let meta = {
                let mut buf = [0u8; PAGE_SIZE];
                buf.copy_from_slice(unsafe { bp.page_bytes(bid) });
                MetaPage::read_from(&buf)?
            };
            bp.r_unlock(bid);
            bp.unpin(bid, false);
            meta
        };

        let levels: Vec<AtomicU64> =
            meta.levels.iter().map(|&pid| AtomicU64::new(pid)).collect();
        debug_assert_eq!(levels.len(), LEVEL_HINTS);

        let engine = Arc::new(Engine {
            disk,
            bp,
            mem: MemoryPool::new(opts.mem_min, opts.mem_max),
            lock_mgr: LockManager::new(opts.buffer_bucket_num, opts.lock_timeout),
            txn_mgr: TransactionManager::new(),
            undo_mgr: UndoManager::new(),
            root: AtomicU64::new(meta.root),
            page_num: AtomicU64::new(meta.page_num),
            levels,
            opts,
            closed: AtomicBool::new(false),
            active: ActiveTxns { count: Mutex::new(0), drained: Condvar::new() },
            flush_stop: Arc::new((Mutex::new(false), Condvar::new())),
            flush_handle: Mutex::new(None),
        });

        engine.spawn_auto_flush();
        Ok(engine)
    }

    fn spawn_auto_flush(self: &Arc<Self>) {
        let engine = self.clone();
        let stop = self.flush_stop.clone();
        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*stop;
            let mut guard = lock.lock().unwrap();
            loop {
                let (g, timeout) = cvar.wait_timeout(guard, AUTO_FLUSH_INTERVAL).unwrap();
                guard = g;
                if *guard {
                    break;
                }
                if timeout.timed_out() {
                    if let Err(e) = engine.bp.flush_all() {
                        warn!("auto-flush failed: {e}");
                    }
                }
            }
            if let Err(e) = engine.bp.flush_all() {
                warn!("final flush on close failed: {e}");
            }
        });
        *self.flush_handle.lock().unwrap() = Some(handle);
    }

    fn write_meta(&self) -> Result<()> {
        let mut levels = [0u64; LEVEL_HINTS];
        for (i, l) in self.levels.iter().enumerate() {
            levels[i] = l.load(Ordering::Acquire);
        }
        let meta = MetaPage {
            status: crate::meta::STATUS_OPEN,
            tid: 0,
            root: self.root.load(Ordering::Acquire),
            page_num: self.page_num.load(Ordering::Acquire),
            levels,
        };
        let bid = self.bp.get_buffer_data(0, false)?;
        self.bp.w_lock(bid);
        {
            let mut buf = [0u8; PAGE_SIZE];
            meta.write_to(&mut buf);
            unsafe { self.bp.page_bytes(bid) }.copy_from_slice(&buf);
        }
        self.bp.w_unlock(bid);
        self.bp.mark_dirty(bid);
        self.bp.unpin(bid, true);
        Ok(())
    }

    /// Stop accepting new transactions, optionally draining in-flight ones,
    /// flush everything dirty, and stop the background flush thread.
    pub fn close(&self, wait_for_txns: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::DbClosed);
        }
        if wait_for_txns {
            let guard = self.active.count.lock().unwrap();
            let _unused = self.active.drained.wait_while(guard, |c| *c != 0).unwrap();
        }

        let (lock, cvar) = &*self.flush_stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(handle) = self.flush_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.write_meta()?;
        self.bp.flush_all()?;
        info!("database closed");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        Ok(())
    }

    /// Begin a new transaction. Fails with [`Error::DbClosed`] once
    /// [`Self::close`] has been called.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let mut count = self.active.count.lock().unwrap();
        self.check_open()?;
        *count += 1;
        drop(count);
        let snapshot = self.txn_mgr.get_snapshot();
        Ok(Transaction::new(self, snapshot))
    }

    pub(crate) fn end_txn(&self) {
        let mut count = self.active.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.active.drained.notify_all();
        }
    }

    #[allow(dead_code)]
    pub(crate) fn alloc_page_num_snapshot(&self) -> PageId {
        self.page_num.load(Ordering::Acquire)
    }

    // -- autocommit convenience API --------------------------------------

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_open()?;
        self.opts.check_key(key)?;
        let snapshot = self.txn_mgr.get_snapshot();
        self.tree_get(snapshot, key)
    }

    pub fn setnx(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_open()?;
        self.opts.check_key(key)?;
        self.opts.check_value(value)?;
        let tid = self.txn_mgr.get_transaction_id();
        let result = self.tree_setnx(tid, key, value);
        self.txn_mgr.finish_transaction(tid);
        result
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_open()?;
        self.opts.check_key(key)?;
        self.opts.check_value(value)?;
        let tid = self.txn_mgr.get_transaction_id();
        let result = self.tree_set(tid, key, value);
        self.txn_mgr.finish_transaction(tid);
        result
    }

    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_open()?;
        self.opts.check_key(key)?;
        self.opts.check_value(value)?;
        let tid = self.txn_mgr.get_transaction_id();
        let result = self.tree_update(tid, key, value);
        self.txn_mgr.finish_transaction(tid);
        result
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.opts.check_key(key)?;
        let tid = self.txn_mgr.get_transaction_id();
        let result = self.tree_delete(tid, key);
        self.txn_mgr.finish_transaction(tid);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> Arc<Engine> {
        use std::sync::atomic::AtomicUsize;
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir()
            .join(format!("ingens-engine-test-{}-{}", std::process::id(), n));
        Engine::open(&dir, EngineOptions::default()).unwrap()
    }

    #[test]
    fn fresh_engine_reports_not_found() {
        let engine = open_tmp();
        assert!(matches!(engine.get(b"missing"), Err(Error::NotFound)));
    }

    #[test]
    fn setnx_then_get_round_trips() {
        let engine = open_tmp();
        engine.setnx(b"k", b"v1").unwrap();
        assert_eq!(engine.get(b"k").unwrap(), b"v1");
        assert!(matches!(engine.setnx(b"k", b"v2"), Err(Error::Repeated)));
    }

    #[test]
    fn closing_an_already_closed_database_fails() {
        let engine = open_tmp();
        engine.close(true).unwrap();
        assert!(matches!(engine.close(true), Err(Error::DbClosed)));
    }
}
