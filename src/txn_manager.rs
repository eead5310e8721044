//! Transaction id / commit sequence number bookkeeping.
//!
//! A monotonic `tid` counter, a separate monotonic `csn` counter assigned
//! at commit, and a `tid -> csn` table sharded by `tid >> 16` so concurrent
//! commits of unrelated transactions don't contend on one big table.
//! Visibility is decided by comparing committed `csn`, never by `tid`
//! order directly — two transactions can start in either tid order and
//! still commit in the other order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{CommitSequenceNumber, TransactionId, INVALID_CSN};

const SHARD_WIDTH: usize = 1 << 16;

#[derive(Clone, Copy, Debug)]
pub struct Snapshot {
    pub tid: TransactionId,
    pub csn: CommitSequenceNumber,
}

struct TidToCsn {
    shards: Mutex<HashMap<u64, Arc<Box<[AtomicU64]>>>>,
}

impl TidToCsn {
    fn new() -> Self {
        TidToCsn { shards: Mutex::new(HashMap::new()) }
    }

    fn shard_for(&self, tid: TransactionId) -> Arc<Box<[AtomicU64]>> {
        let key = tid >> 16;
        let mut shards = self.shards.lock().unwrap();
        shards
            .entry(key)
            .or_insert_with(|| {
                Arc::new((0..SHARD_WIDTH).map(|_| AtomicU64::new(INVALID_CSN)).collect())
            })
            .clone()
    }

    fn store(&self, tid: TransactionId, csn: CommitSequenceNumber) {
        let shard = self.shard_for(tid);
        shard[(tid & 0xffff) as usize].store(csn, Ordering::Release);
    }

    fn load(&self, tid: TransactionId) -> CommitSequenceNumber {
        let shard = self.shard_for(tid);
        shard[(tid & 0xffff) as usize].load(Ordering::Acquire)
    }
}

pub struct TransactionManager {
    tid_status: TidToCsn,
    latest_tid: AtomicU64,
    latest_csn: AtomicU64,
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            tid_status: TidToCsn::new(),
            latest_tid: AtomicU64::new(0),
            latest_csn: AtomicU64::new(0),
        }
    }

    pub fn get_snapshot(&self) -> Snapshot {
        Snapshot {
            tid: self.latest_tid.load(Ordering::Acquire),
            csn: self.latest_csn.load(Ordering::Acquire),
        }
    }

    pub fn get_transaction_id(&self) -> TransactionId {
        self.latest_tid.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// `tid`'s write is visible to a reader holding `snapshot` if `tid`
    /// predates the snapshot outright, or if it had already committed with
    /// a commit sequence number at or below the snapshot's — a commit that
    /// just landed with `csn == snapshot.csn` is what the very next
    /// snapshot should observe, since `getSnapshot` reads the *current*
    /// `latestCsn`, not the next one to be handed out. `INVALID_CSN` (`0`)
    /// never collides with a real commit, since the first commit is
    /// assigned `1`, so an uncommitted `tid` stays invisible regardless of
    /// `snapshot.csn`.
    pub fn check_visibility(&self, tid: TransactionId, snapshot: Snapshot) -> bool {
        if tid < snapshot.tid {
            return true;
        }
        let csn = self.tid_status.load(tid);
        csn != INVALID_CSN && csn <= snapshot.csn
    }

    pub fn finish_transaction(&self, tid: TransactionId) {
        let csn = self.latest_csn.fetch_add(1, Ordering::AcqRel) + 1;
        self.tid_status.store(tid, csn);
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncommitted_write_is_invisible_to_a_later_snapshot() {
        let tmgr = TransactionManager::new();
        let tid = tmgr.get_transaction_id();
        let snap = tmgr.get_snapshot();
        assert!(!tmgr.check_visibility(tid, snap));
    }

    #[test]
    fn committed_write_becomes_visible_to_snapshots_taken_after() {
        let tmgr = TransactionManager::new();
        let tid = tmgr.get_transaction_id();
        tmgr.finish_transaction(tid);
        let snap = tmgr.get_snapshot();
        assert!(tmgr.check_visibility(tid, snap));
    }

    #[test]
    fn snapshot_taken_before_commit_never_sees_it() {
        let tmgr = TransactionManager::new();
        let snap_before = tmgr.get_snapshot();
        let tid = tmgr.get_transaction_id();
        tmgr.finish_transaction(tid);
        assert!(!tmgr.check_visibility(tid, snap_before));
    }

    #[test]
    fn transactions_older_than_snapshot_tid_are_always_visible() {
        let tmgr = TransactionManager::new();
        let tid = tmgr.get_transaction_id();
        // no commit yet, but a later snapshot's tid watermark has passed it
        let _later_tid = tmgr.get_transaction_id();
        let snap = tmgr.get_snapshot();
        assert!(tmgr.check_visibility(tid, snap));
    }
}
