//! Pre-image (undo) chain for MVCC snapshot reads.
//!
//! Durability of the undo log itself is out of scope (it only needs to
//! survive for the lifetime of transactions that might still read an old
//! version), so records live in an in-process append-only store keyed by
//! an opaque pointer, rather than on disk the way page data is.

use std::sync::RwLock;

use crate::config::{TransactionId, UndoPtr, INVALID_UNDO_PTR};
use crate::txn_manager::{Snapshot, TransactionManager};

struct UndoRecord {
    prev: UndoPtr,
    /// Transaction that owned this pre-image version.
    tid: TransactionId,
    /// Encoded `DataEntry` bytes as they read before the mutation that
    /// superseded them.
    data: Vec<u8>,
}

/// Append-only chain of pre-image versions. A pointer is `index + 1` into
/// the backing store; `0` is the reserved "no prior version" sentinel.
pub struct UndoManager {
    records: RwLock<Vec<UndoRecord>>,
}

impl UndoManager {
    pub fn new() -> Self {
        UndoManager { records: RwLock::new(Vec::new()) }
    }

    /// Append a new pre-image record chained onto `prev`, returning its
    /// pointer.
    pub fn new_undo_record_ptr(&self, tid: TransactionId, prev: UndoPtr, entry: Vec<u8>) -> UndoPtr {
        let mut records = self.records.write().unwrap();
        records.push(UndoRecord { prev, tid, data: entry });
        records.len() as UndoPtr
    }

    /// Walk the chain starting at `start`, returning the first version
    /// whose owning transaction is visible under `snapshot`. `None` means
    /// no version of this key was visible — the row did not exist yet.
    pub fn search_in_version_chain(
        &self,
        start: UndoPtr,
        tmgr: &TransactionManager,
        snapshot: Snapshot,
    ) -> Option<Vec<u8>> {
        let records = self.records.read().unwrap();
        let mut ptr = start;
        while ptr != INVALID_UNDO_PTR {
            let record = &records[(ptr - 1) as usize];
            if tmgr.check_visibility(record.tid, snapshot) {
                return Some(record.data.clone());
            }
            ptr = record.prev;
        }
        None
    }
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_resolves_to_none() {
        let umgr = UndoManager::new();
        let tmgr = TransactionManager::new();
        let snap = tmgr.get_snapshot();
        assert!(umgr.search_in_version_chain(INVALID_UNDO_PTR, &tmgr, snap).is_none());
    }

    #[test]
    fn finds_the_newest_version_visible_to_the_snapshot() {
        let umgr = UndoManager::new();
        let tmgr = TransactionManager::new();

        let tid1 = tmgr.get_transaction_id();
        tmgr.finish_transaction(tid1);
        let ptr1 = umgr.new_undo_record_ptr(tid1, INVALID_UNDO_PTR, b"v1".to_vec());

        let snap_after_v1 = tmgr.get_snapshot();

        let tid2 = tmgr.get_transaction_id();
        tmgr.finish_transaction(tid2);
        let ptr2 = umgr.new_undo_record_ptr(tid2, ptr1, b"v2".to_vec());

        // an old snapshot only sees v1
        let v = umgr.search_in_version_chain(ptr2, &tmgr, snap_after_v1).unwrap();
        assert_eq!(v, b"v1");

        // a fresh snapshot sees v2, the head of the chain
        let snap_now = tmgr.get_snapshot();
        let v = umgr.search_in_version_chain(ptr2, &tmgr, snap_now).unwrap();
        assert_eq!(v, b"v2");
    }
}
