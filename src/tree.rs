//! Concurrent B-link tree engine: descent, latch-crabbed right-link
//! traversal, split/propagation and the `get`/`setnx`/`set`/`update`/
//! `delete` operations.
//!
//! A split propagates two index entries, not one: the existing parent slot
//! (keyed by the pre-split high key, pointing at the left/original page)
//! is redirected onto the new right page, and a new entry covering the
//! left page under its own, smaller high key is inserted alongside it —
//! both children stay reachable by their own key range. Growing the tree
//! by one level follows the same shape: the fresh root gets two entries,
//! `(leftHighKey, leftPageId)` and `(rightHighKey, rightPageId)`, rather
//! than one, since a single-entry root would leave the left child
//! unreachable (there is no "go left of the first key" path once a node is
//! marked rightmost).

use std::sync::atomic::Ordering;

use log::{debug, trace};

use crate::buffer::BufferPool;
use crate::config::{PageId, TransactionId, UndoPtr, INVALID_UNDO_PTR, SLOT_SIZE};
use crate::error::{Error, Result};
use crate::page::{
    encode_data_entry_into, encode_index_entry, DataEntryView, IndexEntryView, Page, SplitOp,
    DATA_ENTRY_HEADER_SIZE,
};
use crate::store::Engine;
use crate::txn_manager::Snapshot;

type BufferId = crate::config::BufferId;

enum MoveUpResult {
    RootCreated,
    Parent(BufferId),
}

impl Engine {
    pub(crate) fn alloc_page_id(&self) -> PageId {
        self.page_num.fetch_add(1, Ordering::AcqRel)
    }

    fn bp(&self) -> &BufferPool {
        &self.bp
    }

    fn get_root(&self) -> Result<BufferId> {
        let pid = self.root.load(Ordering::Acquire);
        let bid = self.bp().get_buffer_data(pid, false)?;
        self.bp().r_lock(bid);
        Ok(bid)
    }

    fn new_node(&self, level: u16) -> Result<(PageId, BufferId)> {
        let pid = self.alloc_page_id();
        let bid = self.bp().get_buffer_data(pid, true)?;
        self.bp().w_lock(bid);
        {
            let mut page = Page::new(unsafe { self.bp().page_bytes(bid) });
            page.init(pid, level);
            page.write_checksum();
        }
        self.bp().mark_dirty(bid);
        Ok((pid, bid))
    }

    // -- right-link traversal -----------------------------------------

    /// Step through right siblings with latch crabbing while `key` exceeds
    /// the current node's high key.
    fn move_right_for_down(&self, mut bid: BufferId, key: &[u8], write: bool) -> Result<BufferId> {
        loop {
            let (should_move, right_pid) = {
                let page = Page::new(unsafe { self.bp().page_bytes(bid) });
                if page.is_rightmost() || page.n_slots() == 0 {
                    (false, 0)
                } else if key > page.high_key() {
                    (true, page.right())
                } else {
                    (false, 0)
                }
            };
            if !should_move {
                return Ok(bid);
            }
            let right_bid = self.bp().get_buffer_data(right_pid, false)?;
            if write {
                self.bp().w_lock(right_bid);
                self.bp().w_unlock(bid);
            } else {
                self.bp().r_lock(right_bid);
                self.bp().r_unlock(bid);
            }
            self.bp().unpin(bid, false);
            bid = right_bid;
        }
    }

    /// Step through right siblings (write-latched) until one references
    /// `child_id`, or the rightmost is reached.
    fn move_right_for_up(&self, mut bid: BufferId, child_id: PageId) -> Result<BufferId> {
        loop {
            let (should_move, right_pid) = {
                let page = Page::new(unsafe { self.bp().page_bytes(bid) });
                if page.is_rightmost() || page.is_exist_index_entry(child_id) {
                    (false, 0)
                } else {
                    (true, page.right())
                }
            };
            if !should_move {
                return Ok(bid);
            }
            let right_bid = self.bp().get_buffer_data(right_pid, false)?;
            self.bp().w_lock(right_bid);
            self.bp().w_unlock(bid);
            self.bp().unpin(bid, false);
            bid = right_bid;
        }
    }

    fn upgrade_to_write(&self, bid: BufferId, key: &[u8]) -> Result<BufferId> {
        self.bp().r_unlock(bid);
        self.bp().w_lock(bid);
        self.move_right_for_down(bid, key, true)
    }

    /// Descend from the root to the leaf that should hold `key`, with
    /// read latches the whole way down. Returns the leaf, still
    /// read-latched and pinned, plus the stack of ancestor page ids
    /// (root-to-parent, excluding the leaf itself).
    fn search(&self, key: &[u8]) -> Result<(BufferId, Vec<PageId>)> {
        let mut bid = self.get_root()?;
        let mut stack = Vec::new();
        loop {
            bid = self.move_right_for_down(bid, key, false)?;
            let is_leaf = { Page::new(unsafe { self.bp().page_bytes(bid) }).is_leaf() };
            if is_leaf {
                return Ok((bid, stack));
            }
            let (cur_pid, child) = {
                let page = Page::new(unsafe { self.bp().page_bytes(bid) });
                let (off, _found) = page.binary_search(key);
                let lower = page.lower();
                let child_off = if off >= lower { off - SLOT_SIZE } else { off };
                (page.page_id(), page.child_at(child_off))
            };
            stack.push(cur_pid);
            let child_bid = self.bp().get_buffer_data(child, false)?;
            self.bp().r_lock(child_bid);
            self.bp().r_unlock(bid);
            self.bp().unpin(bid, false);
            bid = child_bid;
        }
    }

    // -- split propagation ----------------------------------------------

    /// Redirect the parent's existing reference to `left_pid` onto
    /// `right_pid`, or grow the tree by one level if `left_pid` was the
    /// root. Returns the ancestor to receive the newly propagated
    /// `IndexEntry` (`left_high_key -> left_pid`), or signals that a fresh
    /// root already fully absorbed the split.
    fn move_up(
        &self,
        left_pid: PageId,
        left_high_key: &[u8],
        right_pid: PageId,
        right_high_key: &[u8],
        level: u16,
        stack: &mut Vec<PageId>,
    ) -> Result<MoveUpResult> {
        if let Some(ancestor_pid) = stack.pop() {
            let pbid = self.bp().get_buffer_data(ancestor_pid, false)?;
            self.bp().w_lock(pbid);
            let pbid = self.move_right_for_up(pbid, left_pid)?;
            {
                let mut page = Page::new(unsafe { self.bp().page_bytes(pbid) });
                page.redirect_entry(left_pid, right_pid)?;
                page.write_checksum();
            }
            self.bp().mark_dirty(pbid);
            return Ok(MoveUpResult::Parent(pbid));
        }

        if self.root.load(Ordering::Acquire) == left_pid {
            let new_level = level + 1;
            let (new_pid, bid) = self.new_node(new_level)?;
            {
                let mut page = Page::new(unsafe { self.bp().page_bytes(bid) });
                let e0 = encode_index_entry(left_high_key, left_pid);
                page.insert(page.lower(), &e0);
                let e1 = encode_index_entry(right_high_key, right_pid);
                let lower = page.lower();
                page.insert(lower, &e1);
                page.write_checksum();
            }
            self.bp().mark_dirty(bid);
            self.bp().w_unlock(bid);
            self.bp().unpin(bid, true);

            if (new_level as usize) < self.levels.len() {
                self.levels[new_level as usize].store(new_pid, Ordering::Release);
            }
            self.root.store(new_pid, Ordering::Release);
            debug!("tree grew to level {new_level}, new root page {new_pid}");
            return Ok(MoveUpResult::RootCreated);
        }

        // A concurrent writer already grew the tree above us; the new
        // root's creation happens-before this load observing it (both
        // stores are `Release`d from that thread before this `Acquire`
        // load can see the new root id), so the matching level hint is
        // guaranteed to be populated by now.
        let hint_level = level as usize + 1;
        let hint_pid = self.levels.get(hint_level).map(|a| a.load(Ordering::Acquire)).unwrap_or(0);
        if hint_pid == 0 {
            return Err(Error::RedirectNotFound);
        }
        stack.push(hint_pid);
        self.move_up(left_pid, left_high_key, right_pid, right_high_key, level, stack)
    }

    /// Binary-search `parent` for the key of `entry`; insert it (splitting
    /// and recursing upward as needed) unless another writer already beat
    /// us to it.
    fn insert_index_entry(&self, bid: BufferId, entry: &[u8], stack: &mut Vec<PageId>) -> Result<()> {
        let key = IndexEntryView(entry).key().to_vec();
        let (off, found) = { Page::new(unsafe { self.bp().page_bytes(bid) }).binary_search(&key) };
        if found {
            self.bp().w_unlock(bid);
            self.bp().unpin(bid, true);
            return Ok(());
        }
        self.insert_or_split(bid, off, entry, stack, SplitOp::Insert)
    }

    fn insert_data_entry(&self, bid: BufferId, off: usize, entry: &[u8], stack: &mut Vec<PageId>) -> Result<()> {
        self.insert_or_split(bid, off, entry, stack, SplitOp::Insert)
    }

    fn update_data_entry(&self, bid: BufferId, off: usize, entry: &[u8], stack: &mut Vec<PageId>) -> Result<()> {
        self.insert_or_split(bid, off, entry, stack, SplitOp::Update)
    }

    fn insert_or_split(
        &self,
        bid: BufferId,
        off: usize,
        entry: &[u8],
        stack: &mut Vec<PageId>,
        op: SplitOp,
    ) -> Result<()> {
        let fits = {
            let page = Page::new(unsafe { self.bp().page_bytes(bid) });
            entry.len() + SLOT_SIZE <= page.free_space_size()
        };
        if fits {
            {
                let mut page = Page::new(unsafe { self.bp().page_bytes(bid) });
                match op {
                    SplitOp::Insert => page.insert(off, entry),
                    SplitOp::Update => page.update_in_place(off, entry),
                }
                page.write_checksum();
            }
            self.bp().mark_dirty(bid);
            self.bp().w_unlock(bid);
            self.bp().unpin(bid, true);
            return Ok(());
        }

        let (left_pid, level) = {
            let page = Page::new(unsafe { self.bp().page_bytes(bid) });
            (page.page_id(), page.level())
        };
        let (right_pid, right_bid) = self.new_node(level)?;

        {
            let src = unsafe { self.bp().page_bytes(bid) };
            let mut left_buf = vec![0u8; crate::config::PAGE_SIZE].into_boxed_slice();
            let src_page = Page::new(src);
            let mut left_page = Page::new(&mut left_buf);
            let right_bytes = unsafe { self.bp().page_bytes(right_bid) };
            let mut right_page = Page::new(right_bytes);
            src_page.split(&mut left_page, &mut right_page, left_pid, right_pid, off, entry, op)?;
            left_page.write_checksum();
            right_page.write_checksum();
            let dst = unsafe { self.bp().page_bytes(bid) };
            dst.copy_from_slice(&left_buf);
        }
        self.bp().mark_dirty(bid);
        self.bp().mark_dirty(right_bid);

        let left_high_key = { Page::new(unsafe { self.bp().page_bytes(bid) }).high_key().to_vec() };
        let right_high_key =
            { Page::new(unsafe { self.bp().page_bytes(right_bid) }).high_key().to_vec() };
        trace!("split page {left_pid} into {left_pid}/{right_pid} at level {level}");

        self.bp().w_unlock(right_bid);
        self.bp().unpin(right_bid, true);
        self.bp().w_unlock(bid);
        self.bp().unpin(bid, true);

        match self.move_up(left_pid, &left_high_key, right_pid, &right_high_key, level, stack)? {
            MoveUpResult::RootCreated => Ok(()),
            MoveUpResult::Parent(pbid) => {
                let new_entry = encode_index_entry(&left_high_key, left_pid);
                self.insert_index_entry(pbid, &new_entry, stack)
            }
        }
    }

    // -- entry construction ----------------------------------------------

    fn build_data_entry(&self, tid: TransactionId, undo_ptr: UndoPtr, key: &[u8], value: &[u8]) -> Vec<u8> {
        let total = DATA_ENTRY_HEADER_SIZE + key.len() + value.len();
        let mut scratch = self.mem.alloc(total);
        encode_data_entry_into(&mut scratch[..total], tid, undo_ptr, 0, key, value);
        let out = scratch[..total].to_vec();
        self.mem.free(scratch);
        out
    }

    /// Chain the entry currently occupying a slot into the undo store so a
    /// snapshot that predates the overwrite can still find it.
    fn chain_old_version(&self, old_bytes: Vec<u8>) -> UndoPtr {
        let view = DataEntryView(&old_bytes);
        let old_tid = view.tid();
        let old_undo = view.undo_ptr();
        self.undo_mgr.new_undo_record_ptr(old_tid, old_undo, old_bytes)
    }

    fn update_existing(
        &self,
        bid: BufferId,
        off: usize,
        tid: TransactionId,
        key: &[u8],
        value: &[u8],
        stack: &mut Vec<PageId>,
    ) -> Result<()> {
        let undo_ptr = {
            let page = Page::new(unsafe { self.bp().page_bytes(bid) });
            let old = page.entry_bytes(off).to_vec();
            self.chain_old_version(old)
        };
        let entry = self.build_data_entry(tid, undo_ptr, key, value);
        self.update_data_entry(bid, off, &entry, stack)
    }

    // -- public operations (consumed by Transaction / Engine autocommit) -

    pub(crate) fn tree_get(&self, snapshot: Snapshot, key: &[u8]) -> Result<Vec<u8>> {
        let (bid, _stack) = self.search(key)?;
        let result = {
            let page = Page::new(unsafe { self.bp().page_bytes(bid) });
            let (off, found) = page.binary_search(key);
            if !found {
                Err(Error::NotFound)
            } else {
                let entry = page.data_entry_at(off);
                if self.txn_mgr.check_visibility(entry.tid(), snapshot) {
                    if entry.is_dead() {
                        Err(Error::NotFound)
                    } else {
                        Ok(entry.value().to_vec())
                    }
                } else {
                    match self.undo_mgr.search_in_version_chain(entry.undo_ptr(), &self.txn_mgr, snapshot) {
                        Some(bytes) => {
                            let view = DataEntryView(&bytes);
                            if view.is_dead() {
                                Err(Error::NotFound)
                            } else {
                                Ok(view.value().to_vec())
                            }
                        }
                        None => Err(Error::NotFound),
                    }
                }
            }
        };
        self.bp().r_unlock(bid);
        self.bp().unpin(bid, false);
        result
    }

    pub(crate) fn tree_setnx(&self, tid: TransactionId, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.lock_mgr.lock(key) {
            return Err(Error::LockTimeout);
        }
        let result = self.setnx_locked(tid, key, value);
        self.lock_mgr.unlock(key);
        result
    }

    fn setnx_locked(&self, tid: TransactionId, key: &[u8], value: &[u8]) -> Result<()> {
        let (bid, mut stack) = self.search(key)?;
        let bid = self.upgrade_to_write(bid, key)?;
        let (off, found) = { Page::new(unsafe { self.bp().page_bytes(bid) }).binary_search(key) };
        if !found {
            let entry = self.build_data_entry(tid, INVALID_UNDO_PTR, key, value);
            return self.insert_data_entry(bid, off, &entry, &mut stack);
        }
        let is_dead = { Page::new(unsafe { self.bp().page_bytes(bid) }).data_entry_at(off).is_dead() };
        if is_dead {
            self.update_existing(bid, off, tid, key, value, &mut stack)
        } else {
            self.bp().w_unlock(bid);
            self.bp().unpin(bid, false);
            Err(Error::Repeated)
        }
    }

    pub(crate) fn tree_update(&self, tid: TransactionId, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.lock_mgr.lock(key) {
            return Err(Error::LockTimeout);
        }
        let result = self.update_locked(tid, key, value);
        self.lock_mgr.unlock(key);
        result
    }

    fn update_locked(&self, tid: TransactionId, key: &[u8], value: &[u8]) -> Result<()> {
        let (bid, mut stack) = self.search(key)?;
        let bid = self.upgrade_to_write(bid, key)?;
        let (off, found) = { Page::new(unsafe { self.bp().page_bytes(bid) }).binary_search(key) };
        if !found {
            self.bp().w_unlock(bid);
            self.bp().unpin(bid, false);
            return Err(Error::NotFound);
        }
        let is_dead = { Page::new(unsafe { self.bp().page_bytes(bid) }).data_entry_at(off).is_dead() };
        if is_dead {
            self.bp().w_unlock(bid);
            self.bp().unpin(bid, false);
            return Err(Error::Dead);
        }
        self.update_existing(bid, off, tid, key, value, &mut stack)
    }

    pub(crate) fn tree_set(&self, tid: TransactionId, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.lock_mgr.lock(key) {
            return Err(Error::LockTimeout);
        }
        let result = self.set_locked(tid, key, value);
        self.lock_mgr.unlock(key);
        result
    }

    fn set_locked(&self, tid: TransactionId, key: &[u8], value: &[u8]) -> Result<()> {
        let (bid, mut stack) = self.search(key)?;
        let bid = self.upgrade_to_write(bid, key)?;
        let (off, found) = { Page::new(unsafe { self.bp().page_bytes(bid) }).binary_search(key) };
        if found {
            self.update_existing(bid, off, tid, key, value, &mut stack)
        } else {
            let entry = self.build_data_entry(tid, INVALID_UNDO_PTR, key, value);
            self.insert_data_entry(bid, off, &entry, &mut stack)
        }
    }

    pub(crate) fn tree_delete(&self, tid: TransactionId, key: &[u8]) -> Result<()> {
        if !self.lock_mgr.lock(key) {
            return Err(Error::LockTimeout);
        }
        let result = self.delete_locked(tid, key);
        self.lock_mgr.unlock(key);
        result
    }

    fn delete_locked(&self, tid: TransactionId, key: &[u8]) -> Result<()> {
        let (bid, _stack) = self.search(key)?;
        let bid = self.upgrade_to_write(bid, key)?;
        let (off, found) = { Page::new(unsafe { self.bp().page_bytes(bid) }).binary_search(key) };
        if !found {
            self.bp().w_unlock(bid);
            self.bp().unpin(bid, false);
            return Err(Error::NotFound);
        }
        let old_bytes = { Page::new(unsafe { self.bp().page_bytes(bid) }).entry_bytes(off).to_vec() };
        if DataEntryView(&old_bytes).is_dead() {
            self.bp().w_unlock(bid);
            self.bp().unpin(bid, false);
            return Err(Error::Dead);
        }
        let new_undo_ptr = self.chain_old_version(old_bytes);
        {
            let mut page = Page::new(unsafe { self.bp().page_bytes(bid) });
            let entry = page.entry_bytes_mut(off);
            crate::page::mark_dead_with_undo(entry, tid, new_undo_ptr);
            page.write_checksum();
        }
        self.bp().mark_dirty(bid);
        self.bp().w_unlock(bid);
        self.bp().unpin(bid, true);
        Ok(())
    }
}
