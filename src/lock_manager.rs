//! Per-key lock manager.
//!
//! Keys are FNV-1a hashed into a fixed number of buckets, each bucket a
//! `RwLock<HashMap<key, lock>>`, and each lock is itself a binary
//! semaphore plus a reference count of how many callers currently hold a
//! handle to it. Locks are never freed on unlock — only [`LockManager::clean`]
//! reclaims entries, and only ones nobody currently references.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

struct LockEntry {
    acquire_num: AtomicU32,
    held: Mutex<bool>,
    cond: Condvar,
}

impl LockEntry {
    fn new() -> Self {
        LockEntry {
            acquire_num: AtomicU32::new(0),
            held: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

pub struct LockManager {
    bucket_num: usize,
    timeout: Duration,
    buckets: Vec<RwLock<HashMap<Vec<u8>, std::sync::Arc<LockEntry>>>>,
}

fn fnv1a(key: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET;
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

impl LockManager {
    pub fn new(bucket_num: usize, timeout: Duration) -> Self {
        LockManager {
            bucket_num,
            timeout,
            buckets: (0..bucket_num).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn bucket_idx(&self, key: &[u8]) -> usize {
        (fnv1a(key) as usize) % self.bucket_num
    }

    fn entry_for(&self, key: &[u8]) -> std::sync::Arc<LockEntry> {
        let idx = self.bucket_idx(key);
        if let Some(entry) = self.buckets[idx].read().unwrap().get(key) {
            entry.acquire_num.fetch_add(1, Ordering::AcqRel);
            return entry.clone();
        }
        let mut bucket = self.buckets[idx].write().unwrap();
        if let Some(entry) = bucket.get(key) {
            entry.acquire_num.fetch_add(1, Ordering::AcqRel);
            return entry.clone();
        }
        let entry = std::sync::Arc::new(LockEntry::new());
        entry.acquire_num.store(1, Ordering::Release);
        bucket.insert(key.to_vec(), entry.clone());
        entry
    }

    /// Acquire the per-key lock, blocking up to the configured timeout.
    /// Returns `false` on timeout.
    pub fn lock(&self, key: &[u8]) -> bool {
        let entry = self.entry_for(key);
        let deadline = Instant::now() + self.timeout;
        let mut held = entry.held.lock().unwrap();
        loop {
            if !*held {
                *held = true;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                // Didn't acquire: undo the reference taken in `entry_for`
                // so an abandoned key doesn't pin its entry forever.
                entry.acquire_num.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            let (guard, timeout_result) = self.cond_wait(&entry, held, deadline - now);
            held = guard;
            if timeout_result {
                continue; // recheck against the deadline precisely
            }
        }
    }

    fn cond_wait<'a>(
        &self,
        entry: &'a LockEntry,
        held: std::sync::MutexGuard<'a, bool>,
        timeout: Duration,
    ) -> (std::sync::MutexGuard<'a, bool>, bool) {
        let (guard, result) = entry.cond.wait_timeout(held, timeout).unwrap();
        (guard, result.timed_out())
    }

    /// Release a lock previously acquired with [`Self::lock`].
    pub fn unlock(&self, key: &[u8]) {
        let idx = self.bucket_idx(key);
        let entry = match self.buckets[idx].read().unwrap().get(key) {
            Some(e) => e.clone(),
            None => return,
        };
        {
            let mut held = entry.held.lock().unwrap();
            *held = false;
        }
        entry.cond.notify_one();
        entry.acquire_num.fetch_sub(1, Ordering::AcqRel);
    }

    /// Remove lock entries with no outstanding references. Returns the
    /// number reclaimed.
    pub fn clean(&self) -> usize {
        let mut reclaimed = 0;
        for bucket_lock in &self.buckets {
            let mut bucket = bucket_lock.write().unwrap();
            bucket.retain(|_, entry| {
                let keep = entry.acquire_num.load(Ordering::Acquire) != 0;
                if !keep {
                    reclaimed += 1;
                }
                keep
            });
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_excludes_concurrent_holder() {
        let lm = Arc::new(LockManager::new(8, Duration::from_millis(200)));
        assert!(lm.lock(b"k"));
        let lm2 = lm.clone();
        let handle = thread::spawn(move || lm2.lock(b"k"));
        thread::sleep(Duration::from_millis(20));
        lm.unlock(b"k");
        assert!(handle.join().unwrap());
        lm.unlock(b"k");
    }

    #[test]
    fn lock_times_out_and_releases_reference() {
        let lm = LockManager::new(8, Duration::from_millis(30));
        assert!(lm.lock(b"k"));
        assert!(!lm.lock(b"k"));
        lm.unlock(b"k");
        assert_eq!(lm.clean(), 1);
    }

    #[test]
    fn clean_only_reclaims_unreferenced_keys() {
        let lm = LockManager::new(4, Duration::from_millis(50));
        assert!(lm.lock(b"a"));
        assert!(lm.lock(b"b"));
        lm.unlock(b"b");
        assert_eq!(lm.clean(), 1);
        lm.unlock(b"a");
        assert_eq!(lm.clean(), 1);
    }
}
