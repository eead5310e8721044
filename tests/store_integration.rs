use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use skv::{Engine, EngineOptions, Error};

const RAND_SEED: u64 = 2021;

fn test_opts() -> EngineOptions {
    EngineOptions { buffer_capacity: 64, buffer_bucket_num: 8, ..EngineOptions::default() }
}

fn open(name: &str) -> Arc<Engine> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = std::env::temp_dir().join(format!("ingens-it-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&dir);
    Engine::open(Path::new(&dir), test_opts()).unwrap()
}

#[test]
fn empty_database_reports_not_found() {
    let engine = open("empty");
    assert!(matches!(engine.get(b"absent"), Err(Error::NotFound)));
}

#[test]
fn setnx_then_get_round_trips_and_rejects_duplicates() {
    let engine = open("setnx");
    engine.setnx(b"one", b"1").unwrap();
    assert_eq!(engine.get(b"one").unwrap(), b"1");
    assert!(matches!(engine.setnx(b"one", b"1-again"), Err(Error::Repeated)));
}

#[test]
fn update_requires_an_existing_live_entry() {
    let engine = open("update");
    assert!(matches!(engine.update(b"k", b"v"), Err(Error::NotFound)));
    engine.setnx(b"k", b"v1").unwrap();
    engine.update(b"k", b"v2").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), b"v2");
}

#[test]
fn delete_then_reinsert_round_trips() {
    let engine = open("delete-reinsert");
    engine.setnx(b"k", b"v1").unwrap();
    engine.delete(b"k").unwrap();
    assert!(matches!(engine.get(b"k"), Err(Error::NotFound)));
    assert!(matches!(engine.delete(b"k"), Err(Error::Dead)));
    engine.setnx(b"k", b"v2").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), b"v2");
}

#[test]
fn set_upserts_regardless_of_prior_state() {
    let engine = open("set-upsert");
    engine.set(b"k", b"v1").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), b"v1");
    engine.set(b"k", b"v2").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), b"v2");
}

#[test]
fn explicit_transaction_commit_is_visible_afterward() {
    let engine = open("txn-commit");
    let mut txn = engine.begin().unwrap();
    txn.setnx(b"a", b"1").unwrap();
    txn.setnx(b"b", b"2").unwrap();
    assert_eq!(txn.get(b"a").unwrap(), b"1");
    txn.commit().unwrap();

    assert_eq!(engine.get(b"a").unwrap(), b"1");
    assert_eq!(engine.get(b"b").unwrap(), b"2");
}

#[test]
fn rolled_back_transaction_rejects_further_use() {
    let engine = open("txn-closed");
    let mut txn = engine.begin().unwrap();
    txn.setnx(b"a", b"1").unwrap();
    txn.rollback().unwrap();
    assert!(matches!(txn.get(b"a"), Err(Error::TxnClosed)));
    assert!(matches!(txn.setnx(b"b", b"2"), Err(Error::TxnClosed)));
    assert!(matches!(txn.rollback(), Err(Error::TxnClosed)));
}

#[test]
fn committed_transaction_rejects_further_use() {
    let engine = open("txn-commit-closed");
    let mut txn = engine.begin().unwrap();
    txn.setnx(b"a", b"1").unwrap();
    txn.commit().unwrap();
    assert!(matches!(txn.get(b"a"), Err(Error::TxnClosed)));
    assert!(matches!(txn.commit(), Err(Error::TxnClosed)));
}

#[test]
fn snapshot_taken_before_a_write_keeps_seeing_the_old_value() {
    let engine = open("snapshot-isolation");
    engine.setnx(b"k", b"v0").unwrap();

    let reader = engine.begin().unwrap();
    assert_eq!(reader.get(b"k").unwrap(), b"v0");

    engine.update(b"k", b"v1").unwrap();

    // the reader's snapshot predates the update, so it must keep seeing v0
    assert_eq!(reader.get(b"k").unwrap(), b"v0");
    // a fresh read observes the new value
    assert_eq!(engine.get(b"k").unwrap(), b"v1");
}

#[test]
fn snapshot_survives_a_delete_of_the_same_key() {
    let engine = open("snapshot-delete");
    engine.setnx(b"k", b"v0").unwrap();
    let reader = engine.begin().unwrap();
    engine.delete(b"k").unwrap();

    assert_eq!(reader.get(b"k").unwrap(), b"v0");
    assert!(matches!(engine.get(b"k"), Err(Error::NotFound)));
}

#[test]
fn forced_split_keeps_every_key_reachable() {
    let engine = open("forced-split");
    let keys: Vec<Vec<u8>> = (0..26u8).map(|i| vec![b'a' + i; 200]).collect();
    for (i, k) in keys.iter().enumerate() {
        let v = format!("value-{i}").into_bytes();
        engine.setnx(k, &v).unwrap();
    }
    for (i, k) in keys.iter().enumerate() {
        let want = format!("value-{i}").into_bytes();
        assert_eq!(engine.get(k).unwrap(), want, "key index {i} unreachable after split");
    }
}

#[test]
fn reopen_preserves_committed_state() {
    let dir = std::env::temp_dir().join(format!("ingens-it-{}-reopen", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    {
        let engine = Engine::open(&dir, test_opts()).unwrap();
        engine.setnx(b"persisted", b"yes").unwrap();
        engine.close(true).unwrap();
    }
    let engine = Engine::open(&dir, test_opts()).unwrap();
    assert_eq!(engine.get(b"persisted").unwrap(), b"yes");
}

#[test]
fn concurrent_writers_do_not_lose_updates_to_distinct_keys() {
    let engine = open("concurrency");
    let n_threads = 4;
    let per_thread = 250;

    let handles: Vec<_> = (0..n_threads)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..per_thread {
                    let key = format!("t{t}-k{i}").into_bytes();
                    let value = format!("t{t}-v{i}").into_bytes();
                    engine.setnx(&key, &value).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..n_threads {
        for i in 0..per_thread {
            let key = format!("t{t}-k{i}").into_bytes();
            let want = format!("t{t}-v{i}").into_bytes();
            assert_eq!(engine.get(&key).unwrap(), want);
        }
    }
}

#[test]
fn randomized_set_get_delete_matches_a_hashmap_model() {
    let engine = open("randomized-model");
    let mut rng = StdRng::seed_from_u64(RAND_SEED);
    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let universe = 200;

    for _ in 0..4000 {
        let k = format!("k{}", rng.gen_range(0..universe)).into_bytes();
        match rng.gen_range(0..3) {
            0 => {
                let v = format!("v{}", rng.gen::<u32>()).into_bytes();
                engine.set(&k, &v).unwrap();
                model.insert(k, v);
            }
            1 => {
                let result = engine.delete(&k);
                match model.remove(&k) {
                    Some(_) => assert!(result.is_ok()),
                    None => assert!(matches!(result, Err(Error::NotFound) | Err(Error::Dead))),
                }
            }
            _ => match model.get(&k) {
                Some(v) => assert_eq!(&engine.get(&k).unwrap(), v),
                None => assert!(matches!(engine.get(&k), Err(Error::NotFound))),
            },
        }
    }

    for (k, v) in &model {
        assert_eq!(&engine.get(k).unwrap(), v);
    }
}

#[test]
fn key_and_value_size_limits_are_enforced() {
    let engine = open("size-limits");
    assert!(matches!(engine.setnx(b"", b"v"), Err(Error::KeyEmpty)));
    assert!(matches!(engine.setnx(b"k", b""), Err(Error::ValueEmpty)));
    let huge_key = vec![0u8; 2048];
    assert!(matches!(engine.setnx(&huge_key, b"v"), Err(Error::KeyTooLarge)));
}
