//! Database lifecycle: history eviction, forward moves, rewind, reopen,
//! compaction pressure, auto-expiration, and concurrent read-only access.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use triedb::{Db, DbConfig, DbError, MerkleMachine, Nibbles, StateMachine, Update};

const HISTORY: usize = 8;

fn init_logs() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn machine() -> Box<dyn StateMachine> {
    Box::new(MerkleMachine::new(64, false))
}

fn anon_db(history: usize) -> Db {
    Db::open(
        machine(),
        DbConfig {
            file_size: 1 << 24,
            chunk_size: 1 << 18,
            history_length: history,
            ..DbConfig::default()
        },
    )
    .expect("open")
}

fn file_config(dir: &TempDir, truncate: bool) -> DbConfig {
    DbConfig {
        paths: vec![dir.path().join("triedb.0"), dir.path().join("triedb.1")],
        truncate,
        file_size: 1 << 23,
        chunk_size: 1 << 18,
        history_length: HISTORY,
        ..DbConfig::default()
    }
}

fn key(i: u64) -> Nibbles {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&i.to_be_bytes());
    bytes[31] = (i % 251) as u8;
    Nibbles::from_bytes(&bytes)
}

fn val(i: u64) -> Bytes {
    Bytes::from(i.to_be_bytes().repeat(4))
}

#[test]
fn history_eviction() {
    init_logs();
    let db = anon_db(HISTORY);
    let h = HISTORY as u64;
    for v in 0..2 * h {
        db.upsert(vec![Update::put(key(v), val(v), v)], v)
            .expect("upsert");
    }
    assert_eq!(db.latest_version(), Some(2 * h - 1));
    assert_eq!(db.earliest_version(), Some(h));

    // a version below the window is gone
    assert!(matches!(
        db.get(key(0), 0),
        Err(DbError::VersionNoLongerExist(0))
    ));
    // a version inside the window still serves all its keys
    assert_eq!(db.get(key(0), h + 1).expect("get"), val(0));
    assert_eq!(db.get(key(h + 1), h + 1).expect("get"), val(h + 1));
}

#[test]
fn history_bound_invariant() {
    let db = anon_db(HISTORY);
    for v in 0..40u64 {
        db.upsert(vec![Update::put(key(v), val(v), v)], v)
            .expect("upsert");
        let (latest, earliest) = (
            db.latest_version().expect("latest"),
            db.earliest_version().expect("earliest"),
        );
        assert!(latest - earliest < HISTORY as u64);
    }
}

#[test]
fn move_version_forward_creates_gap() {
    let db = anon_db(32);
    for v in 0..=10u64 {
        db.upsert(vec![Update::put(key(v), val(v), v)], v)
            .expect("upsert");
    }
    let src_root = db.root_hash(10).expect("root");
    let dst = 10 + 16;
    db.move_trie_version_forward(10, dst).expect("move");

    assert_eq!(db.root_hash(dst).expect("root"), src_root);
    for v in 11..dst {
        assert!(
            matches!(db.get(key(0), v), Err(DbError::VersionNoLongerExist(_))),
            "version {v} should sit in the gap"
        );
    }
    // versions at and below the source survive inside the window
    assert_eq!(db.get(key(3), 10).expect("get"), val(3));
    assert_eq!(db.get(key(3), 3).expect("get"), val(3));

    // writing into the gap is rejected as input error
    assert!(matches!(
        db.upsert(vec![Update::put(key(99), val(99), 12)], 12),
        Err(DbError::InvalidInput(_))
    ));
}

#[test]
fn rewind_restores_roots() {
    let db = anon_db(HISTORY);
    for v in 0..4u64 {
        db.upsert(vec![Update::put(key(v), val(v), v)], v)
            .expect("upsert");
    }
    let root_at_1 = db.root_hash(1).expect("root");
    db.rewind_to_version(1).expect("rewind");
    assert_eq!(db.latest_version(), Some(1));
    assert_eq!(db.root_hash(1).expect("root"), root_at_1);
    assert!(matches!(
        db.root_hash(3),
        Err(DbError::VersionNoLongerExist(3))
    ));

    // history resumes cleanly after the rewind
    db.upsert(vec![Update::put(key(50), val(50), 2)], 2)
        .expect("upsert");
    assert_eq!(db.get(key(50), 2).expect("get"), val(50));
    assert_eq!(db.get(key(0), 2).expect("get"), val(0));
    assert!(matches!(db.get(key(3), 2), Err(DbError::KeyNotFound)));
}

#[test]
fn reopen_preserves_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root;
    {
        let db = Db::open(machine(), file_config(&dir, true)).expect("create");
        for v in 0..5u64 {
            db.upsert(vec![Update::put(key(v), val(v), v)], v)
                .expect("upsert");
        }
        db.update_finalized_version(4).expect("finalize");
        root = db.root_hash(4).expect("root");
    }

    let db = Db::open(machine(), file_config(&dir, false)).expect("reopen");
    assert_eq!(db.latest_version(), Some(4));
    assert_eq!(db.latest_finalized_version(), Some(4));
    assert_eq!(db.root_hash(4).expect("root"), root);
    for v in 0..5u64 {
        assert_eq!(db.get(key(v), 4).expect("get"), val(v));
    }
}

#[test]
fn reopen_with_wrong_geometry_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        Db::open(machine(), file_config(&dir, true)).expect("create");
    }
    let mut config = file_config(&dir, false);
    config.file_size = 1 << 22;
    assert!(matches!(
        Db::open(machine(), config),
        Err(DbError::PoolSizeMismatch(_))
    ));
}

#[test]
fn read_only_handle_sees_published_roots() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Db::open(machine(), file_config(&dir, true)).expect("create");
    for v in 0..3u64 {
        db.upsert(vec![Update::put(key(v), val(v), v)], v)
            .expect("upsert");
    }

    let ro = db.read_only().expect("ro clone");
    assert_eq!(ro.latest_version().expect("latest"), Some(2));
    assert_eq!(ro.get(&key(1), 2).expect("get"), val(1));
    assert_eq!(ro.get(&key(1), 1).expect("get"), val(1));
    assert!(matches!(
        ro.get(&key(1), 7),
        Err(DbError::VersionNoLongerExist(7))
    ));

    // new upserts become visible without reopening the read-only handle
    db.upsert(vec![Update::put(key(9), val(9), 3)], 3)
        .expect("upsert");
    assert_eq!(ro.get(&key(9), 3).expect("get"), val(9));
}

#[test]
fn concurrent_reads_never_see_garbage() {
    init_logs();
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Db::open(machine(), file_config(&dir, true)).expect("create");
    db.upsert(vec![Update::put(key(0), val(0), 0)], 0)
        .expect("upsert");

    let ro = Arc::new(db.read_only().expect("ro clone"));
    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let ro = ro.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut hits = 0u64;
            let mut evicted = 0u64;
            while !stop.load(Ordering::Relaxed) {
                match ro.get(&key(0), 0) {
                    Ok(v) => {
                        assert_eq!(v, val(0), "stale or corrupt value surfaced");
                        hits += 1;
                    }
                    Err(DbError::VersionNoLongerExist(0)) => evicted += 1,
                    Err(other) => panic!("unexpected read error: {other}"),
                }
            }
            (hits, evicted)
        })
    };

    // push version 0 out of the window while the reader hammers it
    for v in 1..(2 * HISTORY as u64) {
        db.upsert(vec![Update::put(key(v), val(v), v)], v)
            .expect("upsert");
    }
    stop.store(true, Ordering::Relaxed);
    let (hits, _evicted) = reader.join().expect("reader thread");
    assert!(hits > 0, "reader never observed the live version");
    // after eviction the outcome must be the error, not a wrong value
    assert!(matches!(
        ro.get(&key(0), 0),
        Err(DbError::VersionNoLongerExist(0))
    ));
}

#[test]
fn compaction_keeps_old_versions_readable() {
    // a pool small enough that sustained writes put the free list under
    // pressure and drag the compaction frontier forward
    let db = Db::open(
        machine(),
        DbConfig {
            file_size: 1 << 22,
            chunk_size: 1 << 16,
            history_length: 4,
            ..DbConfig::default()
        },
    )
    .expect("open");

    let mut rng = StdRng::seed_from_u64(7);
    for v in 0..200u64 {
        let updates = (0..16)
            .map(|_| {
                let k: u64 = rng.gen_range(0..512);
                Update::put(key(k), val(k.wrapping_mul(v + 1)), v)
            })
            .collect();
        db.upsert(updates, v).expect("upsert");

        // every version still in the window answers consistently
        let earliest = db.earliest_version().expect("earliest");
        let root = db.root_hash(earliest).expect("old root must stay readable");
        assert_ne!(root, Default::default());
    }
}

#[test]
fn auto_expiration_drops_stale_keys() {
    let window = 4u64;
    let db = Db::open(
        Box::new(MerkleMachine::new(64, true)),
        DbConfig {
            file_size: 1 << 24,
            chunk_size: 1 << 18,
            history_length: 32,
            auto_expire_window: Some(window),
            ..DbConfig::default()
        },
    )
    .expect("open");

    // written once, never touched again
    db.upsert(vec![Update::put(key(1000), val(1000), 0)], 0)
        .expect("upsert");
    // churn on unrelated keys pushes the expiry frontier past version 0
    for v in 1..20u64 {
        db.upsert(vec![Update::put(key(v), val(v), v)], v)
            .expect("upsert");
    }

    let latest = db.latest_version().expect("latest");
    assert!(matches!(
        db.get(key(1000), latest),
        Err(DbError::KeyNotFound)
    ));
    // keys written within the window survive
    assert_eq!(db.get(key(19), latest).expect("get"), val(19));
    assert_eq!(db.get(key(16), latest).expect("get"), val(16));
}

#[test]
fn copy_trie_duplicates_subtries() {
    let db = anon_db(32);
    let account = [0xab; 4];
    let mut storage_key = account.to_vec();
    storage_key.extend_from_slice(&[0x11, 0x22]);

    db.upsert(
        vec![
            Update::put(
                Nibbles::from_bytes(&account),
                Bytes::from_static(b"acct"),
                0,
            ),
            Update::put(
                Nibbles::from_bytes(&storage_key),
                Bytes::from_static(b"slot"),
                0,
            ),
        ],
        0,
    )
    .expect("upsert");

    // duplicate the account subtrie under a fresh prefix at version 1
    let dst_prefix = [0xcd; 4];
    db.copy_trie(
        0,
        Nibbles::from_bytes(&account),
        1,
        Nibbles::from_bytes(&dst_prefix),
        true,
    )
    .expect("copy");

    // not observable before a root-writing upsert on the dst version
    assert!(matches!(
        db.get(Nibbles::from_bytes(&dst_prefix), 1),
        Err(DbError::VersionNoLongerExist(1))
    ));

    db.upsert(
        vec![Update::put(key(77), val(77), 1)],
        1,
    )
    .expect("publishing upsert");

    let mut copied_storage = dst_prefix.to_vec();
    copied_storage.extend_from_slice(&[0x11, 0x22]);
    assert_eq!(
        db.get(Nibbles::from_bytes(&dst_prefix), 1).expect("get"),
        &b"acct"[..]
    );
    assert_eq!(
        db.get(Nibbles::from_bytes(&copied_storage), 1).expect("get"),
        &b"slot"[..]
    );
    // the destination trie started empty: only copied and new keys exist
    assert!(matches!(
        db.get(Nibbles::from_bytes(&storage_key), 1),
        Err(DbError::KeyNotFound)
    ));
    // and the source version is untouched
    assert_eq!(
        db.get(Nibbles::from_bytes(&storage_key), 0).expect("get"),
        &b"slot"[..]
    );
}

#[test]
fn random_round_trip_within_window() {
    let db = anon_db(16);
    let mut rng = StdRng::seed_from_u64(42);
    let mut model: std::collections::BTreeMap<u64, Option<u64>> = Default::default();

    for v in 0..16u64 {
        // draw per-batch ops keyed by k: duplicate keys within one batch
        // are a caller error, so the map keeps the last op per key
        let mut batch: std::collections::BTreeMap<u64, bool> = Default::default();
        for _ in 0..24 {
            let k: u64 = rng.gen_range(0..96);
            batch.insert(k, rng.gen_bool(0.2));
        }
        let mut updates = Vec::new();
        for (k, erase) in batch {
            if erase {
                model.insert(k, None);
                updates.push(Update::erase(key(k), v));
            } else {
                model.insert(k, Some(v));
                updates.push(Update::put(key(k), val(k ^ v), v));
            }
        }
        db.upsert(updates, v).expect("upsert");
    }

    let latest = db.latest_version().expect("latest");
    for (k, state) in &model {
        match state {
            Some(v) => {
                assert_eq!(
                    db.get(key(*k), latest).expect("get"),
                    val(*k ^ *v),
                    "key {k} written at {v}"
                );
            }
            None => assert!(matches!(
                db.get(key(*k), latest),
                Err(DbError::KeyNotFound)
            )),
        }
    }
}
