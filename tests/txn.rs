//! Transaction semantics: visibility between transactions, commit-order
//! flushing, abort, cursor refcounting, and the op-tree to btree
//! handover.

use tempfile::TempDir;

use burrowdb::{
    insert_flags, CursorMove, DbConfig, DbId, EnvParams, Environment, Error, FindMode, KeyLayout,
};

fn create_env() -> (TempDir, Environment, DbId) {
    let dir = tempfile::tempdir().unwrap();
    let env =
        Environment::create(&dir.path().join("txn.db"), 0, 0o644, EnvParams::default()).unwrap();
    let db = env
        .create_db(
            1,
            DbConfig {
                key_layout: KeyLayout::Binary(16),
                ..DbConfig::default()
            },
        )
        .unwrap();
    (dir, env, db)
}

fn get(env: &Environment, db: DbId, txn: Option<u64>, key: &[u8]) -> Option<Vec<u8>> {
    match env.find(db, txn, key, FindMode::Exact) {
        Ok((_, record)) => Some(record),
        Err(Error::KeyNotFound) => None,
        Err(err) => panic!("unexpected error: {err}"),
    }
}

#[test]
fn uncommitted_writes_are_private() {
    let (_dir, env, db) = create_env();

    let writer = env.begin(0).unwrap();
    env.insert(db, Some(writer), b"key", b"mine", 0).unwrap();

    // the writer sees its own op, nobody else does
    assert_eq!(get(&env, db, Some(writer), b"key"), Some(b"mine".to_vec()));
    assert_eq!(get(&env, db, None, b"key"), None);

    let other = env.begin(0).unwrap();
    assert_eq!(get(&env, db, Some(other), b"key"), None);

    env.commit(writer).unwrap();
    assert_eq!(get(&env, db, None, b"key"), Some(b"mine".to_vec()));
    assert_eq!(get(&env, db, Some(other), b"key"), Some(b"mine".to_vec()));
    env.abort(other).unwrap();
}

#[test]
fn aborted_writes_never_surface() {
    let (_dir, env, db) = create_env();
    env.insert(db, None, b"stable", b"v1", 0).unwrap();

    let txn = env.begin(0).unwrap();
    env.insert(db, Some(txn), b"temp", b"x", 0).unwrap();
    env.insert(db, Some(txn), b"stable", b"v2", insert_flags::OVERWRITE)
        .unwrap();
    env.abort(txn).unwrap();

    assert_eq!(get(&env, db, None, b"temp"), None);
    assert_eq!(get(&env, db, None, b"stable"), Some(b"v1".to_vec()));
    assert_eq!(env.key_count(db, None).unwrap(), 1);
}

#[test]
fn commit_with_open_cursor_is_rejected() {
    let (_dir, env, db) = create_env();

    let txn = env.begin(0).unwrap();
    let cursor = env.cursor_create(db, Some(txn)).unwrap();

    assert!(matches!(env.commit(txn), Err(Error::CursorStillOpen)));
    assert!(matches!(env.abort(txn), Err(Error::CursorStillOpen)));

    env.cursor_close(cursor).unwrap();
    env.commit(txn).unwrap();
}

#[test]
fn erase_inside_txn_shadows_committed_data() {
    let (_dir, env, db) = create_env();
    env.insert(db, None, b"doomed", b"v", 0).unwrap();

    let txn = env.begin(0).unwrap();
    env.erase(db, Some(txn), b"doomed").unwrap();

    assert_eq!(get(&env, db, Some(txn), b"doomed"), None);
    // still visible outside until the commit
    assert_eq!(get(&env, db, None, b"doomed"), Some(b"v".to_vec()));

    env.commit(txn).unwrap();
    assert_eq!(get(&env, db, None, b"doomed"), None);
}

#[test]
fn insert_then_erase_in_one_txn_is_a_no_op() {
    let (_dir, env, db) = create_env();

    let txn = env.begin(0).unwrap();
    env.insert(db, Some(txn), b"ghost", b"v", 0).unwrap();
    env.erase(db, Some(txn), b"ghost").unwrap();
    env.commit(txn).unwrap();

    assert_eq!(get(&env, db, None, b"ghost"), None);
    assert_eq!(env.key_count(db, None).unwrap(), 0);
}

#[test]
fn overwrite_chain_newest_wins() {
    let (_dir, env, db) = create_env();

    let txn = env.begin(0).unwrap();
    env.insert(db, Some(txn), b"k", b"v1", 0).unwrap();
    env.insert(db, Some(txn), b"k", b"v2", insert_flags::OVERWRITE)
        .unwrap();
    env.insert(db, Some(txn), b"k", b"v3", insert_flags::OVERWRITE)
        .unwrap();

    // ops do not coalesce; the newest visible one answers
    assert_eq!(get(&env, db, Some(txn), b"k"), Some(b"v3".to_vec()));
    env.commit(txn).unwrap();
    assert_eq!(get(&env, db, None, b"k"), Some(b"v3".to_vec()));
    assert_eq!(env.key_count(db, None).unwrap(), 1);
}

#[test]
fn flush_waits_for_the_oldest_active_txn() {
    let (_dir, env, db) = create_env();

    let blocker = env.begin(0).unwrap();
    let writer = env.begin(0).unwrap();
    env.insert(db, Some(writer), b"queued", b"v", 0).unwrap();
    env.commit(writer).unwrap();

    // committed behind an active head: visible to everyone already
    assert_eq!(get(&env, db, None, b"queued"), Some(b"v".to_vec()));

    // once the blocker finishes, the queue drains in id order and the
    // btree alone answers identically
    env.commit(blocker).unwrap();
    assert_eq!(get(&env, db, None, b"queued"), Some(b"v".to_vec()));
    env.check_integrity(db).unwrap();
}

#[test]
fn cursor_survives_the_flush_of_its_op() {
    let (_dir, env, db) = create_env();

    let blocker = env.begin(0).unwrap();
    let writer = env.begin(0).unwrap();
    env.insert(db, Some(writer), b"a", b"1", 0).unwrap();
    env.insert(db, Some(writer), b"b", b"2", 0).unwrap();
    env.commit(writer).unwrap();

    // a transactionless cursor couples to the committed-but-unflushed op
    let cursor = env.cursor_create(db, None).unwrap();
    let (key, record) = env.cursor_move(cursor, CursorMove::First).unwrap();
    assert_eq!(&key[..1], b"a");
    assert_eq!(record, b"1".to_vec());

    // draining the queue flushes the op out from under the cursor; the
    // key copy keeps the position alive
    env.commit(blocker).unwrap();
    assert!(matches!(
        env.cursor_record(cursor),
        Err(Error::Internal(_))
    ));

    let (key, record) = env.cursor_move(cursor, CursorMove::Next).unwrap();
    assert_eq!(&key[..1], b"b");
    assert_eq!(record, b"2".to_vec());
    env.cursor_close(cursor).unwrap();
}

#[test]
fn visibility_is_not_affected_by_other_active_txns() {
    let (_dir, env, db) = create_env();

    let a = env.begin(0).unwrap();
    let b = env.begin(0).unwrap();
    env.insert(db, Some(a), b"from-a", b"1", 0).unwrap();
    env.insert(db, Some(b), b"from-b", b"2", 0).unwrap();

    assert_eq!(get(&env, db, Some(a), b"from-b"), None);
    assert_eq!(get(&env, db, Some(b), b"from-a"), None);
    assert_eq!(env.key_count(db, Some(a)).unwrap(), 1);
    assert_eq!(env.key_count(db, Some(b)).unwrap(), 1);

    env.commit(a).unwrap();
    // a's write became visible to b at commit
    assert_eq!(get(&env, db, Some(b), b"from-a"), Some(b"1".to_vec()));
    env.commit(b).unwrap();
    assert_eq!(env.key_count(db, None).unwrap(), 2);
}

#[test]
fn read_only_txn_rejects_writes() {
    let (_dir, env, db) = create_env();
    let txn = env.begin(burrowdb::txn_flags::READ_ONLY).unwrap();

    assert!(env.insert(db, Some(txn), b"k", b"v", 0).is_err());
    assert!(env.erase(db, Some(txn), b"k").is_err());
    env.abort(txn).unwrap();
}

#[test]
fn flush_is_observationally_idempotent() {
    let (_dir, env, db) = create_env();

    let txn = env.begin(0).unwrap();
    for i in 0..200u32 {
        let key = format!("key-{i:04}");
        let val = format!("val-{i}");
        env.insert(db, Some(txn), key.as_bytes(), val.as_bytes(), 0)
            .unwrap();
    }
    let before = env.key_count(db, Some(txn)).unwrap();
    env.commit(txn).unwrap();

    // after the flush the composite view and the btree agree
    assert_eq!(env.key_count(db, None).unwrap(), before);
    for i in (0..200u32).step_by(17) {
        let key = format!("key-{i:04}");
        assert_eq!(
            get(&env, db, None, key.as_bytes()),
            Some(format!("val-{i}").into_bytes())
        );
    }
    env.check_integrity(db).unwrap();
}
