//! Unified cursor traversal: merged enumeration over btree and
//! transaction views, in both directions, with erases masking keys
//! mid-scan.

use tempfile::TempDir;

use burrowdb::{
    CursorMove, DbConfig, DbId, EnvParams, Environment, Error, KeyLayout, TxnId,
};

fn create_env() -> (TempDir, Environment, DbId) {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(
        &dir.path().join("scan.db"),
        0,
        0o644,
        EnvParams::default(),
    )
    .unwrap();
    let db = env
        .create_db(
            1,
            DbConfig {
                key_layout: KeyLayout::Binary(8),
                ..DbConfig::default()
            },
        )
        .unwrap();
    (dir, env, db)
}

fn scan(env: &Environment, db: DbId, txn: Option<TxnId>, forward: bool) -> Vec<String> {
    let cursor = env.cursor_create(db, txn).unwrap();
    let (first, step) = if forward {
        (CursorMove::First, CursorMove::Next)
    } else {
        (CursorMove::Last, CursorMove::Previous)
    };
    let mut keys = Vec::new();
    let mut mv = first;
    loop {
        match env.cursor_move(cursor, mv) {
            Ok((key, _)) => {
                let end = key.iter().position(|b| *b == 0).unwrap_or(key.len());
                keys.push(String::from_utf8(key[..end].to_vec()).unwrap());
            }
            Err(Error::KeyNotFound) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
        mv = step;
    }
    env.cursor_close(cursor).unwrap();
    keys
}

#[test]
fn btree_only_scan_is_ordered() {
    let (_dir, env, db) = create_env();
    for key in ["d", "a", "c", "b"] {
        env.insert(db, None, key.as_bytes(), b"v", 0).unwrap();
    }

    assert_eq!(scan(&env, db, None, true), vec!["a", "b", "c", "d"]);
    assert_eq!(scan(&env, db, None, false), vec!["d", "c", "b", "a"]);
}

#[test]
fn txn_only_scan_is_ordered() {
    let (_dir, env, db) = create_env();
    let txn = env.begin(0).unwrap();
    for key in ["m", "k", "z", "p"] {
        env.insert(db, Some(txn), key.as_bytes(), b"v", 0).unwrap();
    }

    assert_eq!(scan(&env, db, Some(txn), true), vec!["k", "m", "p", "z"]);
    assert_eq!(scan(&env, db, Some(txn), false), vec!["z", "p", "m", "k"]);

    // outside the transaction the overlay is invisible
    assert!(scan(&env, db, None, true).is_empty());
    env.abort(txn).unwrap();
}

#[test]
fn mixed_scan_merges_both_sides_without_duplicates() {
    let (_dir, env, db) = create_env();
    for key in ["b", "d", "f"] {
        env.insert(db, None, key.as_bytes(), b"disk", 0).unwrap();
    }
    let txn = env.begin(0).unwrap();
    for key in ["a", "c", "e", "g"] {
        env.insert(db, Some(txn), key.as_bytes(), b"mem", 0).unwrap();
    }
    // "d" exists on both sides; the newer record must win exactly once
    env.insert(
        db,
        Some(txn),
        b"d",
        b"shadow",
        burrowdb::insert_flags::OVERWRITE,
    )
    .unwrap();

    assert_eq!(
        scan(&env, db, Some(txn), true),
        vec!["a", "b", "c", "d", "e", "f", "g"]
    );
    assert_eq!(
        scan(&env, db, Some(txn), false),
        vec!["g", "f", "e", "d", "c", "b", "a"]
    );

    let cursor = env.cursor_create(db, Some(txn)).unwrap();
    let (_, record) = env.cursor_find(cursor, b"d").unwrap();
    assert_eq!(record, b"shadow".to_vec());
    env.cursor_close(cursor).unwrap();
    env.abort(txn).unwrap();
}

#[test]
fn erased_keys_are_skipped_mid_scan() {
    let (_dir, env, db) = create_env();
    for key in ["a", "b", "c", "d", "e"] {
        env.insert(db, None, key.as_bytes(), b"v", 0).unwrap();
    }
    let txn = env.begin(0).unwrap();
    env.erase(db, Some(txn), b"b").unwrap();
    env.erase(db, Some(txn), b"d").unwrap();

    assert_eq!(scan(&env, db, Some(txn), true), vec!["a", "c", "e"]);
    assert_eq!(scan(&env, db, Some(txn), false), vec!["e", "c", "a"]);

    // the un-transacted view is untouched
    assert_eq!(scan(&env, db, None, true), vec!["a", "b", "c", "d", "e"]);
    env.abort(txn).unwrap();
}

#[test]
fn cursor_find_prefers_the_txn_layer() {
    let (_dir, env, db) = create_env();
    env.insert(db, None, b"k", b"disk", 0).unwrap();

    let txn = env.begin(0).unwrap();
    env.insert(db, Some(txn), b"k", b"mem", burrowdb::insert_flags::OVERWRITE)
        .unwrap();

    let cursor = env.cursor_create(db, Some(txn)).unwrap();
    let (_, record) = env.cursor_find(cursor, b"k").unwrap();
    assert_eq!(record, b"mem".to_vec());

    // an erase makes the same find report a missing key
    env.cursor_close(cursor).unwrap();
    env.erase(db, Some(txn), b"k").unwrap();
    let cursor = env.cursor_create(db, Some(txn)).unwrap();
    assert!(matches!(
        env.cursor_find(cursor, b"k"),
        Err(Error::KeyNotFound)
    ));
    env.cursor_close(cursor).unwrap();
    env.abort(txn).unwrap();
}

#[test]
fn cursor_insert_couples_to_the_new_entry() {
    let (_dir, env, db) = create_env();
    let txn = env.begin(0).unwrap();

    let cursor = env.cursor_create(db, Some(txn)).unwrap();
    env.cursor_insert(cursor, b"x", b"1", 0).unwrap();

    assert_eq!(env.cursor_record(cursor).unwrap(), b"1".to_vec());
    let key = env.cursor_key(cursor).unwrap();
    assert_eq!(&key[..1], b"x");

    env.cursor_close(cursor).unwrap();
    env.commit(txn).unwrap();

    // autocommitted cursor insert couples to the btree side
    let cursor = env.cursor_create(db, None).unwrap();
    env.cursor_insert(cursor, b"y", b"2", 0).unwrap();
    assert_eq!(env.cursor_record(cursor).unwrap(), b"2".to_vec());
    env.cursor_close(cursor).unwrap();
}

#[test]
fn cursor_erase_keeps_the_scan_position() {
    let (_dir, env, db) = create_env();
    for key in ["a", "b", "c"] {
        env.insert(db, None, key.as_bytes(), b"v", 0).unwrap();
    }

    let cursor = env.cursor_create(db, None).unwrap();
    env.cursor_move(cursor, CursorMove::First).unwrap();
    let (key, _) = env.cursor_move(cursor, CursorMove::Next).unwrap();
    assert_eq!(&key[..1], b"b");

    env.cursor_erase(cursor).unwrap();
    assert!(matches!(env.find(db, None, b"b", burrowdb::FindMode::Exact), Err(Error::KeyNotFound)));

    // the cursor continues from the erased key's position
    let (key, _) = env.cursor_move(cursor, CursorMove::Next).unwrap();
    assert_eq!(&key[..1], b"c");
    env.cursor_close(cursor).unwrap();
}

#[test]
fn cursor_erase_on_nil_cursor_fails() {
    let (_dir, env, db) = create_env();
    let cursor = env.cursor_create(db, None).unwrap();
    assert!(matches!(env.cursor_erase(cursor), Err(Error::CursorIsNil)));
    env.cursor_close(cursor).unwrap();
}

#[test]
fn moves_on_a_nil_cursor_report_nil() {
    let (_dir, env, db) = create_env();
    env.insert(db, None, b"a", b"v", 0).unwrap();
    let cursor = env.cursor_create(db, None).unwrap();

    assert!(matches!(
        env.cursor_move(cursor, CursorMove::Next),
        Err(Error::CursorIsNil)
    ));
    assert!(matches!(env.cursor_key(cursor), Err(Error::CursorIsNil)));
    env.cursor_close(cursor).unwrap();
}

#[test]
fn large_merged_scan_stays_sorted() {
    let (_dir, env, db) = create_env();
    for i in (0..400u32).step_by(2) {
        let key = format!("{i:06}");
        env.insert(db, None, key.as_bytes(), b"even", 0).unwrap();
    }
    let txn = env.begin(0).unwrap();
    for i in (1..400u32).step_by(2) {
        let key = format!("{i:06}");
        env.insert(db, Some(txn), key.as_bytes(), b"odd", 0).unwrap();
    }

    let keys = scan(&env, db, Some(txn), true);
    assert_eq!(keys.len(), 400);
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);

    env.commit(txn).unwrap();
    let keys_after = scan(&env, db, None, true);
    assert_eq!(keys, keys_after);
    env.check_integrity(db).unwrap();
}
