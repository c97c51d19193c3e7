#![allow(missing_docs)]

use std::sync::Arc;

use tempfile::tempdir;
use vega_store::{BatchOp, EngineOptions, KvEngine, Result, RocksEngine, SpaceId, StoreError};
use vega_store::types::PartId;

fn open(path: &std::path::Path) -> Result<RocksEngine> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    RocksEngine::open(SpaceId(1), path, &EngineOptions::new())
}

fn key(n: u32) -> Vec<u8> {
    format!("key_{n:02}").into_bytes()
}

#[test]
fn put_get_remove_single_key() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put(b"alpha", b"one")?;
    assert_eq!(engine.get(b"alpha")?, b"one");

    engine.put(b"alpha", b"two")?;
    assert_eq!(engine.get(b"alpha")?, b"two", "second put overwrites");

    engine.remove(b"alpha")?;
    assert!(matches!(engine.get(b"alpha"), Err(StoreError::KeyNotFound)));
    Ok(())
}

#[test]
fn multi_get_reports_status_per_key() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.multi_put(vec![
        (b"a".to_vec(), b"1".to_vec()),
        (b"c".to_vec(), b"3".to_vec()),
    ])?;

    let results = engine.multi_get(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap(), b"1");
    assert!(
        matches!(results[1], Err(StoreError::KeyNotFound)),
        "missing key fails its slot, not the whole call"
    );
    assert_eq!(results[2].as_ref().unwrap(), b"3");
    Ok(())
}

#[test]
fn range_is_half_open_and_exact() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    for n in 10..30 {
        engine.put(&key(n), &n.to_be_bytes())?;
    }

    let mut seen = Vec::new();
    let mut iter = engine.range(&key(15), &key(19))?;
    while iter.valid() {
        seen.push(iter.key().to_vec());
        iter.next();
    }
    assert_eq!(seen, vec![key(15), key(16), key(17), key(18)]);
    Ok(())
}

#[test]
fn prefix_scan_covers_exactly_the_prefix() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    for n in 0..5 {
        engine.put(format!("a_{n}").as_bytes(), b"x")?;
        engine.put(format!("b_{n}").as_bytes(), b"y")?;
        engine.put(format!("c_{n}").as_bytes(), b"z")?;
    }

    let mut count = 0;
    let mut iter = engine.prefix(b"b_")?;
    while iter.valid() {
        assert!(iter.key().starts_with(b"b_"));
        assert_eq!(iter.val(), b"y");
        count += 1;
        iter.next();
    }
    assert_eq!(count, 5);
    Ok(())
}

#[test]
fn range_with_prefix_resumes_mid_prefix() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    for n in 1..=5 {
        engine.put(format!("b_{n}").as_bytes(), b"y")?;
    }
    engine.put(b"c_1", b"z")?;

    let mut seen = Vec::new();
    let mut iter = engine.range_with_prefix(b"b_3", b"b_")?;
    while iter.valid() {
        seen.push(iter.key().to_vec());
        iter.next();
    }
    assert_eq!(
        seen,
        vec![b"b_3".to_vec(), b"b_4".to_vec(), b"b_5".to_vec()],
        "resume starts at the cursor and stops at the prefix end"
    );
    Ok(())
}

#[test]
fn remove_range_deletes_only_the_range() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    for n in 0..100 {
        engine.put(&key(n), b"v")?;
    }
    engine.remove_range(&key(0), &key(50))?;

    for n in 0..50 {
        assert!(
            matches!(engine.get(&key(n)), Err(StoreError::KeyNotFound)),
            "key_{n:02} should be gone"
        );
    }
    for n in 50..100 {
        assert_eq!(engine.get(&key(n))?, b"v");
    }
    Ok(())
}

#[test]
fn iterators_are_point_in_time() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.put(b"s_1", b"v")?;
    engine.put(b"s_2", b"v")?;

    let mut iter = engine.prefix(b"s_")?;
    engine.put(b"s_3", b"v")?;

    let mut seen = 0;
    while iter.valid() {
        seen += 1;
        iter.next();
    }
    drop(iter);
    assert_eq!(seen, 2, "write after iterator creation is invisible to it");

    let mut iter = engine.prefix(b"s_")?;
    let mut seen = 0;
    while iter.valid() {
        seen += 1;
        iter.next();
    }
    assert_eq!(seen, 3);
    Ok(())
}

// A hard process kill is not simulated here (the database lock outlives a
// leaked handle within one process). Committing with sync forces the WAL
// to disk, so the reopen below exercises the same replay path crash
// recovery takes for a fully committed batch.
#[test]
fn synced_batch_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path())?;
        engine.commit_batch(
            vec![
                BatchOp::Put {
                    key: b"k1".to_vec(),
                    value: b"v1".to_vec(),
                },
                BatchOp::Put {
                    key: b"k2".to_vec(),
                    value: b"v2".to_vec(),
                },
                BatchOp::Remove {
                    key: b"absent".to_vec(),
                },
            ],
            false,
            true,
        )?;
    }
    let engine = open(dir.path())?;
    assert_eq!(engine.get(b"k1")?, b"v1");
    assert_eq!(engine.get(b"k2")?, b"v2");
    Ok(())
}

#[test]
fn sync_without_wal_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let result = engine.commit_batch(
        vec![BatchOp::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        }],
        true,
        true,
    );
    assert!(matches!(result, Err(StoreError::InvalidParameter(_))));
    Ok(())
}

#[test]
fn option_setters_distinguish_unknown_key_from_bad_value() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.set_option("disable_auto_compactions", "true")?;
    engine.set_option("write_buffer_size", "1048576")?;

    let unknown = engine.set_option("no_such_option", "1").unwrap_err();
    match unknown {
        StoreError::InvalidParameter(msg) => assert!(msg.contains("unknown option key")),
        other => panic!("expected InvalidParameter, got {other:?}"),
    }

    let malformed = engine
        .set_option("write_buffer_size", "not-a-number")
        .unwrap_err();
    match malformed {
        StoreError::InvalidParameter(msg) => assert!(msg.contains("malformed value")),
        other => panic!("expected InvalidParameter, got {other:?}"),
    }

    // db-level options apply at runtime and share the validation split
    engine.set_db_option("max_compaction_bytes", "1073741824")?;
    engine.set_db_option("soft_pending_compaction_bytes_limit", "68719476736")?;

    assert!(matches!(
        engine.set_db_option("no_such_option", "1"),
        Err(StoreError::InvalidParameter(_))
    ));
    assert!(matches!(
        engine.set_db_option("max_compaction_bytes", "many"),
        Err(StoreError::InvalidParameter(_))
    ));
    Ok(())
}

#[test]
fn backup_table_exports_and_ingests() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(&dir.path().join("source"))?;
    for n in 0..10 {
        engine.put(format!("t_{n}").as_bytes(), format!("v{n}").as_bytes())?;
    }
    engine.put(b"u_0", b"other")?;

    // keep only the even-numbered keys
    let even = |key: &[u8]| (key[key.len() - 1] - b'0') % 2 == 0;
    let backup_dir = dir.path().join("backup");
    let file = engine.backup_table(&backup_dir, b"t_", Some(&even))?;
    assert!(file.exists());

    let restored = open(&dir.path().join("restored"))?;
    restored.ingest(&[file], true)?;
    for n in 0..10 {
        let got = restored.get(format!("t_{n}").as_bytes());
        if n % 2 == 0 {
            assert_eq!(got?, format!("v{n}").into_bytes());
        } else {
            assert!(matches!(got, Err(StoreError::KeyNotFound)));
        }
    }
    assert!(
        matches!(restored.get(b"u_0"), Err(StoreError::KeyNotFound)),
        "keys outside the prefix are not exported"
    );
    Ok(())
}

#[test]
fn backup_table_with_no_matches_fails_and_leaves_nothing() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(&dir.path().join("source"))?;
    engine.put(b"a_1", b"v")?;
    let backup_dir = dir.path().join("backup");
    let result = engine.backup_table(&backup_dir, b"zz_", None);
    assert!(matches!(result, Err(StoreError::KeyNotFound)));
    assert_eq!(
        std::fs::read_dir(&backup_dir)?.count(),
        0,
        "failed export must not leave a partial file behind"
    );
    Ok(())
}

#[test]
fn checkpoint_is_a_consistent_openable_copy() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(&dir.path().join("db"))?;
    engine.put(b"k1", b"v1")?;
    engine.flush()?;

    let cp_path = engine.create_checkpoint("snap-1")?;
    engine.put(b"k2", b"v2")?;

    assert!(matches!(
        engine.create_checkpoint("snap-1"),
        Err(StoreError::InvalidParameter(_))
    ));
    drop(engine);

    let snapshot = open(&cp_path)?;
    assert_eq!(snapshot.get(b"k1")?, b"v1");
    assert!(
        matches!(snapshot.get(b"k2"), Err(StoreError::KeyNotFound)),
        "write after checkpoint is not in the checkpoint"
    );
    Ok(())
}

#[test]
fn live_partitions_persist_across_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path())?;
        engine.add_part(PartId(1))?;
        engine.add_part(PartId(2))?;
        engine.add_part(PartId(3))?;
        engine.flush()?;
    }
    let engine = open(dir.path())?;
    assert_eq!(
        engine.all_parts()?,
        vec![PartId(1), PartId(2), PartId(3)],
        "markers come back sorted by part id"
    );
    assert_eq!(engine.total_parts_num()?, 3);

    engine.remove_part(PartId(2))?;
    assert_eq!(engine.all_parts()?, vec![PartId(1), PartId(3)]);
    Ok(())
}

#[test]
fn engine_works_behind_the_trait_object() -> Result<()> {
    let dir = tempdir()?;
    let engine: Arc<dyn KvEngine> = Arc::new(open(dir.path())?);
    engine.put(b"k", b"v")?;
    assert_eq!(engine.get(b"k")?, b"v");
    assert_eq!(engine.space(), SpaceId(1));
    assert_eq!(engine.data_root(), dir.path());
    engine.compact()?;
    Ok(())
}
