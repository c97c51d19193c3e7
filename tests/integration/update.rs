#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::{tempdir, TempDir};
use vega_store::batch::decode_log_modify;
use vega_store::part::{
    sync_append_batch, sync_multi_put, sync_multi_remove, sync_remove_range,
};
use vega_store::{
    keys, BatchHolder, EdgeRank, EdgeType, EngineOptions, Expr, FieldDef, HostAddr, IndexDef,
    IndexId, IndexState, IndexStateRegistry, IndexTarget, KvEngine, LocalReplication, LockKey,
    MemoryLockTable, PartDirectory, PartId, PropType, Replication, Result, RocksEngine, Role,
    RowReader, Schema, SchemaRegistry, SpaceId, StoreError, TagId, UpdateExecutor,
    UpdateRequest, UpdateTarget, UpdatedProp, Value, VertexId,
};

const SPACE: SpaceId = SpaceId(1);
const PART: PartId = PartId(7);
const TAG: TagId = TagId(3);
const EDGE: EdgeType = EdgeType(9);
const AGE_INDEX: IndexId = IndexId(5);

struct Harness {
    _dir: TempDir,
    engine: Arc<dyn KvEngine>,
    directory: Arc<PartDirectory>,
    locks: Arc<MemoryLockTable>,
    index_states: Arc<IndexStateRegistry>,
    schemas: Arc<SchemaRegistry>,
    replication: Arc<LocalReplication>,
    executor: UpdateExecutor,
}

fn person_schema() -> Schema {
    Schema::new(vec![
        FieldDef::new("name", PropType::Str).default(Value::Str(String::new())),
        FieldDef::new("age", PropType::Int).default(Value::Int(18)),
        FieldDef::new("score", PropType::Int).nullable(),
    ])
}

fn harness() -> Result<Harness> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = tempdir()?;
    let engine: Arc<dyn KvEngine> =
        Arc::new(RocksEngine::open(SPACE, dir.path(), &EngineOptions::new())?);

    let directory = Arc::new(PartDirectory::new());
    directory.add_part(SPACE, PART, Arc::clone(&engine), Role::Leader, None)?;

    let schemas = Arc::new(SchemaRegistry::new());
    schemas.register_tag(TAG, person_schema());
    schemas.register_edge(
        EDGE,
        Schema::new(vec![FieldDef::new("weight", PropType::Int).default(Value::Int(0))]),
    );

    let locks = Arc::new(MemoryLockTable::new());
    let index_states = Arc::new(IndexStateRegistry::new());
    let replication = Arc::new(LocalReplication::new(Arc::clone(&directory)));
    let executor = UpdateExecutor::new(
        Arc::clone(&locks),
        Arc::clone(&replication) as Arc<dyn Replication>,
        Arc::clone(&directory),
        Arc::clone(&index_states),
        Arc::clone(&schemas),
        vec![IndexDef {
            index_id: AGE_INDEX,
            target: IndexTarget::Tag(TAG),
            fields: vec!["age".into()],
        }],
    );

    Ok(Harness {
        _dir: dir,
        engine,
        directory,
        locks,
        index_states,
        schemas,
        replication,
        executor,
    })
}

fn vertex(vid: u64) -> UpdateTarget {
    UpdateTarget::Vertex {
        part: PART,
        vid: VertexId(vid),
        tag: TAG,
    }
}

fn set_int(name: &str, v: i64) -> UpdatedProp {
    UpdatedProp {
        name: name.into(),
        expr: Expr::Const(Value::Int(v)).encode(),
    }
}

fn add_prop(name: &str, prop: &str, v: i64) -> UpdatedProp {
    UpdatedProp {
        name: name.into(),
        expr: Expr::Add(
            Box::new(Expr::Prop(prop.into())),
            Box::new(Expr::Const(Value::Int(v))),
        )
        .encode(),
    }
}

fn upsert_age(vid: u64, age: i64) -> UpdateRequest {
    UpdateRequest {
        space: SPACE,
        target: vertex(vid),
        updated_props: vec![set_int("age", age)],
        insertable: true,
        condition: None,
    }
}

fn index_entries(h: &Harness) -> Result<Vec<Vec<u8>>> {
    let mut found = Vec::new();
    let mut iter = h.engine.prefix(&keys::index_prefix(PART, AGE_INDEX))?;
    while iter.valid() {
        found.push(iter.key().to_vec());
        iter.next();
    }
    Ok(found)
}

fn age_index_key(h: &Harness, age: i64, vid: u64) -> Vec<u8> {
    let schema = h.schemas.tag(TAG).unwrap();
    let mut props = std::collections::HashMap::new();
    props.insert("age".to_string(), Value::Int(age));
    let values =
        vega_store::index::collect_index_values(&schema, &["age".into()], &props).unwrap();
    keys::vertex_index_key(PART, AGE_INDEX, &values, VertexId(vid))
}

fn newest_record_key(h: &Harness, vid: u64) -> Result<Vec<u8>> {
    let iter = h
        .engine
        .prefix(&keys::vertex_prefix(PART, VertexId(vid), TAG))?;
    assert!(iter.valid(), "record should exist");
    Ok(iter.key().to_vec())
}

fn stored_age(h: &Harness, vid: u64) -> Result<Value> {
    let schema = h.schemas.tag(TAG).unwrap();
    let iter = h
        .engine
        .prefix(&keys::vertex_prefix(PART, VertexId(vid), TAG))?;
    assert!(iter.valid(), "record should exist");
    let reader = RowReader::decode(schema, iter.val())?;
    reader.get("age")
}

#[test]
fn insertable_update_creates_record_with_defaults() -> Result<()> {
    let h = harness()?;
    let resp = h.executor.execute(&upsert_age(1, 20))?;
    assert!(resp.inserted);
    assert_eq!(resp.props["age"], Value::Int(20));
    assert_eq!(resp.props["name"], Value::Str(String::new()));
    assert_eq!(resp.props["score"], Value::Null);

    assert_eq!(stored_age(&h, 1)?, Value::Int(20));
    assert_eq!(index_entries(&h)?, vec![age_index_key(&h, 20, 1)]);
    Ok(())
}

#[test]
fn update_moves_the_index_entry() -> Result<()> {
    let h = harness()?;
    h.executor.execute(&upsert_age(1, 20))?;
    let key_before = newest_record_key(&h, 1)?;

    let resp = h.executor.execute(&UpdateRequest {
        space: SPACE,
        target: vertex(1),
        updated_props: vec![add_prop("age", "age", 1)],
        insertable: false,
        condition: None,
    })?;
    assert!(!resp.inserted);
    assert_eq!(resp.props["age"], Value::Int(21));

    assert_eq!(stored_age(&h, 1)?, Value::Int(21));
    assert_eq!(
        index_entries(&h)?,
        vec![age_index_key(&h, 21, 1)],
        "old index entry removed, new one written"
    );

    let key_after = newest_record_key(&h, 1)?;
    assert_eq!(
        keys::version_of(&key_after)?,
        keys::version_of(&key_before)?,
        "updating an existing record reuses its stored version"
    );
    Ok(())
}

#[test]
fn missing_record_without_insertable_is_not_found() -> Result<()> {
    let h = harness()?;
    let result = h.executor.execute(&UpdateRequest {
        space: SPACE,
        target: vertex(404),
        updated_props: vec![set_int("age", 1)],
        insertable: false,
        condition: None,
    });
    assert!(matches!(result, Err(StoreError::KeyNotFound)));
    Ok(())
}

#[test]
fn failed_condition_is_filter_not_passed() -> Result<()> {
    let h = harness()?;
    h.executor.execute(&upsert_age(1, 20))?;

    let over_90 = Expr::Gt(
        Box::new(Expr::Prop("age".into())),
        Box::new(Expr::Const(Value::Int(90))),
    )
    .encode();
    let result = h.executor.execute(&UpdateRequest {
        space: SPACE,
        target: vertex(1),
        updated_props: vec![set_int("age", 99)],
        insertable: false,
        condition: Some(over_90.clone()),
    });
    assert!(matches!(result, Err(StoreError::FilterNotPassed)));
    assert_eq!(stored_age(&h, 1)?, Value::Int(20), "record unchanged");

    // with insertable set, the failed condition falls through to insert
    let resp = h.executor.execute(&UpdateRequest {
        space: SPACE,
        target: vertex(1),
        updated_props: vec![set_int("age", 99)],
        insertable: true,
        condition: Some(over_90),
    })?;
    assert!(resp.inserted);
    assert_eq!(stored_age(&h, 1)?, Value::Int(99));
    Ok(())
}

#[test]
fn assignments_observe_earlier_assignments() -> Result<()> {
    let h = harness()?;
    h.executor.execute(&upsert_age(1, 20))?;

    let resp = h.executor.execute(&UpdateRequest {
        space: SPACE,
        target: vertex(1),
        updated_props: vec![
            add_prop("age", "age", 1),
            UpdatedProp {
                name: "score".into(),
                expr: Expr::Mul(
                    Box::new(Expr::Prop("age".into())),
                    Box::new(Expr::Const(Value::Int(2))),
                )
                .encode(),
            },
        ],
        insertable: false,
        condition: None,
    })?;
    assert_eq!(resp.props["age"], Value::Int(21));
    assert_eq!(
        resp.props["score"],
        Value::Int(42),
        "second assignment sees the first one's result"
    );
    Ok(())
}

#[test]
fn insert_fails_without_default_for_non_nullable_field() -> Result<()> {
    let h = harness()?;
    let strict = TagId(99);
    h.schemas.register_tag(
        strict,
        Schema::new(vec![FieldDef::new("required", PropType::Str)]),
    );

    let result = h.executor.execute(&UpdateRequest {
        space: SPACE,
        target: UpdateTarget::Vertex {
            part: PART,
            vid: VertexId(1),
            tag: strict,
        },
        updated_props: vec![],
        insertable: true,
        condition: None,
    });
    match result {
        Err(StoreError::NoDefaultValueAndNotNullable { field }) => {
            assert_eq!(field, "required");
        }
        other => panic!("expected NoDefaultValueAndNotNullable, got {other:?}"),
    }
    Ok(())
}

#[test]
fn held_lock_fails_fast_as_concurrent_modification() -> Result<()> {
    let h = harness()?;
    h.executor.execute(&upsert_age(1, 20))?;

    let _held = h
        .locks
        .acquire(vec![LockKey::VertexTag {
            space: SPACE,
            part: PART,
            tag: TAG,
            vid: VertexId(1),
        }])
        .unwrap();

    let result = h.executor.execute(&upsert_age(1, 30));
    assert!(matches!(result, Err(StoreError::ConcurrentModification(_))));
    assert_eq!(stored_age(&h, 1)?, Value::Int(20));
    Ok(())
}

#[test]
fn rebuilding_index_defers_mutations_to_the_operation_log() -> Result<()> {
    let h = harness()?;
    h.executor.execute(&upsert_age(1, 20))?;
    h.index_states
        .set_state(SPACE, PART, AGE_INDEX, IndexState::Rebuilding);

    h.executor.execute(&UpdateRequest {
        space: SPACE,
        target: vertex(1),
        updated_props: vec![set_int("age", 21)],
        insertable: false,
        condition: None,
    })?;
    assert_eq!(stored_age(&h, 1)?, Value::Int(21), "record still updates");

    // index untouched: the stale entry stays until replay, no new entry
    assert_eq!(index_entries(&h)?, vec![age_index_key(&h, 20, 1)]);

    let mut deletes = Vec::new();
    let mut modifies = Vec::new();
    let mut iter = h.engine.prefix(&keys::operation_prefix(PART))?;
    while iter.valid() {
        if keys::is_delete_op(iter.key()) {
            deletes.push(iter.val().to_vec());
        } else if keys::is_modify_op(iter.key()) {
            modifies.push(iter.val().to_vec());
        }
        iter.next();
    }
    assert_eq!(deletes, vec![age_index_key(&h, 20, 1)]);
    assert_eq!(modifies.len(), 1);
    let (new_index_key, new_index_value) = decode_log_modify(&modifies[0])?;
    assert_eq!(new_index_key, age_index_key(&h, 21, 1));
    assert!(new_index_value.is_empty());
    Ok(())
}

#[test]
fn locked_index_rejects_the_whole_update() -> Result<()> {
    let h = harness()?;
    h.executor.execute(&upsert_age(1, 20))?;
    h.index_states
        .set_state(SPACE, PART, AGE_INDEX, IndexState::Locked);

    let result = h.executor.execute(&UpdateRequest {
        space: SPACE,
        target: vertex(1),
        updated_props: vec![set_int("age", 21)],
        insertable: false,
        condition: None,
    });
    assert!(matches!(result, Err(StoreError::IndexLocked)));
    assert_eq!(stored_age(&h, 1)?, Value::Int(20), "nothing was written");
    assert_eq!(index_entries(&h)?, vec![age_index_key(&h, 20, 1)]);
    Ok(())
}

#[test]
fn non_leader_replica_redirects_to_the_leader() -> Result<()> {
    let h = harness()?;
    h.executor.execute(&upsert_age(1, 20))?;

    let leader = HostAddr::new("peer-1", 9779);
    h.directory
        .set_role(SPACE, PART, Role::Follower, Some(leader.clone()));

    match h.executor.execute(&upsert_age(1, 30)) {
        Err(StoreError::LeaderChanged { leader: Some(addr) }) => assert_eq!(addr, leader),
        other => panic!("expected LeaderChanged, got {other:?}"),
    }

    // leader-only reads reject too; stale reads are opt-in
    assert!(matches!(
        h.directory.read_engine(SPACE, PART, false),
        Err(StoreError::LeaderChanged { .. })
    ));
    assert!(h.directory.read_engine(SPACE, PART, true).is_ok());
    Ok(())
}

#[test]
fn unknown_partition_is_part_not_found() -> Result<()> {
    let h = harness()?;
    let result = h.executor.execute(&UpdateRequest {
        space: SPACE,
        target: UpdateTarget::Vertex {
            part: PartId(999),
            vid: VertexId(1),
            tag: TAG,
        },
        updated_props: vec![set_int("age", 1)],
        insertable: true,
        condition: None,
    });
    assert!(matches!(
        result,
        Err(StoreError::PartNotFound {
            part: PartId(999),
            ..
        })
    ));
    Ok(())
}

#[test]
fn replication_write_paths_round_trip() -> Result<()> {
    let h = harness()?;
    let repl: &LocalReplication = &h.replication;

    sync_multi_put(
        repl,
        SPACE,
        PART,
        vec![
            (b"r_1".to_vec(), b"1".to_vec()),
            (b"r_2".to_vec(), b"2".to_vec()),
            (b"r_3".to_vec(), b"3".to_vec()),
        ],
    )?;
    assert_eq!(h.engine.get(b"r_2")?, b"2");

    sync_multi_remove(repl, SPACE, PART, vec![b"r_1".to_vec()])?;
    assert!(matches!(h.engine.get(b"r_1"), Err(StoreError::KeyNotFound)));

    sync_remove_range(repl, SPACE, PART, b"r_2".to_vec(), b"r_3".to_vec())?;
    assert!(matches!(h.engine.get(b"r_2"), Err(StoreError::KeyNotFound)));
    assert_eq!(h.engine.get(b"r_3")?, b"3", "range end is exclusive");

    let mut holder = BatchHolder::new();
    holder.put(b"r_9".to_vec(), b"v".to_vec());
    holder.remove(b"r_3".to_vec());
    sync_append_batch(repl, SPACE, PART, holder.encode())?;
    assert_eq!(h.engine.get(b"r_9")?, b"v");
    assert!(matches!(h.engine.get(b"r_3"), Err(StoreError::KeyNotFound)));

    // a batch that fails to decode applies nothing
    assert!(matches!(
        sync_append_batch(repl, SPACE, PART, b"garbage".to_vec()),
        Err(StoreError::InvalidData(_))
    ));
    assert_eq!(h.engine.get(b"r_9")?, b"v");
    Ok(())
}

#[test]
fn completion_callback_fires_exactly_once() -> Result<()> {
    let h = harness()?;

    let successes = AtomicUsize::new(0);
    h.replication.async_multi_put(
        SPACE,
        PART,
        vec![(b"cb_1".to_vec(), b"v".to_vec())],
        Box::new(|res| {
            res.unwrap();
            successes.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert_eq!(successes.load(Ordering::SeqCst), 1);

    // the callback fires exactly once on the failure path too
    let failures = AtomicUsize::new(0);
    h.replication.async_multi_put(
        SPACE,
        PartId(999),
        vec![(b"cb_2".to_vec(), b"v".to_vec())],
        Box::new(|res| {
            assert!(matches!(res, Err(StoreError::PartNotFound { .. })));
            failures.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn non_leader_append_batch_is_rejected() -> Result<()> {
    let h = harness()?;
    let leader = HostAddr::new("peer-1", 9779);
    h.directory
        .set_role(SPACE, PART, Role::Follower, Some(leader.clone()));

    let mut holder = BatchHolder::new();
    holder.put(b"nl".to_vec(), b"v".to_vec());
    match sync_append_batch(h.replication.as_ref(), SPACE, PART, holder.encode()) {
        Err(StoreError::LeaderChanged { leader: Some(addr) }) => assert_eq!(addr, leader),
        other => panic!("expected LeaderChanged, got {other:?}"),
    }
    assert!(
        matches!(h.engine.get(b"nl"), Err(StoreError::KeyNotFound)),
        "rejected append must not reach the engine"
    );
    Ok(())
}

#[test]
fn edge_update_sees_endpoint_pseudo_props() -> Result<()> {
    let h = harness()?;
    let target = UpdateTarget::Edge {
        part: PART,
        src: VertexId(1),
        edge_type: EDGE,
        rank: EdgeRank(3),
        dst: VertexId(2),
    };

    let positive_rank = Expr::Gt(
        Box::new(Expr::Prop("_rank".into())),
        Box::new(Expr::Const(Value::Int(0))),
    )
    .encode();
    let resp = h.executor.execute(&UpdateRequest {
        space: SPACE,
        target: target.clone(),
        updated_props: vec![add_prop("weight", "weight", 5)],
        insertable: true,
        condition: None,
    })?;
    assert!(resp.inserted);
    assert_eq!(resp.props["weight"], Value::Int(5));
    assert!(
        !resp.props.contains_key("_rank"),
        "pseudo-props stay out of the response"
    );

    // the condition can address the edge key through pseudo-props
    let resp = h.executor.execute(&UpdateRequest {
        space: SPACE,
        target,
        updated_props: vec![add_prop("weight", "weight", 5)],
        insertable: false,
        condition: Some(positive_rank),
    })?;
    assert_eq!(resp.props["weight"], Value::Int(10));
    Ok(())
}
