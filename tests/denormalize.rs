//! End-to-end scenarios over the in-memory stack: every input is a shared
//! memory log, the state store is in memory (except for the restart test,
//! which reopens a real on-disk store), and outputs are inspected through
//! their log handles.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::{json, Value};
use slog::o;

use braid::bytes::ByteKey;
use braid::record::{DenormalizedRecord, Record};
use braid::relation::Relation;
use braid::state::{MemoryState, RocksState};
use braid::topic::{
    InputTopic, Inputs, MemoryLog, MemoryOutputLog, MemoryOutputTopic, MemoryTopic, Outputs,
};
use braid::{Config, Engine};

const MEDIA_CAPTION: &str = r#"[{
    "DenormalizedName": "feed",
    "Entity": "media",
    "Children": [
        {"Entity": "caption", "JoinKey": "media_id", "ParentKey": "id"}
    ]
}]"#;

const MEDIA_CAPTION_CUE: &str = r#"[{
    "DenormalizedName": "feed",
    "Entity": "media",
    "Children": [
        {
            "Entity": "caption",
            "JoinKey": "media_id",
            "ParentKey": "id",
            "Children": [
                {"Entity": "cue", "JoinKey": "caption_id", "ParentKey": "id"}
            ]
        }
    ]
}]"#;

fn quiet() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}

struct Harness {
    engine: Engine<MemoryState>,
    logs: HashMap<String, MemoryLog>,
    outs: HashMap<String, MemoryOutputLog>,
    // live rows per entity, the reference evaluator's input
    truth: HashMap<String, BTreeMap<ByteKey, Record>>,
    relations: Vec<Relation>,
}

impl Harness {
    fn new(relations_json: &str, with_transactions: bool) -> Harness {
        Harness::with_config(relations_json, with_transactions, Config::default())
    }

    fn with_config(relations_json: &str, with_transactions: bool, config: Config) -> Harness {
        let relations: Vec<Relation> = serde_json::from_str(relations_json).unwrap();

        let mut entities: Vec<String> = Vec::new();
        for root in &relations {
            for entity in root.entities() {
                if !entities.iter().any(|e| e == entity) {
                    entities.push(entity.to_string());
                }
            }
        }
        if with_transactions {
            entities.push("transactions".to_string());
        }

        let mut logs = HashMap::new();
        let mut inputs: Inputs = Inputs::new();
        for entity in &entities {
            let log = MemoryLog::new();
            let topic: Box<dyn InputTopic> =
                Box::new(MemoryTopic::new(entity, log.clone()).unwrap());
            logs.insert(entity.clone(), log);
            inputs.insert(entity.clone(), topic);
        }

        let mut outs = HashMap::new();
        let mut outputs: Outputs = Outputs::new();
        for root in &relations {
            let name = root.denormalized_name();
            let out = MemoryOutputLog::new();
            outputs.insert(
                name.to_string(),
                Box::new(MemoryOutputTopic::new(name, out.clone())),
            );
            outs.insert(name.to_string(), out);
        }

        let engine = Engine::new(
            quiet(),
            config,
            relations.clone(),
            MemoryState::new(),
            inputs,
            outputs,
        )
        .unwrap();

        Harness {
            engine,
            logs,
            outs,
            truth: HashMap::new(),
            relations,
        }
    }

    fn push(&mut self, entity: &str, key: &str, value: Option<Value>, timestamp: i64) {
        self.logs[entity].push_json(key, value.clone(), timestamp);
        if entity != "transactions" {
            let table = self.truth.entry(entity.to_string()).or_default();
            match value {
                Some(value) => {
                    table.insert(ByteKey::from(key), Record::from(value));
                }
                None => {
                    table.remove(&ByteKey::from(key));
                }
            }
        }
    }

    fn drain(&mut self) {
        self.engine.drain().unwrap();
    }

    fn latest(&self, output: &str, key: &str) -> Option<DenormalizedRecord> {
        self.outs[output].latest(&ByteKey::from(key))
    }

    fn writes(&self, output: &str) -> u64 {
        self.outs[output].writes()
    }

    /// Computes the expected tree for a root PK from scratch, straight off
    /// the live rows.
    fn reference(&self, root: &Relation, pk: &ByteKey) -> Option<DenormalizedRecord> {
        self.reference_node(root, pk)
    }

    fn reference_node(&self, relation: &Relation, pk: &ByteKey) -> Option<DenormalizedRecord> {
        let record = self.truth.get(&relation.entity)?.get(pk)?.clone();
        if record.is_empty() {
            return None;
        }
        let mut denormalized = DenormalizedRecord {
            record: record.clone(),
            children: BTreeMap::new(),
        };
        for child in &relation.children {
            let parent_value = record
                .get(child.parent_key.as_deref().unwrap())
                .and_then(ByteKey::from_value);
            let parent_value = match parent_value {
                Some(value) => value,
                None => continue,
            };
            let mut records = Vec::new();
            if let Some(rows) = self.truth.get(&child.entity) {
                for (child_pk, row) in rows {
                    let join_value = row
                        .get(child.join_key.as_deref().unwrap())
                        .and_then(ByteKey::from_value);
                    if join_value.as_ref() == Some(&parent_value) {
                        if let Some(built) = self.reference_node(child, child_pk) {
                            records.push(built);
                        }
                    }
                }
            }
            denormalized.children.insert(child.entity.clone(), records);
        }
        Some(denormalized)
    }

    /// Asserts every live root PK's emitted tree equals the reference.
    fn assert_matches_reference(&self) {
        for root in self.relations.clone() {
            let name = root.denormalized_name();
            let pks: Vec<ByteKey> = self
                .truth
                .get(&root.entity)
                .map(|rows| rows.keys().cloned().collect())
                .unwrap_or_default();
            for pk in pks {
                let expected = self.reference(&root, &pk);
                let actual = self.outs[name].latest(&pk);
                assert_eq!(actual, expected, "root PK {:?} diverged", pk);
            }
        }
    }
}

fn de(record: Value, children: Vec<(&str, Vec<DenormalizedRecord>)>) -> DenormalizedRecord {
    DenormalizedRecord {
        record: Record::from(record),
        children: children
            .into_iter()
            .map(|(name, records)| (name.to_string(), records))
            .collect(),
    }
}

#[test]
fn single_table_root_insert() {
    let flat = r#"[{"DenormalizedName": "feed", "Entity": "media"}]"#;
    let mut h = Harness::new(flat, false);
    h.push("media", "m1", Some(json!({"id": "m1", "title": "A"})), 1);
    h.drain();

    assert_eq!(
        h.latest("feed", "m1"),
        Some(de(json!({"id": "m1", "title": "A"}), vec![]))
    );
}

#[test]
fn child_insert_after_parent() {
    let mut h = Harness::new(MEDIA_CAPTION, false);
    h.push("media", "m1", Some(json!({"id": "m1"})), 1);
    h.push("caption", "c1", Some(json!({"id": "c1", "media_id": "m1"})), 2);
    h.drain();

    assert_eq!(
        h.latest("feed", "m1"),
        Some(de(
            json!({"id": "m1"}),
            vec![(
                "caption",
                vec![de(json!({"id": "c1", "media_id": "m1"}), vec![])]
            )]
        ))
    );
}

#[test]
fn child_arrives_first() {
    let mut h = Harness::new(MEDIA_CAPTION, false);
    h.push("caption", "c1", Some(json!({"id": "c1", "media_id": "m1"})), 1);
    h.push("media", "m1", Some(json!({"id": "m1"})), 2);
    h.drain();

    // the join completes once the parent shows up
    assert_eq!(
        h.latest("feed", "m1"),
        Some(de(
            json!({"id": "m1"}),
            vec![(
                "caption",
                vec![de(json!({"id": "c1", "media_id": "m1"}), vec![])]
            )]
        ))
    );
}

#[test]
fn reparenting_updates_both_roots() {
    let mut h = Harness::new(MEDIA_CAPTION, false);
    h.push("media", "m1", Some(json!({"id": "m1"})), 1);
    h.push("caption", "c1", Some(json!({"id": "c1", "media_id": "m1"})), 2);
    h.drain();

    h.push("caption", "c1", Some(json!({"id": "c1", "media_id": "m2"})), 3);
    h.push("media", "m2", Some(json!({"id": "m2"})), 4);
    h.drain();

    assert_eq!(
        h.latest("feed", "m1"),
        Some(de(json!({"id": "m1"}), vec![("caption", vec![])]))
    );
    assert_eq!(
        h.latest("feed", "m2"),
        Some(de(
            json!({"id": "m2"}),
            vec![(
                "caption",
                vec![de(json!({"id": "c1", "media_id": "m2"}), vec![])]
            )]
        ))
    );
    h.assert_matches_reference();
}

#[test]
fn root_tombstone_scrubs_and_stays_dead() {
    let mut h = Harness::new(MEDIA_CAPTION, false);
    h.push("media", "m1", Some(json!({"id": "m1"})), 1);
    h.push("caption", "c1", Some(json!({"id": "c1", "media_id": "m1"})), 2);
    h.drain();
    let writes_before = h.writes("feed");

    h.push("media", "m1", None, 3);
    h.drain();
    // the tombstoned root produced no output record
    assert_eq!(h.writes("feed"), writes_before);

    // a later caption change pointing at the dead root must not resurrect it
    h.push(
        "caption",
        "c1",
        Some(json!({"id": "c1", "media_id": "m1", "text": "hi"})),
        4,
    );
    h.drain();
    assert_eq!(h.writes("feed"), writes_before);
    assert!(h.engine.verify_state().unwrap().is_empty());
}

#[test]
fn transactional_grouping_gates_emits_and_commits() {
    let mut h = Harness::new(MEDIA_CAPTION, true);
    h.push(
        "transactions",
        "tx1",
        Some(json!({"status": "BEGIN", "id": "tx1"})),
        10,
    );
    h.push(
        "media",
        "m1",
        Some(json!({"id": "m1", "transaction": {"id": "tx1", "total_order": 0}})),
        11,
    );
    h.push(
        "caption",
        "c1",
        Some(json!({
            "id": "c1", "media_id": "m1",
            "transaction": {"id": "tx1", "total_order": 1}
        })),
        12,
    );
    h.drain();

    // the transaction is open: no emit, no flush, no commit
    assert_eq!(h.writes("feed"), 0);
    let snapshot = h.engine.metrics().snapshot();
    assert_eq!(snapshot.state_commits, 0);
    assert_eq!(snapshot.backups_created, 0);

    // END declares one more media event than has arrived, so it defers
    h.push(
        "transactions",
        "tx1",
        Some(json!({
            "status": "END", "id": "tx1",
            "data_collections": [
                {"data_collection": "media", "event_count": 2},
                {"data_collection": "caption", "event_count": 1}
            ]
        })),
        13,
    );
    h.drain();
    assert_eq!(h.writes("feed"), 0);
    assert_eq!(h.engine.metrics().snapshot().state_commits, 0);

    // the missing event arrives; END passes and one drain emits the union
    h.push(
        "media",
        "m2",
        Some(json!({"id": "m2", "transaction": {"id": "tx1", "total_order": 2}})),
        12,
    );
    h.drain();
    assert_eq!(h.writes("feed"), 2);
    assert!(h.latest("feed", "m1").is_some());
    assert!(h.latest("feed", "m2").is_some());
    assert!(h.engine.metrics().snapshot().state_commits >= 1);
    h.assert_matches_reference();
}

#[test]
fn children_emit_in_ascending_pk_order() {
    let mut h = Harness::new(MEDIA_CAPTION, false);
    h.push("caption", "c2", Some(json!({"id": "c2", "media_id": "m1"})), 1);
    h.push("caption", "c10", Some(json!({"id": "c10", "media_id": "m1"})), 2);
    h.push("caption", "c1", Some(json!({"id": "c1", "media_id": "m1"})), 3);
    h.push("media", "m1", Some(json!({"id": "m1"})), 4);
    h.drain();

    let record = h.latest("feed", "m1").unwrap();
    let ids: Vec<&Value> = record.children["caption"]
        .iter()
        .map(|child| child.record.get("id").unwrap())
        .collect();
    // byte order, not numeric order
    assert_eq!(ids, vec![&json!("c1"), &json!("c10"), &json!("c2")]);
}

#[test]
fn re_emit_without_changes_is_byte_equal() {
    let mut h = Harness::new(MEDIA_CAPTION, false);
    h.push("media", "m1", Some(json!({"id": "m1"})), 1);
    h.push("caption", "c1", Some(json!({"id": "c1", "media_id": "m1"})), 2);
    h.drain();

    // the same root record again forces a recompute with no data change
    h.push("media", "m1", Some(json!({"id": "m1"})), 3);
    h.drain();

    let records = h.outs["feed"].records();
    assert!(records.len() >= 2);
    let (_, previous) = &records[records.len() - 2];
    let (_, last) = &records[records.len() - 1];
    assert_eq!(previous, last);
    assert_eq!(
        serde_json::to_vec(previous).unwrap(),
        serde_json::to_vec(last).unwrap()
    );
}

#[test]
fn deep_tree_matches_reference_evaluator() {
    let mut h = Harness::new(MEDIA_CAPTION_CUE, false);
    h.push("media", "m1", Some(json!({"id": "m1", "title": "A"})), 1);
    h.push("caption", "c2", Some(json!({"id": "c2", "media_id": "m1"})), 2);
    h.push("caption", "c1", Some(json!({"id": "c1", "media_id": "m1"})), 3);
    h.push("cue", "u1", Some(json!({"id": "u1", "caption_id": "c1"})), 4);
    h.push("media", "m2", Some(json!({"id": "m2"})), 5);
    h.push("caption", "c3", Some(json!({"id": "c3", "media_id": "m2"})), 6);
    h.drain();
    h.assert_matches_reference();

    // reparent, delete at two levels, update the root, add a grandchild
    h.push("caption", "c2", Some(json!({"id": "c2", "media_id": "m2"})), 7);
    h.push("cue", "u1", None, 8);
    h.push("caption", "c3", None, 9);
    h.push("media", "m1", Some(json!({"id": "m1", "title": "B"})), 10);
    h.push("cue", "u2", Some(json!({"id": "u2", "caption_id": "c2"})), 11);
    h.drain();
    h.assert_matches_reference();
    assert!(h.engine.verify_state().unwrap().is_empty());
}

#[test]
fn shared_entity_across_roots() {
    let two_roots = r#"[
        {"DenormalizedName": "feed", "Entity": "media",
         "Children": [{"Entity": "caption", "JoinKey": "media_id", "ParentKey": "id"}]},
        {"DenormalizedName": "media_flat", "Entity": "media"}
    ]"#;
    let mut h = Harness::new(two_roots, false);
    h.push("media", "m1", Some(json!({"id": "m1"})), 1);
    h.push("caption", "c1", Some(json!({"id": "c1", "media_id": "m1"})), 2);
    h.drain();

    assert_eq!(
        h.latest("feed", "m1"),
        Some(de(
            json!({"id": "m1"}),
            vec![(
                "caption",
                vec![de(json!({"id": "c1", "media_id": "m1"}), vec![])]
            )]
        ))
    );
    assert_eq!(
        h.latest("media_flat", "m1"),
        Some(de(json!({"id": "m1"}), vec![]))
    );
    h.assert_matches_reference();
}

#[test]
fn emit_trigger_drains_mid_stream() {
    let mut config = Config::default();
    config.create_records_trigger = 1;
    let mut h = Harness::with_config(MEDIA_CAPTION, false, config);
    for at in 0..5 {
        let key = format!("m{}", at);
        h.push("media", &key, Some(json!({"id": key})), at as i64);
    }
    h.drain();
    assert_eq!(h.writes("feed"), 5);
    h.assert_matches_reference();
}

#[test]
fn bounded_run_commits_and_backs_up() {
    let mut h = Harness::new(MEDIA_CAPTION, false);
    h.push("media", "m1", Some(json!({"id": "m1"})), 1);
    h.engine.run(Duration::from_millis(1)).unwrap();

    assert_eq!(h.writes("feed"), 1);
    let snapshot = h.engine.metrics().snapshot();
    assert!(snapshot.state_commits >= 1);
    assert_eq!(snapshot.backups_created, 1);
}

#[test]
fn backup_and_restore_reload_pending_sets() {
    let mut h = Harness::new(MEDIA_CAPTION, false);
    h.push("media", "m1", Some(json!({"id": "m1"})), 1);
    h.drain();
    h.engine.backup().unwrap();

    h.push("caption", "c1", Some(json!({"id": "c1", "media_id": "m1"})), 2);
    h.drain();

    h.engine.restore().unwrap();
    let snapshot = h.engine.metrics().snapshot();
    assert_eq!(snapshot.backups_created, 1);
    assert_eq!(snapshot.backups_restored, 1);
    assert!(h.engine.verify_state().unwrap().is_empty());
}

/// Stopping after a commit and resuming over the same store and stream
/// positions must converge to the same outputs as an uninterrupted run.
#[test]
fn restart_after_commit_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let relations: Vec<Relation> = serde_json::from_str(MEDIA_CAPTION).unwrap();

    let phase_one: Vec<(&str, &str, Value, i64)> = vec![
        ("media", "m1", json!({"id": "m1"}), 1),
        ("caption", "c1", json!({"id": "c1", "media_id": "m1"}), 2),
    ];
    let phase_two: Vec<(&str, &str, Value, i64)> = vec![
        ("caption", "c1", json!({"id": "c1", "media_id": "m2"}), 3),
        ("media", "m2", json!({"id": "m2"}), 4),
        ("media", "m1", json!({"id": "m1", "title": "B"}), 5),
    ];

    let build = |state: RocksState,
                 logs: &HashMap<String, MemoryLog>,
                 out: &MemoryOutputLog|
     -> Engine<RocksState> {
        let mut inputs: Inputs = Inputs::new();
        for (entity, log) in logs {
            inputs.insert(
                entity.clone(),
                Box::new(MemoryTopic::new(entity, log.clone()).unwrap()) as Box<dyn InputTopic>,
            );
        }
        let mut outputs: Outputs = Outputs::new();
        outputs.insert(
            "feed".to_string(),
            Box::new(MemoryOutputTopic::new("feed", out.clone())),
        );
        Engine::new(
            quiet(),
            Config::default(),
            relations.clone(),
            state,
            inputs,
            outputs,
        )
        .unwrap()
    };

    let fresh_logs = || -> HashMap<String, MemoryLog> {
        vec![
            ("media".to_string(), MemoryLog::new()),
            ("caption".to_string(), MemoryLog::new()),
        ]
        .into_iter()
        .collect()
    };

    // uninterrupted run
    let logs = fresh_logs();
    let out = MemoryOutputLog::new();
    let state = RocksState::open(
        dir.path().join("solo.db"),
        dir.path().join("solo.backup"),
        2,
    )
    .unwrap();
    let mut engine = build(state, &logs, &out);
    for (entity, key, value, ts) in phase_one.iter().chain(phase_two.iter()) {
        logs[*entity].push_json(key, Some(value.clone()), *ts);
    }
    engine.drain().unwrap();
    let uninterrupted: BTreeMap<ByteKey, DenormalizedRecord> = out
        .records()
        .into_iter()
        .collect();

    // interrupted run: drain phase one, commit (inside drain), drop the
    // engine, reopen the same store against the same logs, continue
    let logs = fresh_logs();
    let out = MemoryOutputLog::new();
    let state = RocksState::open(
        dir.path().join("resumed.db"),
        dir.path().join("resumed.backup"),
        2,
    )
    .unwrap();
    let mut engine = build(state, &logs, &out);
    for (entity, key, value, ts) in &phase_one {
        logs[*entity].push_json(key, Some(value.clone()), *ts);
    }
    engine.drain().unwrap();
    engine.close().unwrap();
    drop(engine);

    let state = RocksState::open(
        dir.path().join("resumed.db"),
        dir.path().join("resumed.backup"),
        2,
    )
    .unwrap();
    let mut engine = build(state, &logs, &out);
    for (entity, key, value, ts) in &phase_two {
        logs[*entity].push_json(key, Some(value.clone()), *ts);
    }
    engine.drain().unwrap();

    let resumed: BTreeMap<ByteKey, DenormalizedRecord> = out
        .records()
        .into_iter()
        .collect();
    assert_eq!(uninterrupted, resumed);
    assert!(engine.verify_state().unwrap().is_empty());
}
