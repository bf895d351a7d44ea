use super::*;
use crate::config::BatchConfig;
use crate::database::{Connection, ConnectionFactory, DuckDbFactory, SqlValue, TableId};
use crate::offset::Offset;
use crate::Error;
use chrono::NaiveDateTime;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

const GATE: &str = "SELECT run_to FROM load_status \
                    WHERE table_name = __TABLE_NAME__ AND run_to > __OFFSET__ \
                    ORDER BY run_to LIMIT 1";

fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn events() -> TableId {
    TableId::new(Some("main"), "events")
}

fn timestamp_type() -> BatchType {
    BatchType::Timestamp {
        column: "loaded_at".to_string(),
    }
}

fn batch_config(gate: &str, default_start: &str) -> BatchConfig {
    BatchConfig {
        pre_run_check_query: gate.to_string(),
        offsets_storage: "batch_offsets".to_string(),
        default_offset_start: default_start.to_string(),
    }
}

struct Fixture {
    _factory: DuckDbFactory,
    conn: Box<dyn Connection>,
    store: Arc<TableWatermarkStore>,
}

fn fixture(load_status: &str) -> Fixture {
    let factory = DuckDbFactory::in_memory().unwrap();
    factory
        .execute_batch(&format!(
            "CREATE TABLE load_status (table_name VARCHAR, run_to TIMESTAMP); {load_status}"
        ))
        .unwrap();
    let conn = factory.connect().unwrap();
    Fixture {
        _factory: factory,
        conn,
        store: Arc::new(TableWatermarkStore::new("batch_offsets").unwrap()),
    }
}

fn manager(f: &mut Fixture, gate: &str) -> BatchIdManager {
    BatchIdManager::load(
        f.conn.as_mut(),
        f.store.clone(),
        &events(),
        timestamp_type(),
        &batch_config(gate, "2023-01-01 00:00:00"),
    )
    .unwrap()
}

fn stored(f: &mut Fixture) -> Option<WatermarkRecord> {
    f.store.load(f.conn.as_mut(), "main.events").unwrap()
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn test_load_initialises_missing_watermark() {
    let mut f = fixture("");
    let manager = manager(&mut f, GATE);

    let start = BatchOffset::Timestamp(ts("2023-01-01 00:00:00"));
    assert_eq!(manager.start_offset(), start);
    assert_eq!(manager.last_offset(), start);
    assert_eq!(manager.state(), BatchRunState::Idle);
    assert!(!manager.is_run_pending());

    assert_eq!(
        stored(&mut f),
        Some(WatermarkRecord {
            start_offset_ts: Some(ts("2023-01-01 00:00:00")),
            last_offset_ts: Some(ts("2023-01-01 00:00:00")),
            ..WatermarkRecord::default()
        })
    );
}

#[test]
fn test_load_existing_watermark() {
    let mut f = fixture("");
    f.store
        .save(
            f.conn.as_mut(),
            "main.events",
            &WatermarkRecord {
                start_offset_ts: Some(ts("2022-01-01 00:00:00")),
                last_offset_ts: Some(ts("2023-06-01 00:00:00")),
                ..WatermarkRecord::default()
            },
        )
        .unwrap();

    let manager = manager(&mut f, GATE);
    assert_eq!(
        manager.start_offset(),
        BatchOffset::Timestamp(ts("2022-01-01 00:00:00"))
    );
    assert_eq!(
        manager.last_offset(),
        BatchOffset::Timestamp(ts("2023-06-01 00:00:00"))
    );
}

#[test]
fn test_watermark_keeps_nanoseconds() {
    let mut f = fixture("");
    let last = NaiveDateTime::parse_from_str("2024-01-01 00:00:00.123456789", "%Y-%m-%d %H:%M:%S%.f")
        .unwrap();
    let record = WatermarkRecord {
        start_offset_ts: Some(ts("2024-01-01 00:00:00")),
        last_offset_ts: Some(last),
        ..WatermarkRecord::default()
    };

    f.store.save(f.conn.as_mut(), "main.events", &record).unwrap();
    assert_eq!(stored(&mut f), Some(record.clone()));

    // Second save goes through the update path
    f.store.save(f.conn.as_mut(), "main.events", &record).unwrap();
    assert_eq!(stored(&mut f), Some(record));
}

#[test]
fn test_load_rejects_bad_default_start() {
    let mut f = fixture("");
    let err = BatchIdManager::load(
        f.conn.as_mut(),
        f.store.clone(),
        &events(),
        BatchType::Incrementing {
            column: "batch_id".to_string(),
        },
        &batch_config(GATE, "yesterday"),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidConfigValue { .. }));
}

#[test]
fn test_render_gate_query() {
    let mut f = fixture("");
    let manager = manager(&mut f, GATE);
    assert_eq!(
        manager.render_gate_query().unwrap(),
        "SELECT run_to FROM load_status \
         WHERE table_name = 'main.events' AND run_to > '2023-01-01 00:00:00' \
         ORDER BY run_to LIMIT 1"
    );

    let ungated = self::manager(&mut f, "   ");
    assert!(ungated.render_gate_query().is_none());
    assert!(!ungated.is_gated());
}

// ============================================================================
// Gate check
// ============================================================================

#[test]
fn test_ungated_run_is_always_eligible() {
    let mut f = fixture("");
    let mut manager = manager(&mut f, "");
    assert!(manager.check_pre_run(f.conn.as_mut()).unwrap());
    assert!(manager.check_pre_run(f.conn.as_mut()).unwrap());
    assert_eq!(manager.state(), BatchRunState::Running);
    assert!(manager.run_to().is_none());
}

#[test]
fn test_gate_without_rows_defers() {
    let mut f = fixture("");
    let mut manager = manager(&mut f, GATE);
    assert!(!manager.check_pre_run(f.conn.as_mut()).unwrap());
    assert_eq!(manager.state(), BatchRunState::GateCheck);
    assert!(!manager.is_run_pending());
}

#[test]
fn test_gate_returning_null_defers() {
    let mut f = fixture("");
    let mut manager = manager(&mut f, "SELECT max(run_to) FROM load_status");
    assert!(!manager.check_pre_run(f.conn.as_mut()).unwrap());
}

#[test]
fn test_gate_resolves_run_to() {
    let mut f = fixture(
        "INSERT INTO load_status VALUES ('main.events', TIMESTAMP '2024-01-01 00:00:00');",
    );
    let mut manager = manager(&mut f, GATE);

    assert!(manager.check_pre_run(f.conn.as_mut()).unwrap());
    assert_eq!(manager.state(), BatchRunState::Running);
    assert_eq!(
        manager.run_to(),
        Some(BatchOffset::Timestamp(ts("2024-01-01 00:00:00")))
    );
}

#[test]
fn test_pending_run_skips_gate_query() {
    let mut f = fixture(
        "INSERT INTO load_status VALUES ('main.events', TIMESTAMP '2024-01-01 00:00:00');",
    );
    let mut manager = manager(&mut f, GATE);
    assert!(manager.check_pre_run(f.conn.as_mut()).unwrap());

    f.conn.execute("DROP TABLE load_status", &[]).unwrap();
    assert!(manager.check_pre_run(f.conn.as_mut()).unwrap());
}

#[test]
fn test_upper_bound_below_watermark_is_fatal() {
    let mut f = fixture("");
    let mut manager = manager(&mut f, "SELECT TIMESTAMP '2020-01-01 00:00:00'");
    let err = manager.check_pre_run(f.conn.as_mut()).unwrap_err();

    assert!(!err.is_transient());
    let message = err.to_string();
    assert!(message.contains("main.events"));
    assert!(message.contains("does not exist in the source table"));
}

#[test]
fn test_upper_bound_of_wrong_type_is_fatal() {
    let mut f = fixture("");
    let mut manager = manager(&mut f, "SELECT 'not a time'");
    let err = manager.check_pre_run(f.conn.as_mut()).unwrap_err();
    assert!(matches!(err, Error::Watermark { .. }));
}

#[test]
fn test_failing_gate_query_is_transient() {
    let mut f = fixture("");
    let mut manager = manager(&mut f, "SELECT run_to FROM missing_table");
    let err = manager.check_pre_run(f.conn.as_mut()).unwrap_err();
    assert!(err.is_transient());
}

// ============================================================================
// Commit
// ============================================================================

#[test]
fn test_commit_when_run_to_reached() {
    let mut f = fixture(
        "INSERT INTO load_status VALUES ('main.events', TIMESTAMP '2024-01-01 00:00:00');",
    );
    let mut manager = manager(&mut f, GATE);
    assert!(manager.check_pre_run(f.conn.as_mut()).unwrap());

    let extracted = Offset::from_timestamp(ts("2024-01-01 00:00:00"));
    assert!(manager.commit(f.conn.as_mut(), &extracted).unwrap());

    assert_eq!(manager.state(), BatchRunState::Idle);
    assert!(!manager.is_run_pending());
    assert_eq!(
        manager.last_offset(),
        BatchOffset::Timestamp(ts("2024-01-01 00:00:00"))
    );
    assert_eq!(
        stored(&mut f).unwrap().last_offset_ts,
        Some(ts("2024-01-01 00:00:00"))
    );

    // The next gate starts from the committed watermark
    assert!(manager
        .render_gate_query()
        .unwrap()
        .contains("run_to > '2024-01-01 00:00:00'"));
    assert!(!manager.check_pre_run(f.conn.as_mut()).unwrap());
}

#[test]
fn test_commit_skipped_on_shortfall() {
    let mut f = fixture(
        "INSERT INTO load_status VALUES ('main.events', TIMESTAMP '2024-01-01 00:00:00');",
    );
    let mut manager = manager(&mut f, GATE);
    assert!(manager.check_pre_run(f.conn.as_mut()).unwrap());

    let extracted = Offset::from_timestamp(ts("2023-12-31 23:00:00"));
    assert!(!manager.commit(f.conn.as_mut(), &extracted).unwrap());

    assert!(manager.is_run_pending());
    assert_eq!(
        manager.last_offset(),
        BatchOffset::Timestamp(ts("2023-01-01 00:00:00"))
    );
    assert_eq!(
        stored(&mut f).unwrap().last_offset_ts,
        Some(ts("2023-01-01 00:00:00"))
    );
    assert!(manager.check_pre_run(f.conn.as_mut()).unwrap());
}

#[test]
fn test_ungated_commit_moves_forward_only() {
    let mut f = fixture("");
    let mut manager = manager(&mut f, "");
    assert!(manager.check_pre_run(f.conn.as_mut()).unwrap());

    let forward = Offset::from_timestamp(ts("2023-05-01 00:00:00"));
    assert!(manager.commit(f.conn.as_mut(), &forward).unwrap());
    assert_eq!(
        stored(&mut f).unwrap().last_offset_ts,
        Some(ts("2023-05-01 00:00:00"))
    );

    let backward = Offset::from_timestamp(ts("2023-02-01 00:00:00"));
    assert!(manager.commit(f.conn.as_mut(), &backward).unwrap());
    assert_eq!(
        manager.last_offset(),
        BatchOffset::Timestamp(ts("2023-05-01 00:00:00"))
    );
}

#[test]
fn test_incrementing_batch_cycle() {
    let factory = DuckDbFactory::in_memory().unwrap();
    factory
        .execute_batch("CREATE TABLE load_status (table_name VARCHAR, run_to BIGINT); INSERT INTO load_status VALUES ('main.events', 10);")
        .unwrap();
    let mut conn = factory.connect().unwrap();
    let store = MemoryWatermarkStore::new();

    let mut manager = BatchIdManager::load(
        conn.as_mut(),
        Arc::new(store.clone()),
        &events(),
        BatchType::Incrementing {
            column: "batch_id".to_string(),
        },
        &batch_config(GATE, ""),
    )
    .unwrap();
    assert_eq!(manager.last_offset(), BatchOffset::Long(-1));
    assert!(manager.render_gate_query().unwrap().contains("run_to > -1"));

    assert!(manager.check_pre_run(conn.as_mut()).unwrap());
    assert_eq!(manager.run_to(), Some(BatchOffset::Long(10)));
    assert!(manager
        .commit(conn.as_mut(), &Offset::from_incrementing(10))
        .unwrap());
    assert_eq!(store.get("main.events").unwrap().last_offset_long, Some(10));
}

// ============================================================================
// Observer
// ============================================================================

#[test]
fn test_record_transition_notifies_observer() {
    let mut f = fixture("");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer: TransitionObserver = Arc::new(move |t: &OffsetTransition| {
        sink.lock().unwrap().push(t.clone());
    });
    let manager = manager(&mut f, GATE).with_observer(Some(observer));

    let a = Offset::from_timestamp(ts("2023-01-01 00:00:00"));
    let b = Offset::from_timestamp(ts("2023-01-02 00:00:00"));
    manager.record_transition(&a, &b);
    manager.record_transition(&b, &b);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![OffsetTransition {
            table: "main.events".to_string(),
            old: Some(BatchOffset::Timestamp(ts("2023-01-01 00:00:00"))),
            new: BatchOffset::Timestamp(ts("2023-01-02 00:00:00")),
        }]
    );
}

#[test]
fn test_batch_offset_literals() {
    assert_eq!(
        BatchOffset::Timestamp(ts("2024-01-01 12:30:00")).sql_literal(),
        "'2024-01-01 12:30:00'"
    );
    assert_eq!(
        BatchOffset::Timestamp(
            NaiveDateTime::parse_from_str("2024-01-01 12:30:00.5", "%Y-%m-%d %H:%M:%S%.f").unwrap()
        )
        .sql_literal(),
        "'2024-01-01 12:30:00.500'"
    );
    assert_eq!(BatchOffset::Long(42).sql_literal(), "42");
    assert_eq!(
        BatchOffset::Long(1).compare(&BatchOffset::Timestamp(ts("2024-01-01 00:00:00"))),
        None
    );
    assert_eq!(
        timestamp_type().value_from_sql(&SqlValue::Text("2024-01-01".into())),
        Some(BatchOffset::Timestamp(ts("2024-01-01 00:00:00")))
    );
}
