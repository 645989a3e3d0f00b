//! Several workers on the same file-backed projection database.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use ledgerview_core::config::HandlerConfig;
use ledgerview_core::db::schema::{Check, ColumnType, PrimaryKey, SchemaColumn, Table};
use ledgerview_core::db::open_projection;
use ledgerview_core::event::Aggregate;
use ledgerview_core::eventstore::{Command, EventStore, MemoryEventStore};
use ledgerview_core::handler::checkpoint;
use ledgerview_core::statement::{new_create_statement, Column};
use ledgerview_core::{AggregateReducer, Event, EventReducer, Handler, Projection, Shutdown};
use rusqlite::Connection;

const PROJECTION: &str = "projections.ledger_lines";
const BUSY: Duration = Duration::from_secs(5);

struct Lines;

impl Projection<serde_json::Value> for Lines {
    fn name(&self) -> &str {
        PROJECTION
    }

    // Plain INSERTs keyed by (instance, aggregate, sequence): applying any
    // event twice fails with a constraint violation.
    fn reducers(&self) -> Vec<AggregateReducer<serde_json::Value>> {
        vec![AggregateReducer::new(
            "account",
            vec![EventReducer::new("account.booked", |event: &Event<serde_json::Value>| {
                Ok(new_create_statement(
                    event,
                    vec![
                        Column::new("instance_id", event.base.instance_id()),
                        Column::new("account_id", event.base.aggregate_id()),
                        Column::new("sequence", event.base.sequence),
                        Column::new("position", event.base.position),
                    ],
                ))
            })],
        )]
    }

    fn check(&self) -> Option<Check> {
        Some(Check::table(Table::new(
            vec![
                SchemaColumn::new("instance_id", ColumnType::Text),
                SchemaColumn::new("account_id", ColumnType::Text),
                SchemaColumn::new("sequence", ColumnType::Int64),
                SchemaColumn::new("position", ColumnType::Int64),
            ],
            PrimaryKey::new(&["instance_id", "account_id", "sequence"]),
        )))
    }
}

fn booked(instance: &str, account: &str) -> Command {
    Command::new(
        Aggregate {
            id: account.into(),
            aggregate_type: "account".into(),
            resource_owner: "org".into(),
            instance_id: instance.into(),
            version: "v1".into(),
        },
        "account.booked",
    )
    .payload(serde_json::json!({"amount": 1}))
}

fn seeded_store(instances: &[&str], per_instance: usize) -> Arc<MemoryEventStore> {
    let store = Arc::new(MemoryEventStore::new());
    for round in 0..per_instance {
        let commands = instances
            .iter()
            .map(|instance| booked(instance, &format!("acc-{}", round % 3)))
            .collect();
        store.push(commands).expect("push");
    }
    store
}

fn count(conn: &Connection, instance: &str) -> i64 {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {PROJECTION} WHERE instance_id = ?1"),
        [instance],
        |row| row.get(0),
    )
    .expect("count")
}

#[test]
fn competing_workers_apply_each_event_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("projections.sqlite3");
    let instances = ["i1", "i2", "i3"];
    let store = seeded_store(&instances, 40);
    let config = HandlerConfig {
        bulk_limit: 7,
        lock_wait_ms: 10_000,
        ..HandlerConfig::default()
    };

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let path = path.clone();
            let store = store.clone();
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut conn = open_projection(&path, BUSY).expect("open");
                let handler = Handler::new(&Lines, store, config);
                handler.init(&mut conn).expect("init");
                barrier.wait();
                handler.trigger_known(&mut conn, &Shutdown::new())
            })
        })
        .collect();

    let mut applied = 0;
    for handle in handles {
        applied += handle.join().expect("worker panicked").expect("trigger");
    }

    let conn = open_projection(&path, BUSY).expect("open");
    for instance in instances {
        assert_eq!(count(&conn, instance), 40, "{instance}");
        assert_eq!(
            checkpoint::read(&conn, PROJECTION, instance)
                .expect("checkpoint")
                .expect("present")
                .position,
            store
                .latest_position(&ledgerview_core::eventstore::SearchQuery::new().instance_id(instance))
                .expect("head")
                .expect("has events")
        );
    }
    // Workers that found a tenant locked left it to the holder, so every
    // event was applied exactly once across all workers.
    assert_eq!(applied, 120);
}

#[test]
fn locked_database_rolls_back_and_leaves_checkpoint_untouched() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("projections.sqlite3");
    let store = seeded_store(&["i1"], 5);
    let config = HandlerConfig {
        retry_failed_after_ms: 1,
        max_backoff_ms: 5,
        lock_wait_ms: 50,
        ..HandlerConfig::default()
    };

    let mut conn = open_projection(&path, Duration::from_millis(20)).expect("open");
    let handler = Handler::new(&Lines, store, config);
    handler.init(&mut conn).expect("init");

    let blocker = open_projection(&path, BUSY).expect("open blocker");
    blocker
        .execute_batch("BEGIN IMMEDIATE; UPDATE projections.locks SET locker_id = locker_id;")
        .expect("hold write lock");

    let err = handler
        .trigger(&mut conn, &["i1".to_owned()], &Shutdown::new())
        .expect_err("database is write-locked");
    assert!(err.is_retryable(), "{err}");
    blocker.execute_batch("ROLLBACK").expect("release");

    assert_eq!(count(&conn, "i1"), 0);
    assert_eq!(checkpoint::read_position(&conn, PROJECTION, "i1").expect("read"), 0);

    let applied = handler
        .trigger(&mut conn, &["i1".to_owned()], &Shutdown::new())
        .expect("trigger after unlock");
    assert_eq!(applied, 5);
    assert_eq!(count(&conn, "i1"), 5);
}

#[test]
fn concurrent_schema_init_is_safe() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("projections.sqlite3");
    let store: Arc<MemoryEventStore> = Arc::new(MemoryEventStore::new());
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let path = path.clone();
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut conn = open_projection(&path, BUSY).expect("open");
                Handler::new(&Lines, store, HandlerConfig::default()).init(&mut conn)
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("init thread panicked").expect("init");
    }
    let conn = open_projection(&path, BUSY).expect("open");
    assert_eq!(count(&conn, "any"), 0);
}
