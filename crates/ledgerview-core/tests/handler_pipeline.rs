//! End-to-end replay: SQLite event store -> typed events -> reducers ->
//! projection tables with a side table, checkpoints and resets.

use std::sync::Arc;

use ledgerview_core::config::HandlerConfig;
use ledgerview_core::db::schema::{Check, ColumnType, ForeignKey, PrimaryKey, SchemaColumn, Table};
use ledgerview_core::db::{open_projection, DEFAULT_BUSY_TIMEOUT};
use ledgerview_core::event::{decode_json, Aggregate, BaseEvent, DataParseError};
use ledgerview_core::eventstore::{Command, EventStore, SqliteEventStore};
use ledgerview_core::statement::{
    add_create_statement, add_update_statement, new_delete_statement, new_multi_statement,
    new_update_statement, Column, Condition,
};
use ledgerview_core::{
    AggregateReducer, Event, EventData, EventReducer, Handler, Projection, ProjectionError,
    Shutdown,
};
use rusqlite::Connection;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// A small catalog domain
// ---------------------------------------------------------------------------

const PROJECTION: &str = "projections.products";

#[derive(Debug, Deserialize)]
struct ProductAdded {
    name: String,
    sku: String,
}

#[derive(Debug, Deserialize)]
struct ProductChanged {
    name: Option<String>,
    sku: Option<String>,
}

#[derive(Debug)]
enum CatalogEvent {
    Added(ProductAdded),
    Changed(ProductChanged),
    Removed,
    InstanceRemoved,
}

impl EventData for CatalogEvent {
    fn decode(base: &BaseEvent, payload: &[u8]) -> Result<Self, DataParseError> {
        match (base.aggregate_type().as_str(), base.event_type.as_str()) {
            ("product", "product.added") => decode_json(base, payload).map(Self::Added),
            ("product", "product.changed") => decode_json(base, payload).map(Self::Changed),
            ("product", "product.removed") => Ok(Self::Removed),
            ("instance", "instance.removed") => Ok(Self::InstanceRemoved),
            _ => Err(DataParseError::unknown(base)),
        }
    }
}

fn reduce_added(event: &Event<CatalogEvent>) -> Result<ledgerview_core::Statement, ProjectionError> {
    let CatalogEvent::Added(data) = &event.data else {
        return Err(ProjectionError::invalid_argument(
            &event.base.event_type,
            &["product.added"],
        ));
    };
    Ok(new_multi_statement(
        event,
        vec![
            add_create_statement(vec![
                Column::new("id", event.base.aggregate_id()),
                Column::new("instance_id", event.base.instance_id()),
                Column::new("name", data.name.as_str()),
                Column::new("sequence", event.base.sequence),
            ]),
            add_create_statement(vec![
                Column::new("product_id", event.base.aggregate_id()),
                Column::new("instance_id", event.base.instance_id()),
                Column::new("sku", data.sku.as_str()),
            ])
            .with_table_suffix("sku"),
        ],
    ))
}

fn reduce_changed(event: &Event<CatalogEvent>) -> Result<ledgerview_core::Statement, ProjectionError> {
    let CatalogEvent::Changed(data) = &event.data else {
        return Err(ProjectionError::invalid_argument(
            &event.base.event_type,
            &["product.changed"],
        ));
    };
    let key = |id_column: &str| {
        vec![
            Condition::equals(id_column, event.base.aggregate_id()),
            Condition::equals("instance_id", event.base.instance_id()),
        ]
    };
    let mut main = Vec::new();
    if let Some(name) = &data.name {
        main.push(Column::new("name", name.as_str()));
    }
    if main.is_empty() && data.sku.is_none() {
        return Ok(new_update_statement(event, main, key("id")));
    }
    main.push(Column::new("sequence", event.base.sequence));
    let mut subs = vec![add_update_statement(main, key("id"))];
    if let Some(sku) = &data.sku {
        subs.push(
            add_update_statement(vec![Column::new("sku", sku.as_str())], key("product_id"))
                .with_table_suffix("sku"),
        );
    }
    Ok(new_multi_statement(event, subs))
}

struct Products;

impl Projection<CatalogEvent> for Products {
    fn name(&self) -> &str {
        PROJECTION
    }

    fn reducers(&self) -> Vec<AggregateReducer<CatalogEvent>> {
        vec![
            AggregateReducer::new(
                "product",
                vec![
                    EventReducer::new("product.added", reduce_added),
                    EventReducer::new("product.changed", reduce_changed),
                    EventReducer::new("product.removed", |event: &Event<CatalogEvent>| {
                        if !matches!(event.data, CatalogEvent::Removed) {
                            return Err(ProjectionError::invalid_argument(
                                &event.base.event_type,
                                &["product.removed"],
                            ));
                        }
                        Ok(new_delete_statement(
                            event,
                            vec![
                                Condition::equals("id", event.base.aggregate_id()),
                                Condition::equals("instance_id", event.base.instance_id()),
                            ],
                        ))
                    }),
                ],
            ),
            AggregateReducer::instance_removed("instance_id"),
        ]
    }

    fn check(&self) -> Option<Check> {
        Some(Check::multi_table(
            Table::new(
                vec![
                    SchemaColumn::new("id", ColumnType::Text),
                    SchemaColumn::new("instance_id", ColumnType::Text),
                    SchemaColumn::new("name", ColumnType::Text),
                    SchemaColumn::new("sequence", ColumnType::Int64),
                ],
                PrimaryKey::new(&["instance_id", "id"]),
            ),
            vec![
                Table::suffixed(
                    vec![
                        SchemaColumn::new("product_id", ColumnType::Text),
                        SchemaColumn::new("instance_id", ColumnType::Text),
                        SchemaColumn::new("sku", ColumnType::Text),
                    ],
                    PrimaryKey::new(&["instance_id", "product_id"]),
                    "sku",
                )
                .with_foreign_key(ForeignKey::of_public_keys()),
            ],
        ))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<SqliteEventStore>,
    handler: Handler<CatalogEvent>,
    conn: Connection,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(
        SqliteEventStore::open(&dir.path().join("events.sqlite3"), DEFAULT_BUSY_TIMEOUT)
            .expect("open event store"),
    );
    let mut conn = open_projection(&dir.path().join("projections.sqlite3"), DEFAULT_BUSY_TIMEOUT)
        .expect("open projection db");
    let handler = Handler::new(&Products, store.clone(), HandlerConfig::default());
    handler.init(&mut conn).expect("init schema");
    Fixture {
        _dir: dir,
        store,
        handler,
        conn,
    }
}

fn product(instance: &str, id: &str, event_type: &str, payload: serde_json::Value) -> Command {
    Command::new(
        Aggregate {
            id: id.into(),
            aggregate_type: "product".into(),
            resource_owner: "org-1".into(),
            instance_id: instance.into(),
            version: "v1".into(),
        },
        event_type,
    )
    .payload(payload)
}

fn rows(conn: &Connection) -> Vec<(String, String, String, i64)> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT p.instance_id, p.name, s.sku, p.sequence FROM {PROJECTION} p
             JOIN {PROJECTION}_sku s ON s.instance_id = p.instance_id AND s.product_id = p.id
             ORDER BY p.instance_id, p.id"
        ))
        .expect("prepare");
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        .expect("query")
        .collect::<rusqlite::Result<_>>()
        .expect("rows")
}

fn sku_rows(conn: &Connection) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {PROJECTION}_sku"), [], |row| row.get(0))
        .expect("count")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn replays_events_into_main_and_side_table() {
    let mut fx = fixture();
    fx.store
        .push(vec![
            product("i1", "p1", "product.added", serde_json::json!({"name": "Lamp", "sku": "L-1"})),
            product("i1", "p1", "product.changed", serde_json::json!({"name": "Desk lamp"})),
            product("i1", "p1", "product.changed", serde_json::json!({"sku": "L-2"})),
            product("i1", "p1", "product.changed", serde_json::json!({})),
        ])
        .expect("push");

    let applied = fx
        .handler
        .trigger_known(&mut fx.conn, &Shutdown::new())
        .expect("trigger");
    assert_eq!(applied, 4);
    assert_eq!(
        rows(&fx.conn),
        vec![("i1".into(), "Desk lamp".into(), "L-2".into(), 3)]
    );

    let status = fx.handler.status(&fx.conn, "i1").expect("status");
    assert_eq!(status.sequence, 4, "no-op events still advance the checkpoint");
    assert_eq!(status.lag, 0);
}

#[test]
fn delete_cascades_into_side_table() {
    let mut fx = fixture();
    fx.store
        .push(vec![
            product("i1", "p1", "product.added", serde_json::json!({"name": "A", "sku": "a"})),
            product("i1", "p2", "product.added", serde_json::json!({"name": "B", "sku": "b"})),
            product("i1", "p1", "product.removed", serde_json::Value::Null),
        ])
        .expect("push");

    fx.handler
        .trigger_known(&mut fx.conn, &Shutdown::new())
        .expect("trigger");
    assert_eq!(rows(&fx.conn).len(), 1);
    assert_eq!(sku_rows(&fx.conn), 1);
}

#[test]
fn tenants_are_independent() {
    let mut fx = fixture();
    fx.store
        .push(vec![
            product("i1", "p1", "product.added", serde_json::json!({"name": "A", "sku": "a"})),
            product("i2", "p1", "product.added", serde_json::json!({"name": "B", "sku": "b"})),
        ])
        .expect("push");

    fx.handler
        .trigger(&mut fx.conn, &["i2".to_owned()], &Shutdown::new())
        .expect("trigger");
    assert_eq!(rows(&fx.conn), vec![("i2".into(), "B".into(), "b".into(), 1)]);

    let statuses = fx.handler.statuses(&fx.conn).expect("statuses");
    assert_eq!(statuses.len(), 2);
    assert_eq!((statuses[0].instance_id.as_str(), statuses[0].lag), ("i1", 1));
    assert_eq!((statuses[1].instance_id.as_str(), statuses[1].lag), ("i2", 0));
}

#[test]
fn malformed_payload_is_a_conversion_error_and_rolls_back_nothing_before_it() {
    let mut fx = fixture();
    fx.store
        .push(vec![
            product("i1", "p1", "product.added", serde_json::json!({"name": "A", "sku": "a"})),
            product("i1", "p2", "product.added", serde_json::json!({"name": 7})),
        ])
        .expect("push");

    let err = fx
        .handler
        .trigger_known(&mut fx.conn, &Shutdown::new())
        .expect_err("second event cannot be decoded");
    assert!(matches!(err, ProjectionError::Conversion { sequence: 1, .. }), "{err}");
    assert!(!err.is_retryable());
    assert_eq!(rows(&fx.conn).len(), 1);

    let failed = fx.handler.failed_events(&fx.conn).expect("failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].aggregate_id, "p2");
}

#[test]
fn failing_tenant_does_not_block_the_others() {
    let mut fx = fixture();
    fx.store
        .push(vec![
            product("i1", "p1", "product.added", serde_json::json!({"name": 7})),
            product("i2", "p1", "product.added", serde_json::json!({"name": "B", "sku": "b"})),
        ])
        .expect("push");

    let err = fx
        .handler
        .trigger_known(&mut fx.conn, &Shutdown::new())
        .expect_err("i1 cannot be decoded");
    assert!(matches!(err, ProjectionError::Conversion { sequence: 1, .. }), "{err}");
    assert_eq!(rows(&fx.conn), vec![("i2".into(), "B".into(), "b".into(), 1)]);

    let i2 = fx.handler.status(&fx.conn, "i2").expect("status");
    assert_eq!((i2.position, i2.lag), (2, 0));
    let i1 = fx.handler.status(&fx.conn, "i1").expect("status");
    assert_eq!((i1.position, i1.lag), (0, 1));
}

#[test]
fn reset_of_one_tenant_keeps_the_other() {
    let mut fx = fixture();
    fx.store
        .push(vec![
            product("i1", "p1", "product.added", serde_json::json!({"name": "A", "sku": "a"})),
            product("i2", "p1", "product.added", serde_json::json!({"name": "B", "sku": "b"})),
        ])
        .expect("push");
    fx.handler
        .trigger_known(&mut fx.conn, &Shutdown::new())
        .expect("trigger");

    fx.handler.reset(&mut fx.conn, Some("i1")).expect("reset");
    assert_eq!(rows(&fx.conn), vec![("i2".into(), "B".into(), "b".into(), 1)]);
    assert_eq!(fx.handler.status(&fx.conn, "i1").expect("status").position, 0);

    fx.handler
        .trigger_known(&mut fx.conn, &Shutdown::new())
        .expect("replay");
    assert_eq!(rows(&fx.conn).len(), 2);
}
