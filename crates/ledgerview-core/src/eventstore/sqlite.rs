use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use super::{lookback_cutoff, Command, EventStore, EventStoreError, SearchQuery};
use crate::event::{Aggregate, BaseEvent, StoredEvent};

const EVENTS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS events (
    position INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    aggregate_version TEXT NOT NULL,
    resource_owner TEXT NOT NULL,
    event_type TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    previous_sequence INTEGER NOT NULL,
    creation_date TEXT NOT NULL,
    editor_user TEXT NOT NULL,
    editor_service TEXT NOT NULL,
    payload BLOB NOT NULL,
    UNIQUE (instance_id, aggregate_type, aggregate_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_events_instance_position
    ON events(instance_id, position);

CREATE INDEX IF NOT EXISTS idx_events_aggregate
    ON events(instance_id, aggregate_type, aggregate_id, sequence);
";

const SELECT_COLUMNS: &str = "position, instance_id, aggregate_type, aggregate_id, \
     aggregate_version, resource_owner, event_type, sequence, previous_sequence, \
     creation_date, editor_user, editor_service, payload";

/// Event log stored in its own SQLite database (`events` table).
///
/// Positions come from the autoincrement key, so they are strictly increasing
/// across all aggregates and never reused.
#[derive(Debug)]
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open (or create) an event store database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the table created.
    pub fn open(path: &Path, busy_timeout: Duration) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create event store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open event store {}", path.display()))?;
        conn.busy_timeout(busy_timeout)?;
        let _journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::from_connection(conn).context("create event store schema")
    }

    /// In-memory store, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` cannot allocate the database.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(EVENTS_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, EventStoreError> {
        self.conn
            .lock()
            .map_err(|_| EventStoreError::Unavailable("event store mutex poisoned".into()))
    }
}

/// Render the `WHERE` clause for a query, collecting its arguments.
fn where_clause(query: &SearchQuery, args: &mut Vec<SqlValue>) -> String {
    fn bind(args: &mut Vec<SqlValue>, value: SqlValue) -> String {
        args.push(value);
        format!("?{}", args.len())
    }
    fn bind_in(args: &mut Vec<SqlValue>, column: &str, values: Vec<String>) -> String {
        let placeholders: Vec<String> = values
            .into_iter()
            .map(|v| bind(args, SqlValue::Text(v)))
            .collect();
        format!("{column} IN ({})", placeholders.join(", "))
    }

    let mut clauses = Vec::new();
    if let Some(instance_id) = &query.instance_id {
        let p = bind(args, SqlValue::Text(instance_id.clone()));
        clauses.push(format!("instance_id = {p}"));
    }
    if !query.aggregate_types.is_empty() {
        let values = query.aggregate_types.iter().map(ToString::to_string).collect();
        clauses.push(bind_in(args, "aggregate_type", values));
    }
    if !query.aggregate_ids.is_empty() {
        clauses.push(bind_in(args, "aggregate_id", query.aggregate_ids.clone()));
    }
    if !query.event_types.is_empty() {
        let values = query.event_types.iter().map(ToString::to_string).collect();
        clauses.push(bind_in(args, "event_type", values));
    }
    if let Some(owner) = &query.resource_owner {
        let p = bind(args, SqlValue::Text(owner.clone()));
        clauses.push(format!("resource_owner = {p}"));
    }
    if let Some(after) = query.position_after {
        let p = bind(args, SqlValue::Integer(to_i64(after)));
        clauses.push(format!("position > {p}"));
    }

    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64, column: &str) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("negative {column}: {value}").into(),
        )
    })
}

/// Current time truncated to the precision stored on disk.
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    let date: String = row.get(9)?;
    let creation_date = DateTime::parse_from_rfc3339(&date)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(StoredEvent {
        base: BaseEvent {
            aggregate: Aggregate {
                instance_id: row.get(1)?,
                aggregate_type: row.get::<_, String>(2)?.into(),
                id: row.get(3)?,
                version: row.get(4)?,
                resource_owner: row.get(5)?,
            },
            event_type: row.get::<_, String>(6)?.into(),
            sequence: to_u64(row.get(7)?, "sequence")?,
            previous_sequence: to_u64(row.get(8)?, "previous_sequence")?,
            position: to_u64(row.get(0)?, "position")?,
            creation_date,
            editor_user: row.get(10)?,
            editor_service: row.get(11)?,
        },
        payload: row.get(12)?,
    })
}

impl EventStore for SqliteEventStore {
    fn filter(&self, query: &SearchQuery) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut args = Vec::new();
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM events");
        sql.push_str(&where_clause(query, &mut args));
        sql.push_str(if query.descending {
            " ORDER BY position DESC"
        } else {
            " ORDER BY position"
        });
        if let Some(limit) = query.limit {
            args.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let events = stmt
            .query_map(params_from_iter(args), row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn count(&self, query: &SearchQuery) -> Result<usize, EventStoreError> {
        let mut args = Vec::new();
        let mut sql = String::from("SELECT COUNT(*) FROM events");
        sql.push_str(&where_clause(query, &mut args));

        let conn = self.conn()?;
        let count: i64 = conn
            .prepare_cached(&sql)?
            .query_row(params_from_iter(args), |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn push(&self, commands: Vec<Command>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut pushed = Vec::with_capacity(commands.len());

        for command in commands {
            let payload = command.payload_bytes()?;
            let agg = &command.aggregate;
            let previous: i64 = tx
                .query_row(
                    "SELECT MAX(sequence) FROM events
                     WHERE instance_id = ?1 AND aggregate_type = ?2 AND aggregate_id = ?3",
                    params![agg.instance_id, agg.aggregate_type.as_str(), agg.id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()?
                .flatten()
                .unwrap_or(0);
            let creation_date = now_micros();

            tx.execute(
                "INSERT INTO events (instance_id, aggregate_type, aggregate_id, aggregate_version,
                     resource_owner, event_type, sequence, previous_sequence, creation_date,
                     editor_user, editor_service, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    agg.instance_id,
                    agg.aggregate_type.as_str(),
                    agg.id,
                    agg.version,
                    agg.resource_owner,
                    command.event_type.as_str(),
                    previous + 1,
                    previous,
                    format_date(&creation_date),
                    command.editor_user,
                    command.editor_service,
                    payload,
                ],
            )?;
            let position = to_u64(tx.last_insert_rowid(), "position")?;
            let previous = to_u64(previous, "sequence")?;
            pushed.push(command.into_stored(
                previous + 1,
                previous,
                position,
                creation_date,
                payload,
            ));
        }

        tx.commit()?;
        tracing::debug!(count = pushed.len(), "pushed events");
        Ok(pushed)
    }

    fn instance_ids(
        &self,
        lookback: Option<Duration>,
        distinct: bool,
        query: &SearchQuery,
    ) -> Result<Vec<String>, EventStoreError> {
        let mut args = Vec::new();
        let mut sql = String::from(if distinct {
            "SELECT instance_id, MIN(position) AS first_position FROM events"
        } else {
            "SELECT instance_id, position AS first_position FROM events"
        });
        let mut clause = where_clause(query, &mut args);
        if let Some(cutoff) = lookback_cutoff(lookback) {
            args.push(SqlValue::Text(format_date(&cutoff)));
            let cond = format!("creation_date >= ?{}", args.len());
            if clause.is_empty() {
                clause = format!(" WHERE {cond}");
            } else {
                clause.push_str(&format!(" AND {cond}"));
            }
        }
        sql.push_str(&clause);
        if distinct {
            sql.push_str(" GROUP BY instance_id");
        }
        sql.push_str(" ORDER BY first_position");

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteEventStore;
    use crate::event::Aggregate;
    use crate::eventstore::{Command, EventStore, SearchQuery};
    use std::time::Duration;

    fn user(id: &str, instance: &str) -> Aggregate {
        Aggregate {
            id: id.into(),
            aggregate_type: "user".into(),
            resource_owner: "org1".into(),
            instance_id: instance.into(),
            version: "v2".into(),
        }
    }

    #[test]
    fn push_then_filter_roundtrips_metadata() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let pushed = store
            .push(vec![
                Command::new(user("u1", "i1"), "user.added")
                    .payload(serde_json::json!({"name": "ada"}))
                    .editor("admin", "console"),
                Command::new(user("u1", "i1"), "user.removed"),
            ])
            .unwrap();
        assert_eq!(pushed[1].base.sequence, 2);
        assert_eq!(pushed[1].base.previous_sequence, 1);

        let events = store.filter(&SearchQuery::new().instance_id("i1")).unwrap();
        assert_eq!(events, pushed);
        assert_eq!(events[0].payload, br#"{"name":"ada"}"#.to_vec());
        assert!(events[1].payload.is_empty());
    }

    #[test]
    fn filter_by_types_and_position() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store
            .push(vec![
                Command::new(user("u1", "i1"), "user.added"),
                Command::new(user("u2", "i2"), "user.added"),
                Command::new(user("u1", "i1"), "user.removed"),
            ])
            .unwrap();

        let removed = store
            .filter(&SearchQuery::new().event_types(["user.removed"]))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].base.position, 3);

        let after = store
            .filter(&SearchQuery::new().aggregate_types(["user"]).position_after(1).limit(1))
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].base.aggregate.instance_id, "i2");

        let backlog = SearchQuery::new().aggregate_types(["user"]).position_after(1).limit(1);
        assert_eq!(store.count(&backlog).unwrap(), 2);
        assert_eq!(store.count(&SearchQuery::new().instance_id("i3")).unwrap(), 0);

        assert_eq!(
            store
                .latest_position(&SearchQuery::new().instance_id("i1"))
                .unwrap(),
            Some(3)
        );
    }

    #[test]
    fn instance_ids_respect_distinct_and_lookback() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store
            .push(vec![
                Command::new(user("u1", "i1"), "user.added"),
                Command::new(user("u2", "i2"), "user.added"),
                Command::new(user("u3", "i1"), "user.added"),
            ])
            .unwrap();

        let distinct = store
            .instance_ids(Some(Duration::from_secs(3600)), true, &SearchQuery::new())
            .unwrap();
        assert_eq!(distinct, vec!["i1", "i2"]);

        let all = store.instance_ids(None, false, &SearchQuery::new()).unwrap();
        assert_eq!(all, vec!["i1", "i2", "i1"]);
    }
}
