//! Versioned migrations for the engine's own bookkeeping tables.
//!
//! Projection tables are not migrated here; they are created from their
//! descriptors by [`super::schema::init`].

use rusqlite::{types::Type, Connection, DatabaseName};

use super::PROJECTIONS_SCHEMA;

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

/// Checkpoints, row locks and failure bookkeeping.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS projections.current_states (
    projection_name TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    aggregate_type TEXT NOT NULL DEFAULT '',
    aggregate_id TEXT NOT NULL DEFAULT '',
    sequence INTEGER NOT NULL DEFAULT 0,
    event_date TEXT,
    last_updated_us INTEGER NOT NULL,
    PRIMARY KEY (projection_name, instance_id)
);

CREATE TABLE IF NOT EXISTS projections.locks (
    projection_name TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    locker_id TEXT NOT NULL,
    locked_until_us INTEGER NOT NULL,
    PRIMARY KEY (projection_name, instance_id)
);

CREATE TABLE IF NOT EXISTS projections.failed_events (
    projection_name TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    event_sequence INTEGER NOT NULL,
    position INTEGER NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    error TEXT NOT NULL,
    last_failed_us INTEGER NOT NULL,
    PRIMARY KEY (projection_name, instance_id, aggregate_type, aggregate_id, event_sequence)
);
";

/// Lookups of failures by position while a batch is applied.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS projections.idx_failed_events_position
    ON failed_events(projection_name, instance_id, position);
";

const MIGRATIONS: &[(u32, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

fn schema() -> DatabaseName<'static> {
    DatabaseName::Attached(PROJECTIONS_SCHEMA)
}

/// Read `PRAGMA projections.user_version`.
///
/// # Errors
///
/// Returns an error if querying `SQLite` fails or the value does not fit `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(Some(schema()), "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply all pending migrations in ascending order, each in its own
/// transaction together with the version bump.
///
/// # Errors
///
/// Returns an error if any migration fails.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(Some(schema()), "user_version", i64::from(*version))?;
        tx.commit()?;
        tracing::debug!(version, "applied projection engine migration");
        current = *version;
    }

    Ok(current)
}
