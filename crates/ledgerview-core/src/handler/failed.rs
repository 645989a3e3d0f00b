//! Failure bookkeeping in `projections.failed_events`.
//!
//! Rows are written outside the batch transaction so a failure count survives
//! the rollback of the work that caused it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::checkpoint::{to_i64, to_u64};
use crate::event::BaseEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedEvent {
    pub projection_name: String,
    pub instance_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_sequence: u64,
    pub position: u64,
    pub failure_count: u32,
    pub error: String,
    pub last_failed: Option<DateTime<Utc>>,
}

/// Count one more failure of `event` and return the new total.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn record_failure(
    conn: &Connection,
    projection: &str,
    event: &BaseEvent,
    error: &str,
) -> rusqlite::Result<u32> {
    conn.query_row(
        "INSERT INTO projections.failed_events (projection_name, instance_id, aggregate_type,
             aggregate_id, event_sequence, position, failure_count, error, last_failed_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)
         ON CONFLICT (projection_name, instance_id, aggregate_type, aggregate_id, event_sequence)
         DO UPDATE SET (failure_count, error, last_failed_us) =
             (failure_count + 1, EXCLUDED.error, EXCLUDED.last_failed_us)
         RETURNING failure_count",
        params![
            projection,
            event.instance_id(),
            event.aggregate_type().as_str(),
            event.aggregate_id(),
            to_i64(event.sequence),
            to_i64(event.position),
            error,
            Utc::now().timestamp_micros(),
        ],
        |row| row.get(0),
    )
}

/// Failures recorded so far for `event`; 0 if none.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn failure_count(conn: &Connection, projection: &str, event: &BaseEvent) -> rusqlite::Result<u32> {
    let count = conn
        .query_row(
            "SELECT failure_count FROM projections.failed_events
             WHERE projection_name = ?1 AND instance_id = ?2 AND aggregate_type = ?3
               AND aggregate_id = ?4 AND event_sequence = ?5",
            params![
                projection,
                event.instance_id(),
                event.aggregate_type().as_str(),
                event.aggregate_id(),
                to_i64(event.sequence),
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0))
}

/// Recorded failures, optionally of one projection, oldest position first.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn list(conn: &Connection, projection: Option<&str>) -> rusqlite::Result<Vec<FailedEvent>> {
    let mut stmt = conn.prepare(
        "SELECT projection_name, instance_id, aggregate_type, aggregate_id, event_sequence,
                position, failure_count, error, last_failed_us
         FROM projections.failed_events
         WHERE ?1 IS NULL OR projection_name = ?1
         ORDER BY projection_name, instance_id, position",
    )?;
    let rows = stmt
        .query_map(params![projection], |row| {
            Ok(FailedEvent {
                projection_name: row.get(0)?,
                instance_id: row.get(1)?,
                aggregate_type: row.get(2)?,
                aggregate_id: row.get(3)?,
                event_sequence: to_u64(row.get(4)?),
                position: to_u64(row.get(5)?),
                failure_count: row.get(6)?,
                error: row.get(7)?,
                last_failed: DateTime::from_timestamp_micros(row.get(8)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Forget failures of one tenant, or of every tenant of the projection.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn reset(conn: &Connection, projection: &str, instance_id: Option<&str>) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM projections.failed_events
         WHERE projection_name = ?1 AND (?2 IS NULL OR instance_id = ?2)",
        params![projection, instance_id],
    )
}
