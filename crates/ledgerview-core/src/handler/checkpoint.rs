//! Per `(projection, instance)` checkpoints in `projections.current_states`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::event::BaseEvent;

/// Where a projection stands for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentState {
    pub projection_name: String,
    pub instance_id: String,
    /// Store-wide position of the last applied event.
    pub position: u64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Aggregate sequence of the last applied event.
    pub sequence: u64,
    pub event_date: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// The event a checkpoint is advanced to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub position: u64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub sequence: u64,
    pub event_date: DateTime<Utc>,
}

impl From<&BaseEvent> for Position {
    fn from(event: &BaseEvent) -> Self {
        Self {
            position: event.position,
            aggregate_type: event.aggregate_type().to_string(),
            aggregate_id: event.aggregate_id().to_owned(),
            sequence: event.sequence,
            event_date: event.creation_date,
        }
    }
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_date(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn from_micros(us: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
}

const SELECT: &str = "SELECT projection_name, instance_id, position, aggregate_type, aggregate_id,
        sequence, event_date, last_updated_us
     FROM projections.current_states";

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<CurrentState> {
    Ok(CurrentState {
        projection_name: row.get(0)?,
        instance_id: row.get(1)?,
        position: to_u64(row.get(2)?),
        aggregate_type: row.get(3)?,
        aggregate_id: row.get(4)?,
        sequence: to_u64(row.get(5)?),
        event_date: parse_date(row.get(6)?),
        last_updated: from_micros(row.get(7)?),
    })
}

/// Checkpoint of one tenant, `None` if nothing was applied yet.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn read(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
) -> rusqlite::Result<Option<CurrentState>> {
    conn.query_row(
        &format!("{SELECT} WHERE projection_name = ?1 AND instance_id = ?2"),
        params![projection, instance_id],
        row_to_state,
    )
    .optional()
}

/// Position to resume after; 0 when the tenant has no checkpoint.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn read_position(conn: &Connection, projection: &str, instance_id: &str) -> rusqlite::Result<u64> {
    Ok(read(conn, projection, instance_id)?.map_or(0, |state| state.position))
}

/// Advance the checkpoint. Never moves it backwards.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn write(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    at: &Position,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO projections.current_states (projection_name, instance_id, position,
             aggregate_type, aggregate_id, sequence, event_date, last_updated_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (projection_name, instance_id) DO UPDATE SET
             (position, aggregate_type, aggregate_id, sequence, event_date, last_updated_us) =
             (EXCLUDED.position, EXCLUDED.aggregate_type, EXCLUDED.aggregate_id,
              EXCLUDED.sequence, EXCLUDED.event_date, EXCLUDED.last_updated_us)
         WHERE EXCLUDED.position > position",
        params![
            projection,
            instance_id,
            to_i64(at.position),
            at.aggregate_type,
            at.aggregate_id,
            to_i64(at.sequence),
            at.event_date.to_rfc3339_opts(SecondsFormat::Micros, true),
            Utc::now().timestamp_micros(),
        ],
    )?;
    Ok(())
}

/// Remove checkpoints of one tenant, or of every tenant of the projection.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn reset(conn: &Connection, projection: &str, instance_id: Option<&str>) -> rusqlite::Result<usize> {
    match instance_id {
        Some(id) => conn.execute(
            "DELETE FROM projections.current_states WHERE projection_name = ?1 AND instance_id = ?2",
            params![projection, id],
        ),
        None => conn.execute(
            "DELETE FROM projections.current_states WHERE projection_name = ?1",
            params![projection],
        ),
    }
}

/// All checkpoints, optionally of one projection, ordered by name and tenant.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn list(conn: &Connection, projection: Option<&str>) -> rusqlite::Result<Vec<CurrentState>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT} WHERE ?1 IS NULL OR projection_name = ?1 ORDER BY projection_name, instance_id"
    ))?;
    let states = stmt
        .query_map(params![projection], row_to_state)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(states)
}
