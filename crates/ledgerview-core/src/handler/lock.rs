//! `(projection, instance)` row locks in `projections.locks`.
//!
//! A lock is a row with an owner and an expiry. Taking it is a conditional
//! upsert that only succeeds if the row is free, expired, or already ours, so
//! workers in different processes serialize on the same tenant without any
//! shared memory. Expiry bounds how long a crashed worker blocks others.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::checkpoint::to_i64;
use super::Shutdown;
use crate::error::{is_transient_sqlite, ProjectionError};
use crate::lock::LockError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

fn until_us(ttl: Duration) -> i64 {
    now_us().saturating_add(to_i64(u64::try_from(ttl.as_micros()).unwrap_or(u64::MAX)))
}

/// Try once. Returns `Ok(None)` when acquired, `Ok(Some(holder))` otherwise.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn try_acquire(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    locker_id: &str,
    ttl: Duration,
) -> rusqlite::Result<Option<String>> {
    let changed = conn.execute(
        "INSERT INTO projections.locks (projection_name, instance_id, locker_id, locked_until_us)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (projection_name, instance_id) DO UPDATE SET
             (locker_id, locked_until_us) = (EXCLUDED.locker_id, EXCLUDED.locked_until_us)
         WHERE locked_until_us < ?5 OR locker_id = ?3",
        params![projection, instance_id, locker_id, until_us(ttl), now_us()],
    )?;
    if changed == 1 {
        return Ok(None);
    }
    let holder = conn
        .query_row(
            "SELECT locker_id FROM projections.locks WHERE projection_name = ?1 AND instance_id = ?2",
            params![projection, instance_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(Some(holder.unwrap_or_default()))
}

/// Poll until the lock is ours, `wait` elapses or shutdown is signalled.
///
/// # Errors
///
/// Returns [`LockError::Held`] if another worker still holds the lock after
/// `wait`, [`ProjectionError::Cancelled`] on shutdown, and the storage error
/// if the database itself stays busy for `wait`.
pub fn acquire(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    locker_id: &str,
    ttl: Duration,
    wait: Duration,
    shutdown: &Shutdown,
) -> Result<(), ProjectionError> {
    let started = Instant::now();
    loop {
        let holder = match try_acquire(conn, projection, instance_id, locker_id, ttl) {
            Ok(None) => return Ok(()),
            Ok(Some(holder)) => holder,
            Err(err) if is_transient_sqlite(&err) && started.elapsed() < wait => {
                thread::sleep(POLL_INTERVAL.min(wait));
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if started.elapsed() >= wait {
            return Err(LockError::Held {
                projection: projection.to_owned(),
                instance_id: instance_id.to_owned(),
                holder,
                waited: started.elapsed(),
            }
            .into());
        }
        if shutdown.is_cancelled() {
            return Err(ProjectionError::Cancelled);
        }
        thread::sleep(POLL_INTERVAL.min(wait));
    }
}

/// Extend our lock. Inside the batch transaction this doubles as the check
/// that nobody took the lock over while the batch was being reduced.
///
/// # Errors
///
/// Returns [`LockError::Lost`] if the lock is no longer ours.
pub fn renew(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    locker_id: &str,
    ttl: Duration,
) -> Result<(), ProjectionError> {
    let changed = conn.execute(
        "UPDATE projections.locks SET locked_until_us = ?4
         WHERE projection_name = ?1 AND instance_id = ?2 AND locker_id = ?3",
        params![projection, instance_id, locker_id, until_us(ttl)],
    )?;
    if changed == 0 {
        return Err(LockError::Lost {
            projection: projection.to_owned(),
            instance_id: instance_id.to_owned(),
        }
        .into());
    }
    Ok(())
}

/// Drop our lock. Releasing a lock we no longer hold is a no-op.
///
/// # Errors
///
/// Returns any `SQLite` error.
pub fn release(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    locker_id: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM projections.locks
         WHERE projection_name = ?1 AND instance_id = ?2 AND locker_id = ?3",
        params![projection, instance_id, locker_id],
    )?;
    Ok(())
}
