//! `SQLite` projection database utilities.
//!
//! The projection database is attached to each connection as schema
//! `projections`, so projection tables are addressed as
//! `projections.<table>` regardless of where the file lives.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so the event store and readers are not blocked by batches
//! - `busy_timeout = 5s` to absorb short lock waits between handler workers
//! - `foreign_keys = ON` so side tables cascade with their main table

pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::{path::Path, time::Duration};

use crate::lock::InitLock;

/// Name under which the projection database is attached.
pub const PROJECTIONS_SCHEMA: &str = "projections";

/// Busy timeout used for projection DB connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for another process to finish migrating.
const INIT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Open (or create) the projection database, apply runtime pragmas and
/// migrate the engine tables to the latest version.
///
/// Journal mode switches and migrations are serialized across processes with
/// an advisory lock file next to the database.
///
/// # Errors
///
/// Returns an error if opening, configuring or migrating the database fails.
pub fn open_projection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create projection db directory {}", parent.display()))?;
    }

    let mut conn = Connection::open_in_memory().context("open sqlite connection")?;
    conn.busy_timeout(busy_timeout)?;
    let file = path
        .to_str()
        .with_context(|| format!("projection path is not UTF-8: {}", path.display()))?;
    conn.execute("ATTACH DATABASE ?1 AS projections", [file])
        .with_context(|| format!("attach projection database {}", path.display()))?;
    let lock = InitLock::acquire(&InitLock::path_for(path), INIT_LOCK_TIMEOUT)
        .context("acquire projection init lock")?;
    configure_connection(&conn).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply projection migrations")?;
    lock.release();

    Ok(conn)
}

/// Open a throwaway in-memory projection database, fully migrated.
///
/// # Errors
///
/// Returns an error if `SQLite` cannot allocate or migrate the database.
pub fn open_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory().context("open sqlite connection")?;
    conn.execute_batch("ATTACH DATABASE ':memory:' AS projections")
        .context("attach in-memory projection database")?;
    configure_connection(&conn).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply projection migrations")?;
    Ok(conn)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch("PRAGMA projections.synchronous = NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA projections.journal_mode = WAL", [], |row| row.get(0))?;
    Ok(())
}
