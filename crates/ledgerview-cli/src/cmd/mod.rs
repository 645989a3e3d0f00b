pub mod failed;
pub mod init;
pub mod push;
pub mod reset;
pub mod run;
pub mod status;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use ledgerview_core::config::{load_config, ProjectorConfig};
use ledgerview_core::db::open_projection;
use ledgerview_core::eventstore::{EventStore, SqliteEventStore};
use ledgerview_core::runner::ProjectionWorker;
use rusqlite::Connection;

/// Everything a command needs: config, event store, projection connection and
/// the registered projection workers with their schema in place.
pub struct Workspace {
    pub config: ProjectorConfig,
    pub conn: Connection,
    pub workers: Vec<Arc<dyn ProjectionWorker>>,
}

impl Workspace {
    /// Load config, open both databases and initialize every projection.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be loaded, a database cannot be
    /// opened or a projection schema cannot be applied.
    pub fn open(config_path: Option<&Path>) -> Result<Self> {
        let config = load_config(config_path)?;
        let store: Arc<dyn EventStore> = Arc::new(open_store(&config)?);
        let mut conn = open_projection_db(&config)?;
        let workers = ledgerview_iam::workers(&store, &config);
        for worker in &workers {
            worker
                .init(&mut conn)
                .with_context(|| format!("initialize {}", worker.name()))?;
        }
        Ok(Self {
            config,
            conn,
            workers,
        })
    }

    /// The worker registered under `name`, with or without the `projections.`
    /// schema prefix.
    pub fn worker(&self, name: &str) -> Option<&Arc<dyn ProjectionWorker>> {
        self.workers.iter().find(|worker| {
            worker.name() == name || worker.name().strip_prefix("projections.") == Some(name)
        })
    }
}

pub fn open_store(config: &ProjectorConfig) -> Result<SqliteEventStore> {
    SqliteEventStore::open(&config.database.eventstore_path, config.database.busy_timeout())
}

pub fn open_projection_db(config: &ProjectorConfig) -> Result<Connection> {
    open_projection(&config.database.projections_path, config.database.busy_timeout())
}
