//! Hosting several handlers: one OS thread and one connection per projection.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use rusqlite::Connection;
use tracing::{error, info};

use crate::error::ProjectionError;
use crate::event::EventData;
use crate::handler::{FailedEvent, Handler, HandlerState, Shutdown, Status};

/// A [`Handler`] with its event domain erased, so handlers of different
/// domains can be hosted side by side.
pub trait ProjectionWorker: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// See [`Handler::init`].
    fn init(&self, conn: &mut Connection) -> Result<(), ProjectionError>;

    /// # Errors
    ///
    /// See [`Handler::run`].
    fn run(&self, conn: &mut Connection, shutdown: &Shutdown) -> Result<(), ProjectionError>;

    /// # Errors
    ///
    /// See [`Handler::trigger_known`].
    fn trigger_known(&self, conn: &mut Connection, shutdown: &Shutdown) -> Result<usize, ProjectionError>;

    /// # Errors
    ///
    /// See [`Handler::statuses`].
    fn statuses(&self, conn: &Connection) -> Result<Vec<Status>, ProjectionError>;

    /// # Errors
    ///
    /// See [`Handler::failed_events`].
    fn failed_events(&self, conn: &Connection) -> Result<Vec<FailedEvent>, ProjectionError>;

    /// # Errors
    ///
    /// See [`Handler::reset`].
    fn reset(&self, conn: &mut Connection, instance_id: Option<&str>) -> Result<usize, ProjectionError>;

    fn state(&self) -> HandlerState;
}

impl<D: EventData> ProjectionWorker for Handler<D> {
    fn name(&self) -> &str {
        Handler::name(self)
    }

    fn init(&self, conn: &mut Connection) -> Result<(), ProjectionError> {
        Handler::init(self, conn)
    }

    fn run(&self, conn: &mut Connection, shutdown: &Shutdown) -> Result<(), ProjectionError> {
        Handler::run(self, conn, shutdown)
    }

    fn trigger_known(&self, conn: &mut Connection, shutdown: &Shutdown) -> Result<usize, ProjectionError> {
        Handler::trigger_known(self, conn, shutdown)
    }

    fn statuses(&self, conn: &Connection) -> Result<Vec<Status>, ProjectionError> {
        Handler::statuses(self, conn)
    }

    fn failed_events(&self, conn: &Connection) -> Result<Vec<FailedEvent>, ProjectionError> {
        Handler::failed_events(self, conn)
    }

    fn reset(&self, conn: &mut Connection, instance_id: Option<&str>) -> Result<usize, ProjectionError> {
        Handler::reset(self, conn, instance_id)
    }

    fn state(&self) -> HandlerState {
        Handler::state(self)
    }
}

/// Running handler threads.
pub struct Runner {
    shutdown: Shutdown,
    threads: Vec<(String, JoinHandle<Result<(), ProjectionError>>)>,
}

impl Runner {
    /// Open one connection per worker with `open`, then start each worker's
    /// [`ProjectionWorker::run`] on its own thread.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection cannot be opened or a thread cannot
    /// be spawned. Workers already started are stopped again.
    pub fn spawn<F>(
        workers: Vec<Arc<dyn ProjectionWorker>>,
        open: F,
        shutdown: Shutdown,
    ) -> anyhow::Result<Self>
    where
        F: Fn() -> anyhow::Result<Connection>,
    {
        let mut runner = Self {
            shutdown,
            threads: Vec::with_capacity(workers.len()),
        };
        for worker in workers {
            let name = worker.name().to_owned();
            let started = open()
                .with_context(|| format!("open connection for {name}"))
                .and_then(|mut conn| {
                    let shutdown = runner.shutdown.clone();
                    thread::Builder::new()
                        .name(format!("lv-{name}"))
                        .spawn(move || worker.run(&mut conn, &shutdown))
                        .with_context(|| format!("spawn worker thread for {name}"))
                });
            match started {
                Ok(handle) => {
                    info!(projection = %name, "handler started");
                    runner.threads.push((name, handle));
                }
                Err(err) => {
                    runner.stop();
                    return Err(err);
                }
            }
        }
        Ok(runner)
    }

    #[must_use]
    pub const fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Wait for every worker to finish. Returns each worker's outcome.
    #[must_use]
    pub fn join(self) -> Vec<(String, Result<(), ProjectionError>)> {
        self.threads
            .into_iter()
            .map(|(name, handle)| {
                let outcome = handle.join().unwrap_or_else(|_| {
                    error!(projection = %name, "handler thread panicked");
                    Err(ProjectionError::Cancelled)
                });
                (name, outcome)
            })
            .collect()
    }

    /// Signal shutdown and wait for every worker.
    pub fn stop(self) -> Vec<(String, Result<(), ProjectionError>)> {
        self.shutdown.cancel();
        self.join()
    }
}
