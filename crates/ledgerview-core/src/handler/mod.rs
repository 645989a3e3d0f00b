//! The projection handler: turns subscribed events into projection rows.
//!
//! One [`Handler`] serves one projection across every tenant. Per tenant it
//! takes the `(projection, instance)` row lock, fetches the next batch after
//! the stored checkpoint, reduces it, and applies the statements together
//! with the new checkpoint in a single `BEGIN IMMEDIATE` transaction.

mod backoff;
pub mod checkpoint;
pub mod failed;
pub mod lock;
mod shutdown;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use backoff::Backoff;
pub use checkpoint::{CurrentState, Position};
pub use failed::FailedEvent;
pub use shutdown::Shutdown;

use crate::config::HandlerConfig;
use crate::db::schema::{self, Check};
use crate::error::ProjectionError;
use crate::event::{BaseEvent, Event, EventData, StoredEvent};
use crate::eventstore::EventStore;
use crate::lock::LockError;
use crate::reducer::{AggregateReducer, RoutingTable};
use crate::statement::{new_no_op_statement, Statement};

/// Attempts `trigger` makes per tenant before giving up on retryable errors.
const TRIGGER_ATTEMPTS: u32 = 5;

/// A read model fed by events of domain `D`.
pub trait Projection<D>: Send + Sync {
    /// Table name, e.g. `projections.org_members2`. Also keys checkpoints.
    fn name(&self) -> &str;

    fn reducers(&self) -> Vec<AggregateReducer<D>>;

    /// Tables to create before any event is applied.
    fn check(&self) -> Option<Check> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    Initializing,
    CatchingUp,
    Polling,
    Stopped,
    Errored,
}

/// Checkpoint and backlog of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub projection: String,
    pub instance_id: String,
    /// Position of the last applied event, 0 if none.
    pub position: u64,
    pub sequence: u64,
    /// Newest subscribed event in the store.
    pub head: u64,
    /// Subscribed events not applied yet.
    pub lag: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

struct Batch {
    applied: usize,
    full: bool,
}

pub struct Handler<D> {
    name: String,
    check: Option<Check>,
    routing: RoutingTable<D>,
    store: Arc<dyn EventStore>,
    config: HandlerConfig,
    locker_id: String,
    state: Mutex<HandlerState>,
}

impl<D: EventData> Handler<D> {
    /// Build a handler. The routing table is fixed from here on.
    pub fn new<P>(projection: &P, store: Arc<dyn EventStore>, config: HandlerConfig) -> Self
    where
        P: Projection<D> + ?Sized,
    {
        Self {
            name: projection.name().to_owned(),
            check: projection.check(),
            routing: RoutingTable::new(projection.reducers()),
            store,
            config,
            locker_id: format!("{}-{:016x}", std::process::id(), rand::random::<u64>()),
            state: Mutex::new(HandlerState::Initializing),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn routing(&self) -> &RoutingTable<D> {
        &self.routing
    }

    #[must_use]
    pub const fn config(&self) -> &HandlerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> HandlerState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, next: HandlerState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state != next {
            debug!(projection = %self.name, from = ?*state, to = ?next, "handler state");
            *state = next;
        }
    }

    /// Create or update the projection tables.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Schema`] if the check cannot be applied.
    pub fn init(&self, conn: &mut Connection) -> Result<(), ProjectionError> {
        if let Some(check) = &self.check {
            schema::init(conn, &self.name, check).inspect_err(|err| {
                error!(projection = %self.name, error = %err, "schema init failed");
            })?;
        }
        Ok(())
    }

    /// Run until `shutdown`: initialize, catch up every tenant, then poll.
    ///
    /// Retryable failures back off and retry. A non-retryable failure halts
    /// the handler only when `max_failure_count` is 0; otherwise the next
    /// attempts count towards the event's failure budget until it is skipped.
    ///
    /// # Errors
    ///
    /// Returns the halting error.
    pub fn run(&self, conn: &mut Connection, shutdown: &Shutdown) -> Result<(), ProjectionError> {
        self.set_state(HandlerState::Initializing);
        let mut backoff = Backoff::new(self.config.retry_failed_after(), self.config.max_backoff());
        while let Err(err) = self.init(conn) {
            let delay = backoff.next_delay();
            warn!(projection = %self.name, error = %err, attempt = backoff.attempt(), ?delay, "retrying schema init");
            if shutdown.wait(delay) {
                self.set_state(HandlerState::Stopped);
                return Ok(());
            }
        }

        self.set_state(HandlerState::CatchingUp);
        backoff.reset();
        while !shutdown.is_cancelled() {
            let wait = match self.trigger_known(conn, shutdown) {
                Ok(applied) => {
                    backoff.reset();
                    if self.state() == HandlerState::CatchingUp {
                        info!(projection = %self.name, applied, "caught up");
                        self.set_state(HandlerState::Polling);
                    } else if applied > 0 {
                        debug!(projection = %self.name, applied, "poll applied events");
                    }
                    self.config.requeue_every()
                }
                Err(ProjectionError::Cancelled) => break,
                Err(err) if err.is_retryable() || self.config.max_failure_count > 0 => {
                    let delay = backoff.next_delay();
                    warn!(projection = %self.name, error = %err, code = %err.code(), ?delay, "projection cycle failed, retrying");
                    delay
                }
                Err(err) => {
                    error!(projection = %self.name, error = %err, code = %err.code(), "projection halted");
                    self.set_state(HandlerState::Errored);
                    return Err(err);
                }
            };
            if shutdown.wait(wait) {
                break;
            }
        }
        self.set_state(HandlerState::Stopped);
        Ok(())
    }

    /// Process every tenant that has subscribed events.
    ///
    /// # Errors
    ///
    /// See [`Handler::trigger`].
    pub fn trigger_known(&self, conn: &mut Connection, shutdown: &Shutdown) -> Result<usize, ProjectionError> {
        let instances = self.store.instance_ids(
            self.config.instance_lookback(),
            true,
            &self.routing.search_query(),
        )?;
        self.trigger(conn, &instances, shutdown)
    }

    /// Process the given tenants until each is caught up. Returns the number
    /// of events applied.
    ///
    /// A tenant locked by another worker is left to that worker. Retryable
    /// failures are retried with backoff a few times. A failing tenant does
    /// not stop the others: its error is reported once every tenant had its
    /// turn.
    ///
    /// # Errors
    ///
    /// Returns the first tenant error (non-retryable, or retryable with the
    /// attempts used up) or [`ProjectionError::Cancelled`].
    pub fn trigger(
        &self,
        conn: &mut Connection,
        instances: &[String],
        shutdown: &Shutdown,
    ) -> Result<usize, ProjectionError> {
        let mut total = 0;
        let mut first_error = None;
        for instance_id in instances {
            let mut backoff = Backoff::new(self.config.retry_failed_after(), self.config.max_backoff());
            loop {
                if shutdown.is_cancelled() {
                    return Err(ProjectionError::Cancelled);
                }
                match self.process_instance(conn, instance_id, shutdown) {
                    Ok(applied) => {
                        total += applied;
                        break;
                    }
                    Err(ProjectionError::Cancelled) => return Err(ProjectionError::Cancelled),
                    Err(ProjectionError::Lock(LockError::Held { holder, .. })) => {
                        debug!(projection = %self.name, instance_id = %instance_id, %holder, "tenant busy in another worker");
                        break;
                    }
                    Err(err) if err.is_retryable() && backoff.attempt() + 1 < TRIGGER_ATTEMPTS => {
                        let delay = backoff.next_delay();
                        warn!(
                            projection = %self.name,
                            instance_id = %instance_id,
                            error = %err,
                            attempt = backoff.attempt(),
                            ?delay,
                            "batch failed, retrying"
                        );
                        if shutdown.wait(delay) {
                            return Err(ProjectionError::Cancelled);
                        }
                    }
                    Err(err) => {
                        error!(
                            projection = %self.name,
                            instance_id = %instance_id,
                            error = %err,
                            code = %err.code(),
                            "tenant failed, continuing with the rest"
                        );
                        first_error = first_error.or(Some(err));
                        break;
                    }
                }
            }
        }
        first_error.map_or(Ok(total), Err)
    }

    fn process_instance(
        &self,
        conn: &mut Connection,
        instance_id: &str,
        shutdown: &Shutdown,
    ) -> Result<usize, ProjectionError> {
        lock::acquire(
            conn,
            &self.name,
            instance_id,
            &self.locker_id,
            self.config.lock_ttl(),
            self.config.lock_wait(),
            shutdown,
        )?;
        let result = self.drain(conn, instance_id, shutdown);
        if let Err(err) = lock::release(conn, &self.name, instance_id, &self.locker_id) {
            warn!(projection = %self.name, instance_id, error = %err, "releasing lock failed");
        }
        result
    }

    fn drain(&self, conn: &mut Connection, instance_id: &str, shutdown: &Shutdown) -> Result<usize, ProjectionError> {
        let mut applied = 0;
        loop {
            let batch = self.batch(conn, instance_id, shutdown)?;
            applied += batch.applied;
            if !batch.full {
                return Ok(applied);
            }
            if shutdown.is_cancelled() {
                return Err(ProjectionError::Cancelled);
            }
        }
    }

    fn batch(&self, conn: &mut Connection, instance_id: &str, shutdown: &Shutdown) -> Result<Batch, ProjectionError> {
        let deadline = Instant::now() + self.config.transaction_timeout();
        let limit = self.config.bulk_limit.max(1);
        let from = checkpoint::read_position(conn, &self.name, instance_id)?;
        let events = self.store.filter(
            &self
                .routing
                .search_query()
                .instance_id(instance_id)
                .position_after(from)
                .limit(limit),
        )?;
        if events.is_empty() {
            return Ok(Batch {
                applied: 0,
                full: false,
            });
        }
        let full = events.len() >= limit;

        let mut reduced = Vec::with_capacity(events.len());
        for stored in events {
            if shutdown.is_cancelled() {
                return Err(ProjectionError::Cancelled);
            }
            let base = stored.base.clone();
            reduced.push((base, self.reduce(stored)));
        }

        let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        lock::renew(&tx, &self.name, instance_id, &self.locker_id, self.config.lock_ttl())?;
        let found = checkpoint::read_position(&tx, &self.name, instance_id)?;
        if found != from {
            return Err(ProjectionError::CheckpointConflict {
                projection: self.name.clone(),
                instance_id: instance_id.to_owned(),
                expected: from,
                found,
            });
        }

        let mut last = None;
        let mut applied = 0;
        let mut halt = None;
        for (base, statement) in reduced {
            if shutdown.is_cancelled() {
                return Err(ProjectionError::Cancelled);
            }
            if Instant::now() > deadline {
                return Err(ProjectionError::Timeout(self.config.transaction_timeout()));
            }
            let outcome = statement.and_then(|statement| {
                let savepoint = tx.savepoint()?;
                statement.execute(&*savepoint, &self.name)?;
                savepoint.commit()?;
                Ok(())
            });
            match outcome {
                Ok(()) => {
                    last = Some(Position::from(&base));
                    applied += 1;
                }
                Err(err) if err.is_retryable() => {
                    self.log_event_failure(instance_id, &base, &err, None);
                    return Err(err);
                }
                Err(err) => {
                    let count = failed::record_failure(&tx, &self.name, &base, &err.to_string())?;
                    let max = self.config.max_failure_count;
                    self.log_event_failure(instance_id, &base, &err, Some(count));
                    if max == 0 || count < max {
                        halt = Some(err);
                        break;
                    }
                    last = Some(Position::from(&base));
                }
            }
        }

        if let Some(at) = &last {
            checkpoint::write(&tx, &self.name, instance_id, at)?;
        }
        tx.commit()?;

        if let Some(err) = halt {
            return Err(err);
        }
        debug!(
            projection = %self.name,
            instance_id,
            applied,
            position = last.as_ref().map_or(from, |at| at.position),
            "batch committed"
        );
        Ok(Batch { applied, full })
    }

    fn log_event_failure(
        &self,
        instance_id: &str,
        base: &BaseEvent,
        err: &ProjectionError,
        failure_count: Option<u32>,
    ) {
        let Some(count) = failure_count else {
            warn!(
                projection = %self.name,
                instance_id,
                event_type = %base.event_type,
                sequence = base.sequence,
                position = base.position,
                aggregate_id = base.aggregate_id(),
                error = %err,
                "statement failed, rolling back batch"
            );
            return;
        };
        let max = self.config.max_failure_count;
        if max == 0 || count < max {
            error!(
                projection = %self.name,
                instance_id,
                event_type = %base.event_type,
                sequence = base.sequence,
                position = base.position,
                aggregate_id = base.aggregate_id(),
                failure_count = count,
                code = %err.code(),
                error = %err,
                "event failed"
            );
        } else {
            error!(
                projection = %self.name,
                instance_id,
                event_type = %base.event_type,
                sequence = base.sequence,
                position = base.position,
                aggregate_id = base.aggregate_id(),
                failure_count = count,
                code = %err.code(),
                error = %err,
                "skipping event, failure budget exhausted"
            );
        }
    }

    /// Decode and reduce one event. Pairs this projection does not subscribe
    /// to become no-ops so the checkpoint still moves past them.
    fn reduce(&self, stored: StoredEvent) -> Result<Statement, ProjectionError> {
        if !self.routing.subscribes(&stored.base) {
            return Ok(new_no_op_statement(&stored));
        }
        let event_type = stored.base.event_type.clone();
        let sequence = stored.base.sequence;
        let event = Event::<D>::decode(stored).map_err(|source| ProjectionError::Conversion {
            event_type,
            sequence,
            source,
        })?;
        self.routing
            .reduce(&event)
            .unwrap_or_else(|| Ok(new_no_op_statement(&event)))
    }

    /// Checkpoint, store head and backlog of one tenant.
    ///
    /// # Errors
    ///
    /// Returns storage or event store errors.
    pub fn status(&self, conn: &Connection, instance_id: &str) -> Result<Status, ProjectionError> {
        let state = checkpoint::read(conn, &self.name, instance_id)?;
        let query = self.routing.search_query().instance_id(instance_id);
        let head = self.store.latest_position(&query)?.unwrap_or(0);
        let position = state.as_ref().map_or(0, |s| s.position);
        let lag = self.store.count(&query.position_after(position))?;
        Ok(Status {
            projection: self.name.clone(),
            instance_id: instance_id.to_owned(),
            position,
            sequence: state.as_ref().map_or(0, |s| s.sequence),
            head,
            lag,
            last_updated: state.and_then(|s| s.last_updated),
        })
    }

    /// [`Handler::status`] of every tenant that has events or a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns storage or event store errors.
    pub fn statuses(&self, conn: &Connection) -> Result<Vec<Status>, ProjectionError> {
        let mut instances = self
            .store
            .instance_ids(None, true, &self.routing.search_query())?;
        for state in checkpoint::list(conn, Some(&self.name))? {
            if !instances.contains(&state.instance_id) {
                instances.push(state.instance_id);
            }
        }
        instances.sort();
        instances
            .iter()
            .map(|instance_id| self.status(conn, instance_id))
            .collect()
    }

    /// Failure rows of this projection.
    ///
    /// # Errors
    ///
    /// Returns any `SQLite` error.
    pub fn failed_events(&self, conn: &Connection) -> Result<Vec<FailedEvent>, ProjectionError> {
        Ok(failed::list(conn, Some(&self.name))?)
    }

    /// Drop projected rows, checkpoint and failures of one tenant, or of all
    /// tenants, so the next run replays from the first event.
    ///
    /// # Errors
    ///
    /// Returns any `SQLite` error; nothing is changed in that case.
    pub fn reset(&self, conn: &mut Connection, instance_id: Option<&str>) -> Result<usize, ProjectionError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = match &self.check {
            Some(check) => schema::truncate(&tx, &self.name, check, instance_id)?,
            None => 0,
        };
        checkpoint::reset(&tx, &self.name, instance_id)?;
        failed::reset(&tx, &self.name, instance_id)?;
        tx.commit()?;
        info!(projection = %self.name, instance_id = instance_id.unwrap_or("*"), rows, "projection reset");
        Ok(rows)
    }
}

impl<D> std::fmt::Debug for Handler<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("routing", &self.routing)
            .field("config", &self.config)
            .field("locker_id", &self.locker_id)
            .finish_non_exhaustive()
    }
}
