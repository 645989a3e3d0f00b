//! Port to the append-only event log.
//!
//! Projections only read from the store ([`EventStore::filter`],
//! [`EventStore::instance_ids`]); [`EventStore::push`] exists for hosts and
//! tests that need to seed events.

mod memory;
mod sqlite;

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::event::{Aggregate, AggregateType, BaseEvent, EventType, StoredEvent};

/// Errors surfaced by an event store implementation.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("event store unavailable: {0}")]
    Unavailable(String),
    #[error("event store query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("event payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("stored event is corrupt: {0}")]
    Corrupt(String),
}

/// Filter over the event log.
///
/// Empty lists mean "no restriction". Results are ordered by position,
/// ascending unless [`SearchQuery::descending`] is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub instance_id: Option<String>,
    pub aggregate_types: Vec<AggregateType>,
    pub aggregate_ids: Vec<String>,
    pub event_types: Vec<EventType>,
    pub resource_owner: Option<String>,
    /// Only events with a position strictly greater than this.
    pub position_after: Option<u64>,
    pub limit: Option<usize>,
    pub descending: bool,
}

impl SearchQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    #[must_use]
    pub fn aggregate_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        self.aggregate_types.extend(types.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn aggregate_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.aggregate_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn event_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        self.event_types.extend(types.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn resource_owner(mut self, owner: impl Into<String>) -> Self {
        self.resource_owner = Some(owner.into());
        self
    }

    #[must_use]
    pub const fn position_after(mut self, position: u64) -> Self {
        self.position_after = Some(position);
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Whether an event passes every filter except limit and order.
    #[must_use]
    pub fn matches(&self, event: &BaseEvent) -> bool {
        self.instance_id
            .as_deref()
            .is_none_or(|id| event.instance_id() == id)
            && (self.aggregate_types.is_empty()
                || self.aggregate_types.contains(event.aggregate_type()))
            && (self.aggregate_ids.is_empty()
                || self.aggregate_ids.iter().any(|id| id == event.aggregate_id()))
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self
                .resource_owner
                .as_deref()
                .is_none_or(|owner| event.resource_owner() == owner)
            && self.position_after.is_none_or(|after| event.position > after)
    }
}

/// A request to append one event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Command {
    pub aggregate: Aggregate,
    pub event_type: EventType,
    #[serde(default)]
    pub editor_user: String,
    #[serde(default)]
    pub editor_service: String,
    /// JSON payload. `null` stores an empty payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Command {
    #[must_use]
    pub fn new(aggregate: Aggregate, event_type: impl Into<EventType>) -> Self {
        Self {
            aggregate,
            event_type: event_type.into(),
            editor_user: String::new(),
            editor_service: String::new(),
            payload: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn editor(mut self, user: impl Into<String>, service: impl Into<String>) -> Self {
        self.editor_user = user.into();
        self.editor_service = service.into();
        self
    }

    fn payload_bytes(&self) -> Result<Vec<u8>, EventStoreError> {
        if self.payload.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::to_vec(&self.payload)?)
    }

    fn into_stored(
        self,
        sequence: u64,
        previous_sequence: u64,
        position: u64,
        creation_date: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> StoredEvent {
        StoredEvent {
            base: BaseEvent {
                aggregate: self.aggregate,
                event_type: self.event_type,
                sequence,
                previous_sequence,
                position,
                creation_date,
                editor_user: self.editor_user,
                editor_service: self.editor_service,
            },
            payload,
        }
    }
}

/// The narrow interface the projection engine consumes.
pub trait EventStore: Send + Sync {
    /// Events matching `query`, ordered by position.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] if the store cannot be read.
    fn filter(&self, query: &SearchQuery) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Number of events matching `query`. Limit and order are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] if the store cannot be read.
    fn count(&self, query: &SearchQuery) -> Result<usize, EventStoreError>;

    /// Append commands atomically, assigning sequence and position.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] if nothing could be appended.
    fn push(&self, commands: Vec<Command>) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Tenants that have events matching `query`.
    ///
    /// With `lookback`, only tenants with a matching event created within that
    /// window are returned. With `distinct`, each tenant is listed once.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] if the store cannot be read.
    fn instance_ids(
        &self,
        lookback: Option<Duration>,
        distinct: bool,
        query: &SearchQuery,
    ) -> Result<Vec<String>, EventStoreError>;

    /// Position of the newest event matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] if the store cannot be read.
    fn latest_position(&self, query: &SearchQuery) -> Result<Option<u64>, EventStoreError> {
        let mut query = query.clone();
        query.descending = true;
        query.limit = Some(1);
        Ok(self.filter(&query)?.first().map(|event| event.base.position))
    }
}

fn lookback_cutoff(lookback: Option<Duration>) -> Option<DateTime<Utc>> {
    lookback
        .and_then(|window| chrono::Duration::from_std(window).ok())
        .and_then(|window| Utc::now().checked_sub_signed(window))
}
