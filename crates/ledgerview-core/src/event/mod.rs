//! Events as consumed by projections.
//!
//! The event store hands out [`StoredEvent`]s: position metadata plus an
//! opaque payload. Before a reducer sees one it is decoded into an
//! [`Event<D>`], where `D` is the closed sum type of events a domain crate
//! knows about.

pub mod types;

pub use types::{AggregateType, EventType};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate type of tenant-level events.
pub const INSTANCE_AGGREGATE: &str = "instance";
/// Emitted when a tenant is deleted; every projection drops the tenant's rows.
pub const INSTANCE_REMOVED: &str = "instance.removed";
/// Aggregate type of organization-level events.
pub const ORG_AGGREGATE: &str = "org";
/// Emitted when an organization is deleted.
pub const ORG_REMOVED: &str = "org.removed";

/// Identity of the aggregate an event was written for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub id: String,
    #[serde(rename = "type")]
    pub aggregate_type: AggregateType,
    /// Owning organization (or the instance itself for instance-level data).
    pub resource_owner: String,
    /// Tenant.
    pub instance_id: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "v1".to_owned()
}

/// Metadata every event carries, independent of its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseEvent {
    pub aggregate: Aggregate,
    pub event_type: EventType,
    /// Monotonic per aggregate instance, starting at 1.
    pub sequence: u64,
    /// Sequence of the previous event of the same aggregate, 0 for the first.
    pub previous_sequence: u64,
    /// Store-wide commit position, strictly increasing across aggregates.
    pub position: u64,
    pub creation_date: DateTime<Utc>,
    pub editor_user: String,
    pub editor_service: String,
}

impl BaseEvent {
    #[must_use]
    pub fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate.aggregate_type
    }

    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate.id
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.aggregate.instance_id
    }

    #[must_use]
    pub fn resource_owner(&self) -> &str {
        &self.aggregate.resource_owner
    }
}

impl AsRef<Self> for BaseEvent {
    fn as_ref(&self) -> &Self {
        self
    }
}

/// An event exactly as the store returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    /// Raw JSON payload. Empty for events without data.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl AsRef<BaseEvent> for StoredEvent {
    fn as_ref(&self) -> &BaseEvent {
        &self.base
    }
}

/// A decoded event handed to reducers.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<D> {
    pub base: BaseEvent,
    pub data: D,
}

impl<D> AsRef<BaseEvent> for Event<D> {
    fn as_ref(&self) -> &BaseEvent {
        &self.base
    }
}

impl<D: EventData> Event<D> {
    /// Decode the payload of a stored event.
    ///
    /// # Errors
    ///
    /// Returns [`DataParseError`] if the `(aggregate type, event type)` pair is
    /// unknown to `D` or the payload does not match its shape.
    pub fn decode(stored: StoredEvent) -> Result<Self, DataParseError> {
        let data = D::decode(&stored.base, &stored.payload)?;
        Ok(Self {
            base: stored.base,
            data,
        })
    }
}

/// Closed set of typed event payloads of one domain.
pub trait EventData: Sized + Send + Sync + 'static {
    /// Decode a payload given the event's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`DataParseError::Unknown`] for pairs this type does not model
    /// and [`DataParseError::Payload`] for malformed JSON.
    fn decode(base: &BaseEvent, payload: &[u8]) -> Result<Self, DataParseError>;
}

/// Untyped payloads, useful for generic tooling and tests.
impl EventData for serde_json::Value {
    fn decode(base: &BaseEvent, payload: &[u8]) -> Result<Self, DataParseError> {
        if payload.is_empty() {
            return Ok(Self::Null);
        }
        serde_json::from_slice(payload).map_err(|source| DataParseError::Payload {
            event_type: base.event_type.clone(),
            source,
        })
    }
}

/// Decode a JSON payload into `T`, treating an empty payload as `{}`.
///
/// # Errors
///
/// Returns [`DataParseError::Payload`] when the JSON does not fit `T`.
pub fn decode_json<T: serde::de::DeserializeOwned>(
    base: &BaseEvent,
    payload: &[u8],
) -> Result<T, DataParseError> {
    let payload = if payload.is_empty() { b"{}".as_slice() } else { payload };
    serde_json::from_slice(payload).map_err(|source| DataParseError::Payload {
        event_type: base.event_type.clone(),
        source,
    })
}

/// Error returned when turning a stored payload into typed event data fails.
#[derive(Debug, thiserror::Error)]
pub enum DataParseError {
    #[error("no decoder for {event_type} on aggregate {aggregate_type}")]
    Unknown {
        aggregate_type: AggregateType,
        event_type: EventType,
    },
    #[error("invalid {event_type} data payload: {source}")]
    Payload {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {event_type} data: {reason}")]
    Invalid { event_type: EventType, reason: String },
}

impl DataParseError {
    #[must_use]
    pub fn unknown(base: &BaseEvent) -> Self {
        Self::Unknown {
            aggregate_type: base.aggregate_type().clone(),
            event_type: base.event_type.clone(),
        }
    }
}
