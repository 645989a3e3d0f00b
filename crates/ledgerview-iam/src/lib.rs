#![forbid(unsafe_code)]
//! Read models of the identity and access management domain.
//!
//! Each module holds one projection: its table layout, its reducers and the
//! column names the read side queries by. All of them consume [`IamEvent`].
//!
//! # Conventions
//!
//! - Rows are keyed by `instance_id` first; `instance.removed` drops a
//!   tenant's rows from every projection.
//! - Organization-scoped rows follow the `resource_owner != instance_id`
//!   convention to tell org-owned from instance-wide data.

pub mod auth_request;
pub mod events;
pub mod idp_template;
pub mod key;
pub mod label_policy;
pub mod org_member;

use std::sync::Arc;

use ledgerview_core::config::ProjectorConfig;
use ledgerview_core::crypto::EncryptionAlgorithm;
use ledgerview_core::event::{BaseEvent, DataParseError};
use ledgerview_core::eventstore::EventStore;
use ledgerview_core::runner::ProjectionWorker;
use ledgerview_core::statement::Value;
use ledgerview_core::{Event, Handler, Projection, ProjectionError};
use serde::Serialize;

pub use auth_request::AuthRequestProjection;
pub use events::IamEvent;
pub use idp_template::IdpTemplateProjection;
pub use key::KeyProjection;
pub use label_policy::LabelPolicyProjection;
pub use org_member::OrgMemberProjection;

/// Handlers for every projection that needs no key material.
#[must_use]
pub fn workers(store: &Arc<dyn EventStore>, config: &ProjectorConfig) -> Vec<Arc<dyn ProjectionWorker>> {
    vec![
        worker(&OrgMemberProjection, store, config),
        worker(&AuthRequestProjection, store, config),
        worker(&LabelPolicyProjection, store, config),
        worker(&IdpTemplateProjection, store, config),
    ]
}

/// [`workers`] plus the signing key projection decrypting with `encryption`.
#[must_use]
pub fn workers_with_keys(
    store: &Arc<dyn EventStore>,
    config: &ProjectorConfig,
    encryption: Arc<dyn EncryptionAlgorithm>,
) -> Vec<Arc<dyn ProjectionWorker>> {
    let mut all = workers(store, config);
    all.push(worker(&KeyProjection::new(encryption), store, config));
    all
}

fn worker<P: Projection<IamEvent>>(
    projection: &P,
    store: &Arc<dyn EventStore>,
    config: &ProjectorConfig,
) -> Arc<dyn ProjectionWorker> {
    Arc::new(Handler::new(
        projection,
        Arc::clone(store),
        config.handler(projection.name()),
    ))
}

/// Log and build the error for an event a reducer was not written for.
pub(crate) fn wrong_event(event: &Event<IamEvent>, expected: &[&str]) -> ProjectionError {
    tracing::error!(
        event_type = %event.base.event_type,
        sequence = event.base.sequence,
        aggregate_id = %event.base.aggregate_id(),
        ?expected,
        "reducer called with unexpected event"
    );
    ProjectionError::invalid_argument(&event.base.event_type, expected)
}

/// Org-owned unless the owner is the tenant itself.
pub(crate) fn is_org_owned(base: &BaseEvent) -> bool {
    base.resource_owner() != base.instance_id()
}

/// Serialize a payload part into a JSON column value.
pub(crate) fn json_value<T: Serialize>(event: &Event<IamEvent>, value: &T) -> Result<Value, ProjectionError> {
    serde_json::to_value(value)
        .map(Value::Json)
        .map_err(|source| ProjectionError::Conversion {
            event_type: event.base.event_type.clone(),
            sequence: event.base.sequence,
            source: DataParseError::Payload {
                event_type: event.base.event_type.clone(),
                source,
            },
        })
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{TimeZone, Utc};
    use ledgerview_core::event::{Aggregate, BaseEvent};
    use ledgerview_core::statement::{Recorded, Recorder};
    use ledgerview_core::{Event, Statement};

    use crate::IamEvent;

    pub fn base(aggregate_type: &str, event_type: &str, sequence: u64) -> BaseEvent {
        BaseEvent {
            aggregate: Aggregate {
                id: "agg-id".into(),
                aggregate_type: aggregate_type.into(),
                resource_owner: "ro-id".into(),
                instance_id: "instance-id".into(),
                version: "v1".into(),
            },
            event_type: event_type.into(),
            sequence,
            previous_sequence: sequence.saturating_sub(1),
            position: sequence,
            creation_date: Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap(),
            editor_user: "editor-user".into(),
            editor_service: "editor-service".into(),
        }
    }

    pub fn event(aggregate_type: &str, event_type: &str, sequence: u64, data: IamEvent) -> Event<IamEvent> {
        Event {
            base: base(aggregate_type, event_type, sequence),
            data,
        }
    }

    /// Execute against a [`Recorder`] and return what it saw.
    pub fn recorded(stmt: &Statement, projection: &str) -> Vec<Recorded> {
        let recorder = Recorder::new();
        stmt.execute(&recorder, projection).unwrap();
        recorder.calls()
    }
}
