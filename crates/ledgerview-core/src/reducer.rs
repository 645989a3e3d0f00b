//! Reducer contract and the routing table that dispatches events to reducers.
//!
//! A reducer is a pure function of one event. It matches the event data it
//! was written for and returns [`ProjectionError::InvalidArgument`] for
//! anything else; the routing table guarantees it is only called for the
//! `(aggregate type, event type)` pairs it was registered under, so that
//! error signals a registration bug.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProjectionError;
use crate::event::{
    AggregateType, BaseEvent, Event, EventType, INSTANCE_AGGREGATE, INSTANCE_REMOVED,
    ORG_AGGREGATE, ORG_REMOVED,
};
use crate::eventstore::SearchQuery;
use crate::statement::{new_delete_statement, Condition, Statement};

/// `(event) -> statement` for one event type.
pub type ReduceFn<D> = Arc<dyn Fn(&Event<D>) -> Result<Statement, ProjectionError> + Send + Sync>;

/// Reducer registered for one event type.
pub struct EventReducer<D> {
    pub event: EventType,
    pub reduce: ReduceFn<D>,
}

impl<D> EventReducer<D> {
    pub fn new<F>(event: impl Into<EventType>, reduce: F) -> Self
    where
        F: Fn(&Event<D>) -> Result<Statement, ProjectionError> + Send + Sync + 'static,
    {
        Self {
            event: event.into(),
            reduce: Arc::new(reduce),
        }
    }

    pub fn from_fn(event: impl Into<EventType>, reduce: ReduceFn<D>) -> Self {
        Self {
            event: event.into(),
            reduce,
        }
    }
}

impl<D> Clone for EventReducer<D> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
            reduce: Arc::clone(&self.reduce),
        }
    }
}

impl<D> std::fmt::Debug for EventReducer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReducer")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// The reducers of one aggregate type.
#[derive(Debug)]
pub struct AggregateReducer<D> {
    pub aggregate: AggregateType,
    pub event_reducers: Vec<EventReducer<D>>,
}

impl<D> AggregateReducer<D> {
    pub fn new(aggregate: impl Into<AggregateType>, event_reducers: Vec<EventReducer<D>>) -> Self {
        Self {
            aggregate: aggregate.into(),
            event_reducers,
        }
    }
}

impl<D: 'static> AggregateReducer<D> {
    /// `instance.removed` wired to [`reduce_instance_removed_helper`].
    pub fn instance_removed(instance_column: &str) -> Self {
        Self::new(
            INSTANCE_AGGREGATE,
            vec![EventReducer::from_fn(
                INSTANCE_REMOVED,
                reduce_instance_removed_helper(instance_column),
            )],
        )
    }

    /// `org.removed` wired to [`reduce_owner_removed_helper`].
    pub fn org_removed(instance_column: &str, owner_column: &str) -> Self {
        Self::new(
            ORG_AGGREGATE,
            vec![EventReducer::from_fn(
                ORG_REMOVED,
                reduce_owner_removed_helper(instance_column, owner_column),
            )],
        )
    }
}

/// Immutable `(aggregate type, event type) -> reducer` map.
///
/// Built once when a handler is created and never modified afterwards.
pub struct RoutingTable<D> {
    routes: HashMap<(AggregateType, EventType), ReduceFn<D>>,
    aggregate_types: Vec<AggregateType>,
    event_types: Vec<EventType>,
}

impl<D> RoutingTable<D> {
    /// Build the table. Entries for the same aggregate type are merged; a
    /// later registration of the same pair replaces the earlier one.
    #[must_use]
    pub fn new(reducers: Vec<AggregateReducer<D>>) -> Self {
        let mut routes = HashMap::new();
        let mut aggregate_types: Vec<AggregateType> = Vec::new();
        let mut event_types: Vec<EventType> = Vec::new();

        for aggregate in reducers {
            if !aggregate_types.contains(&aggregate.aggregate) {
                aggregate_types.push(aggregate.aggregate.clone());
            }
            for reducer in aggregate.event_reducers {
                if !event_types.contains(&reducer.event) {
                    event_types.push(reducer.event.clone());
                }
                let key = (aggregate.aggregate.clone(), reducer.event);
                if routes.insert(key.clone(), reducer.reduce).is_some() {
                    tracing::warn!(
                        aggregate_type = %key.0,
                        event_type = %key.1,
                        "reducer registered twice, keeping the later one"
                    );
                }
            }
        }

        Self {
            routes,
            aggregate_types,
            event_types,
        }
    }

    #[must_use]
    pub fn lookup(&self, aggregate: &AggregateType, event: &EventType) -> Option<&ReduceFn<D>> {
        self.routes.get(&(aggregate.clone(), event.clone()))
    }

    /// Whether the pair of `event` has a reducer.
    #[must_use]
    pub fn subscribes(&self, event: &BaseEvent) -> bool {
        self.lookup(event.aggregate_type(), &event.event_type).is_some()
    }

    /// Dispatch `event`. `None` means this projection is not subscribed.
    pub fn reduce(&self, event: &Event<D>) -> Option<Result<Statement, ProjectionError>> {
        self.lookup(event.base.aggregate_type(), &event.base.event_type)
            .map(|reduce| reduce(event))
    }

    #[must_use]
    pub fn aggregate_types(&self) -> &[AggregateType] {
        &self.aggregate_types
    }

    #[must_use]
    pub fn event_types(&self) -> &[EventType] {
        &self.event_types
    }

    /// Number of registered pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Event-store query for everything this table subscribes to.
    #[must_use]
    pub fn search_query(&self) -> SearchQuery {
        SearchQuery::new()
            .aggregate_types(self.aggregate_types.iter().cloned())
            .event_types(self.event_types.iter().cloned())
    }
}

impl<D> std::fmt::Debug for RoutingTable<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("aggregate_types", &self.aggregate_types)
            .field("event_types", &self.event_types)
            .finish_non_exhaustive()
    }
}

/// Deletes every row of the removed tenant: `DELETE .. WHERE (<instance_column> = ?1)`.
pub fn reduce_instance_removed_helper<D: 'static>(instance_column: &str) -> ReduceFn<D> {
    let column = instance_column.to_owned();
    Arc::new(move |event: &Event<D>| {
        if event.base.event_type != INSTANCE_REMOVED {
            return Err(ProjectionError::invalid_argument(
                &event.base.event_type,
                &[INSTANCE_REMOVED],
            ));
        }
        Ok(new_delete_statement(
            event,
            vec![Condition::equals(column.as_str(), event.base.aggregate.id.as_str())],
        ))
    })
}

/// Deletes the rows of a removed organization within its tenant.
pub fn reduce_owner_removed_helper<D: 'static>(
    instance_column: &str,
    owner_column: &str,
) -> ReduceFn<D> {
    let instance_column = instance_column.to_owned();
    let owner_column = owner_column.to_owned();
    Arc::new(move |event: &Event<D>| {
        if event.base.event_type != ORG_REMOVED {
            return Err(ProjectionError::invalid_argument(
                &event.base.event_type,
                &[ORG_REMOVED],
            ));
        }
        Ok(new_delete_statement(
            event,
            vec![
                Condition::equals(instance_column.as_str(), event.base.instance_id()),
                Condition::equals(owner_column.as_str(), event.base.aggregate_id()),
            ],
        ))
    })
}
