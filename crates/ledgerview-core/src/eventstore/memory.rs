use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;

use super::{lookback_cutoff, Command, EventStore, EventStoreError, SearchQuery};
use crate::event::StoredEvent;

/// In-process event log. Positions start at 1.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<StoredEvent>>,
}

impl MemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append already-built events verbatim, keeping their metadata.
    ///
    /// Handy for replaying fixtures whose positions and sequences must match
    /// expected output exactly.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Corrupt`] if a position does not increase.
    pub fn append_raw(&self, events: Vec<StoredEvent>) -> Result<(), EventStoreError> {
        let mut log = self.lock()?;
        for event in events {
            let last = log.last().map_or(0, |e| e.base.position);
            if event.base.position <= last {
                return Err(EventStoreError::Corrupt(format!(
                    "position {} does not follow {last}",
                    event.base.position
                )));
            }
            log.push(event);
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<StoredEvent>>, EventStoreError> {
        self.events
            .lock()
            .map_err(|_| EventStoreError::Unavailable("memory store mutex poisoned".into()))
    }
}

impl EventStore for MemoryEventStore {
    fn filter(&self, query: &SearchQuery) -> Result<Vec<StoredEvent>, EventStoreError> {
        let log = self.lock()?;
        let matching = log.iter().filter(|event| query.matches(&event.base));
        let limit = query.limit.unwrap_or(usize::MAX);
        let events = if query.descending {
            matching.rev().take(limit).cloned().collect()
        } else {
            matching.take(limit).cloned().collect()
        };
        Ok(events)
    }

    fn count(&self, query: &SearchQuery) -> Result<usize, EventStoreError> {
        Ok(self.lock()?.iter().filter(|event| query.matches(&event.base)).count())
    }

    fn push(&self, commands: Vec<Command>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut log = self.lock()?;

        let mut latest: HashMap<(String, String, String), u64> = HashMap::new();
        for event in log.iter() {
            let agg = &event.base.aggregate;
            latest.insert(
                (
                    agg.instance_id.clone(),
                    agg.aggregate_type.to_string(),
                    agg.id.clone(),
                ),
                event.base.sequence,
            );
        }

        let mut position = log.last().map_or(0, |e| e.base.position);
        let mut pushed = Vec::with_capacity(commands.len());
        for command in commands {
            let payload = command.payload_bytes()?;
            let key = (
                command.aggregate.instance_id.clone(),
                command.aggregate.aggregate_type.to_string(),
                command.aggregate.id.clone(),
            );
            let previous = latest.get(&key).copied().unwrap_or(0);
            let sequence = previous + 1;
            latest.insert(key, sequence);
            position += 1;
            pushed.push(command.into_stored(sequence, previous, position, Utc::now(), payload));
        }

        log.extend(pushed.iter().cloned());
        Ok(pushed)
    }

    fn instance_ids(
        &self,
        lookback: Option<Duration>,
        distinct: bool,
        query: &SearchQuery,
    ) -> Result<Vec<String>, EventStoreError> {
        let cutoff = lookback_cutoff(lookback);
        let log = self.lock()?;
        let mut ids: Vec<String> = Vec::new();
        for event in log.iter() {
            if !query.matches(&event.base) {
                continue;
            }
            if cutoff.is_some_and(|cutoff| event.base.creation_date < cutoff) {
                continue;
            }
            let id = event.base.instance_id();
            if distinct && ids.iter().any(|seen| seen == id) {
                continue;
            }
            ids.push(id.to_owned());
        }
        Ok(ids)
    }
}
