//! ledgerview-core library.
//!
//! Replays an append-only event log into relational read tables. Reducers
//! turn events into [`statement::Statement`]s, a [`handler::Handler`] applies
//! them per tenant together with a checkpoint, and [`db::schema`] keeps the
//! target tables in shape.
//!
//! # Conventions
//!
//! - **Errors**: typed errors with `thiserror` in the library, `anyhow::Result`
//!   where databases are opened or config files read.
//! - **Logging**: `tracing` macros with `projection`, `instance_id`,
//!   `event_type`, `sequence` and `aggregate_id` fields.

#![forbid(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod event;
pub mod eventstore;
pub mod handler;
pub mod lock;
pub mod reducer;
pub mod runner;
pub mod statement;

pub use error::{ErrorCode, ProjectionError};
pub use event::{Event, EventData};
pub use handler::{Handler, Projection, Shutdown};
pub use reducer::{AggregateReducer, EventReducer};
pub use statement::Statement;
