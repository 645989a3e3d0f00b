use std::cell::RefCell;

use rusqlite::{params_from_iter, Connection};

use super::Value;
use crate::error::{BoxError, ExecError};

/// The only way a statement reaches storage.
pub trait Executor {
    /// Run one SQL statement, returning the number of affected rows.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Transient`] for failures worth retrying and
    /// [`ExecError::Failed`] for everything else.
    fn exec(&self, sql: &str, args: &[Value]) -> Result<usize, ExecError>;
}

/// Also covers `rusqlite::Transaction` and `Savepoint` through deref.
impl Executor for Connection {
    fn exec(&self, sql: &str, args: &[Value]) -> Result<usize, ExecError> {
        let mut stmt = self.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(args.iter()))?)
    }
}

/// A single captured call.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub sql: String,
    pub args: Vec<Value>,
}

/// Executor that records every call instead of touching a database.
///
/// Optionally fails the n-th call (1-based) so abort-on-first-error behaviour
/// can be asserted.
#[derive(Debug, Default)]
pub struct Recorder {
    calls: RefCell<Vec<Recorded>>,
    fail_at: Option<(usize, bool)>,
}

impl Recorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `call`-th execution with a permanent error.
    #[must_use]
    pub const fn failing_at(call: usize) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            fail_at: Some((call, false)),
        }
    }

    /// Fail the `call`-th execution with a transient error.
    #[must_use]
    pub const fn transient_at(call: usize) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            fail_at: Some((call, true)),
        }
    }

    /// Calls recorded so far, including a failed one.
    #[must_use]
    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.borrow().clone()
    }

    #[must_use]
    pub fn sql(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.sql.clone()).collect()
    }
}

impl Executor for Recorder {
    fn exec(&self, sql: &str, args: &[Value]) -> Result<usize, ExecError> {
        let mut calls = self.calls.borrow_mut();
        calls.push(Recorded {
            sql: sql.to_owned(),
            args: args.to_vec(),
        });
        match self.fail_at {
            Some((n, transient)) if n == calls.len() => {
                let err: BoxError = format!("recorder failing call {n}").into();
                Err(if transient {
                    ExecError::Transient(err)
                } else {
                    ExecError::Failed(err)
                })
            }
            _ => Ok(1),
        }
    }
}
