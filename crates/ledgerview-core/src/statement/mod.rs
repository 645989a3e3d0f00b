//! Statements: the effect one event has on a projection.
//!
//! A reducer turns an event into a [`Statement`]. Nothing touches storage
//! until the handler calls [`Statement::execute`] inside the batch
//! transaction, so reducers stay pure and statements can be asserted on
//! with a [`Recorder`].
//!
//! Construction never fails. Incomplete statements (no projection name, no
//! values, no conditions) are reported by `execute`, which lets reducers
//! build statements with plain expressions instead of threading `Result`s.

mod column;
mod executor;

pub use column::{Column, ColumnValue, Condition, Value};
pub use executor::{Executor, Recorded, Recorder};

use chrono::{DateTime, Utc};

use crate::error::StatementError;
use crate::event::{AggregateType, BaseEvent};
use column::{columns_to_insert, columns_to_update, conditions_to_where, set_clause};

/// One SQL effect together with the position of the event that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub instance_id: String,
    pub sequence: u64,
    pub previous_sequence: u64,
    pub position: u64,
    pub creation_date: DateTime<Utc>,
    operation: Option<Operation>,
}

#[derive(Debug, Clone, PartialEq)]
enum Operation {
    Single(Kind),
    Multi(Vec<SubStatement>),
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    Create {
        columns: Vec<Column>,
    },
    Upsert {
        conflict: Vec<String>,
        columns: Vec<Column>,
    },
    Update {
        columns: Vec<Column>,
        conditions: Vec<Condition>,
    },
    Delete {
        conditions: Vec<Condition>,
    },
    Copy {
        conflict: Vec<String>,
        columns: Vec<Column>,
        copied: Vec<String>,
        conditions: Vec<Condition>,
    },
}

impl Kind {
    /// Updates without columns have nothing to write.
    fn is_no_op(&self) -> bool {
        matches!(self, Self::Update { columns, .. } if columns.is_empty())
    }

    /// Render SQL for `table`, or `None` when there is nothing to execute.
    fn render(&self, table: &str) -> Result<Option<(String, Vec<Value>)>, StatementError> {
        match self {
            Self::Create { columns } => {
                if columns.is_empty() {
                    return Err(StatementError::NoValues);
                }
                let (names, placeholders, args) = columns_to_insert(columns, 1);
                Ok(Some((
                    format!(
                        "INSERT INTO {table} ({}) VALUES ({})",
                        names.join(", "),
                        placeholders.join(", ")
                    ),
                    args,
                )))
            }
            Self::Upsert { conflict, columns } => {
                if columns.is_empty() {
                    return Err(StatementError::NoValues);
                }
                if conflict.is_empty() {
                    return Err(StatementError::NoCondition);
                }
                let (names, placeholders, args) = columns_to_insert(columns, 1);
                let mut sql = format!(
                    "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) DO ",
                    names.join(", "),
                    placeholders.join(", "),
                    conflict.join(", ")
                );
                let updated: Vec<&Column> = columns
                    .iter()
                    .filter(|c| !conflict.contains(&c.name))
                    .collect();
                if updated.iter().all(|c| c.insert_only) {
                    sql.push_str("NOTHING");
                } else {
                    let names: Vec<String> = updated.iter().map(|c| c.name.clone()).collect();
                    let exprs: Vec<String> = updated
                        .iter()
                        .map(|c| {
                            if c.insert_only {
                                c.name.clone()
                            } else {
                                format!("EXCLUDED.{}", c.name)
                            }
                        })
                        .collect();
                    sql.push_str("UPDATE SET ");
                    sql.push_str(&set_clause(&names, &exprs));
                }
                Ok(Some((sql, args)))
            }
            Self::Update {
                columns,
                conditions,
            } => {
                if columns.is_empty() {
                    return Ok(None);
                }
                if conditions.is_empty() {
                    return Err(StatementError::NoCondition);
                }
                let (names, exprs, mut args) = columns_to_update(columns, 1);
                let (wheres, where_args) = conditions_to_where(conditions, args.len() + 1);
                args.extend(where_args);
                Ok(Some((
                    format!(
                        "UPDATE {table} SET {} WHERE {}",
                        set_clause(&names, &exprs),
                        wheres.join(" AND ")
                    ),
                    args,
                )))
            }
            Self::Delete { conditions } => {
                if conditions.is_empty() {
                    return Err(StatementError::NoCondition);
                }
                let (wheres, args) = conditions_to_where(conditions, 1);
                Ok(Some((
                    format!("DELETE FROM {table} WHERE {}", wheres.join(" AND ")),
                    args,
                )))
            }
            Self::Copy {
                conflict,
                columns,
                copied,
                conditions,
            } => {
                if columns.is_empty() && copied.is_empty() {
                    return Err(StatementError::NoValues);
                }
                if conditions.is_empty() || conflict.is_empty() {
                    return Err(StatementError::NoCondition);
                }
                let (mut names, mut selected, mut args) = columns_to_insert(columns, 1);
                names.extend(copied.iter().cloned());
                selected.extend(copied.iter().cloned());
                let (wheres, where_args) = conditions_to_where(conditions, args.len() + 1);
                args.extend(where_args);

                let mut sql = format!(
                    "INSERT INTO {table} ({}) SELECT {} FROM {table} WHERE {} ON CONFLICT ({}) DO ",
                    names.join(", "),
                    selected.join(", "),
                    wheres.join(" AND "),
                    conflict.join(", ")
                );
                let updated: Vec<String> = names
                    .into_iter()
                    .filter(|name| !conflict.contains(name))
                    .collect();
                if updated.is_empty() {
                    sql.push_str("NOTHING");
                } else {
                    let exprs: Vec<String> =
                        updated.iter().map(|name| format!("EXCLUDED.{name}")).collect();
                    sql.push_str("UPDATE SET ");
                    sql.push_str(&set_clause(&updated, &exprs));
                }
                Ok(Some((sql, args)))
            }
        }
    }
}

/// One part of a multi-statement, optionally targeting a side table.
#[derive(Debug, Clone, PartialEq)]
pub struct SubStatement {
    kind: Kind,
    table_suffix: Option<String>,
}

impl SubStatement {
    /// Target `<projection>_<suffix>` instead of the projection's main table.
    #[must_use]
    pub fn with_table_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.table_suffix = Some(suffix.into());
        self
    }

    fn table(&self, projection: &str) -> String {
        self.table_suffix.as_ref().map_or_else(
            || projection.to_owned(),
            |suffix| suffixed_table(projection, suffix),
        )
    }
}

/// Name of a side table of `projection`.
#[must_use]
pub fn suffixed_table(projection: &str, suffix: &str) -> String {
    format!("{projection}_{suffix}")
}

impl Statement {
    fn from_event(event: &BaseEvent, operation: Option<Operation>) -> Self {
        Self {
            aggregate_type: event.aggregate_type().clone(),
            aggregate_id: event.aggregate_id().to_owned(),
            instance_id: event.instance_id().to_owned(),
            sequence: event.sequence,
            previous_sequence: event.previous_sequence,
            position: event.position,
            creation_date: event.creation_date,
            operation,
        }
    }

    /// Whether executing this statement writes nothing.
    #[must_use]
    pub fn is_no_op(&self) -> bool {
        match &self.operation {
            None => true,
            Some(Operation::Single(kind)) => kind.is_no_op(),
            Some(Operation::Multi(subs)) => subs.iter().all(|sub| sub.kind.is_no_op()),
        }
    }

    /// Render every SQL statement this would execute, in order.
    ///
    /// # Errors
    ///
    /// Returns the first construction error encountered.
    pub fn render(&self, projection: &str) -> Result<Vec<(String, Vec<Value>)>, StatementError> {
        let mut rendered = Vec::new();
        self.for_each_sql(projection, |sql, args| {
            rendered.push((sql.to_owned(), args.to_vec()));
            Ok(())
        })?;
        Ok(rendered)
    }

    /// Apply the statement through `executor`.
    ///
    /// Sub-statements run in declared order; the first error aborts the rest.
    /// The caller's transaction is responsible for undoing partial writes.
    ///
    /// # Errors
    ///
    /// Returns [`StatementError`] for incomplete statements or failed execution.
    pub fn execute(&self, executor: &dyn Executor, projection: &str) -> Result<(), StatementError> {
        self.for_each_sql(projection, |sql, args| {
            tracing::trace!(sql, args = args.len(), "execute statement");
            executor.exec(sql, args)?;
            Ok(())
        })
    }

    fn for_each_sql<F>(&self, projection: &str, mut f: F) -> Result<(), StatementError>
    where
        F: FnMut(&str, &[Value]) -> Result<(), StatementError>,
    {
        let Some(operation) = &self.operation else {
            return Ok(());
        };
        if projection.is_empty() {
            return Err(StatementError::NoProjection);
        }
        match operation {
            Operation::Single(kind) => {
                if let Some((sql, args)) = kind.render(projection)? {
                    f(&sql, &args)?;
                }
            }
            Operation::Multi(subs) => {
                for sub in subs {
                    if let Some((sql, args)) = sub.kind.render(&sub.table(projection))? {
                        f(&sql, &args)?;
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn new_create_statement(event: &impl AsRef<BaseEvent>, columns: Vec<Column>) -> Statement {
    Statement::from_event(
        event.as_ref(),
        Some(Operation::Single(Kind::Create { columns })),
    )
}

/// `INSERT .. ON CONFLICT (conflict) DO UPDATE`, keeping insert-only columns.
pub fn new_upsert_statement(
    event: &impl AsRef<BaseEvent>,
    conflict: &[&str],
    columns: Vec<Column>,
) -> Statement {
    Statement::from_event(
        event.as_ref(),
        Some(Operation::Single(Kind::Upsert {
            conflict: conflict.iter().map(|c| (*c).to_owned()).collect(),
            columns,
        })),
    )
}

/// `UPDATE .. SET .. WHERE ..`; degrades to a no-op when `columns` is empty.
pub fn new_update_statement(
    event: &impl AsRef<BaseEvent>,
    columns: Vec<Column>,
    conditions: Vec<Condition>,
) -> Statement {
    if columns.is_empty() {
        return new_no_op_statement(event);
    }
    Statement::from_event(
        event.as_ref(),
        Some(Operation::Single(Kind::Update {
            columns,
            conditions,
        })),
    )
}

pub fn new_delete_statement(event: &impl AsRef<BaseEvent>, conditions: Vec<Condition>) -> Statement {
    Statement::from_event(
        event.as_ref(),
        Some(Operation::Single(Kind::Delete { conditions })),
    )
}

/// Copy the rows matching `conditions` into the same table.
///
/// `columns` override values of the copy, `copied` are carried over from the
/// source row. A row already present under the `conflict` key is replaced.
pub fn new_copy_statement(
    event: &impl AsRef<BaseEvent>,
    conflict: &[&str],
    columns: Vec<Column>,
    copied: &[&str],
    conditions: Vec<Condition>,
) -> Statement {
    Statement::from_event(
        event.as_ref(),
        Some(Operation::Single(Kind::Copy {
            conflict: conflict.iter().map(|c| (*c).to_owned()).collect(),
            columns,
            copied: copied.iter().map(|c| (*c).to_owned()).collect(),
            conditions,
        })),
    )
}

/// Carries the event's position only; still advances the checkpoint.
pub fn new_no_op_statement(event: &impl AsRef<BaseEvent>) -> Statement {
    Statement::from_event(event.as_ref(), None)
}

/// Several writes from one event, applied in order within one transaction.
pub fn new_multi_statement(event: &impl AsRef<BaseEvent>, subs: Vec<SubStatement>) -> Statement {
    if subs.is_empty() {
        return new_no_op_statement(event);
    }
    Statement::from_event(event.as_ref(), Some(Operation::Multi(subs)))
}

#[must_use]
pub const fn add_create_statement(columns: Vec<Column>) -> SubStatement {
    SubStatement {
        kind: Kind::Create { columns },
        table_suffix: None,
    }
}

#[must_use]
pub fn add_upsert_statement(conflict: &[&str], columns: Vec<Column>) -> SubStatement {
    SubStatement {
        kind: Kind::Upsert {
            conflict: conflict.iter().map(|c| (*c).to_owned()).collect(),
            columns,
        },
        table_suffix: None,
    }
}

/// Skipped at execution time when `columns` is empty.
#[must_use]
pub const fn add_update_statement(columns: Vec<Column>, conditions: Vec<Condition>) -> SubStatement {
    SubStatement {
        kind: Kind::Update {
            columns,
            conditions,
        },
        table_suffix: None,
    }
}

#[must_use]
pub const fn add_delete_statement(conditions: Vec<Condition>) -> SubStatement {
    SubStatement {
        kind: Kind::Delete { conditions },
        table_suffix: None,
    }
}
