//! Declarative projection table descriptors and the idempotent initializer
//! that makes the physical schema match them.

use rusqlite::{Connection, TransactionBehavior};

use super::PROJECTIONS_SCHEMA;
use crate::error::SchemaError;
use crate::statement::suffixed_table;

/// Logical column types, mapped onto `SQLite` storage classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    /// JSON array of strings.
    TextArray,
    Json,
    Int64,
    Float,
    Bool,
    /// RFC 3339 text.
    Timestamp,
    /// Integer discriminant.
    Enum,
    Bytes,
}

impl ColumnType {
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::TextArray | Self::Json | Self::Timestamp => "TEXT",
            Self::Int64 | Self::Bool | Self::Enum => "INTEGER",
            Self::Float => "REAL",
            Self::Bytes => "BLOB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    /// SQL literal used as `DEFAULT`.
    pub default: Option<String>,
}

impl SchemaColumn {
    /// A `NOT NULL` column without default.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
        }
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn default(mut self, literal: impl Into<String>) -> Self {
        self.default = Some(literal.into());
        self
    }

    fn definition(&self) -> String {
        let mut def = format!("{} {}", self.name, self.column_type.sql_type());
        if !self.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey(pub Vec<String>);

impl PrimaryKey {
    #[must_use]
    pub fn new(columns: &[&str]) -> Self {
        Self(columns.iter().map(|c| (*c).to_owned()).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
}

impl Index {
    #[must_use]
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
        }
    }
}

/// Reference from a side table to another table of the same check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referencing columns; empty means this table's primary key.
    pub columns: Vec<String>,
    /// Suffix of the referenced table; `None` is the main table.
    pub references_suffix: Option<String>,
    /// Referenced columns; empty means the referenced table's primary key.
    pub references: Vec<String>,
    pub on_delete_cascade: bool,
}

impl ForeignKey {
    /// The side table's primary key references the main table's primary key,
    /// and rows go away with their main row.
    #[must_use]
    pub const fn of_public_keys() -> Self {
        Self {
            columns: Vec::new(),
            references_suffix: None,
            references: Vec::new(),
            on_delete_cascade: true,
        }
    }
}

/// One physical table. The main table of a check has no suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub suffix: Option<String>,
    pub columns: Vec<SchemaColumn>,
    pub primary_key: PrimaryKey,
    pub indexes: Vec<Index>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    #[must_use]
    pub const fn new(columns: Vec<SchemaColumn>, primary_key: PrimaryKey) -> Self {
        Self {
            suffix: None,
            columns,
            primary_key,
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// A side table named `<projection>_<suffix>`.
    #[must_use]
    pub fn suffixed(
        columns: Vec<SchemaColumn>,
        primary_key: PrimaryKey,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            suffix: Some(suffix.into()),
            ..Self::new(columns, primary_key)
        }
    }

    #[must_use]
    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    #[must_use]
    pub fn with_foreign_key(mut self, key: ForeignKey) -> Self {
        self.foreign_keys.push(key);
        self
    }

    /// Fully-qualified name of this table for `projection`.
    #[must_use]
    pub fn full_name(&self, projection: &str) -> String {
        match &self.suffix {
            Some(suffix) => suffixed_table(projection, suffix),
            None => projection.to_owned(),
        }
    }

    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

/// The tables of one projection, initialized as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub tables: Vec<Table>,
}

impl Check {
    #[must_use]
    pub fn table(table: Table) -> Self {
        Self {
            tables: vec![table],
        }
    }

    /// Main table plus suffixed side tables.
    #[must_use]
    pub fn multi_table(main: Table, side_tables: Vec<Table>) -> Self {
        let mut tables = Vec::with_capacity(side_tables.len() + 1);
        tables.push(main);
        tables.extend(side_tables);
        Self { tables }
    }

    /// Fully-qualified names of all tables, main table first.
    #[must_use]
    pub fn table_names(&self, projection: &str) -> Vec<String> {
        self.tables.iter().map(|t| t.full_name(projection)).collect()
    }

    fn main(&self) -> Option<&Table> {
        self.tables.iter().find(|t| t.suffix.is_none())
    }

    fn by_suffix(&self, suffix: Option<&str>) -> Option<&Table> {
        self.tables.iter().find(|t| t.suffix.as_deref() == suffix)
    }
}

/// Split `schema.table`; unqualified names live in the projection schema.
fn split_name(full: &str) -> (&str, &str) {
    full.split_once('.').unwrap_or((PROJECTIONS_SCHEMA, full))
}

fn existing_columns(conn: &Connection, full: &str) -> rusqlite::Result<Vec<String>> {
    let (schema, name) = split_name(full);
    let mut stmt = conn.prepare(&format!("PRAGMA {schema}.table_info({name})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn create_table_sql(check: &Check, table: &Table, projection: &str) -> String {
    let full = table.full_name(projection);
    let mut parts: Vec<String> = table.columns.iter().map(SchemaColumn::definition).collect();
    if !table.primary_key.0.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", table.primary_key.0.join(", ")));
    }
    for fk in &table.foreign_keys {
        let referenced = check.by_suffix(fk.references_suffix.as_deref()).or_else(|| check.main());
        let Some(referenced) = referenced else {
            continue;
        };
        let columns = if fk.columns.is_empty() {
            &table.primary_key.0
        } else {
            &fk.columns
        };
        let references = if fk.references.is_empty() {
            &referenced.primary_key.0
        } else {
            &fk.references
        };
        let referenced_full = referenced.full_name(projection);
        let (_, referenced_name) = split_name(&referenced_full);
        let mut clause = format!(
            "FOREIGN KEY ({}) REFERENCES {referenced_name} ({})",
            columns.join(", "),
            references.join(", ")
        );
        if fk.on_delete_cascade {
            clause.push_str(" ON DELETE CASCADE");
        }
        parts.push(clause);
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {full} (\n    {}\n)",
        parts.join(",\n    ")
    )
}

fn ensure_table(
    conn: &Connection,
    check: &Check,
    table: &Table,
    projection: &str,
) -> Result<(), SchemaError> {
    let full = table.full_name(projection);
    let sql_err = |source| SchemaError::Sql {
        table: full.clone(),
        source,
    };

    let existing = existing_columns(conn, &full).map_err(sql_err)?;
    if existing.is_empty() {
        conn.execute_batch(&create_table_sql(check, table, projection))
            .map_err(sql_err)?;
        tracing::info!(table = %full, "created projection table");
    } else {
        for column in &table.columns {
            if existing.iter().any(|name| name == &column.name) {
                continue;
            }
            if !column.nullable && column.default.is_none() {
                return Err(SchemaError::MissingColumn {
                    table: full.clone(),
                    column: column.name.clone(),
                });
            }
            conn.execute_batch(&format!(
                "ALTER TABLE {full} ADD COLUMN {}",
                column.definition()
            ))
            .map_err(sql_err)?;
            tracing::info!(table = %full, column = %column.name, "added projection column");
        }
    }

    let (schema, name) = split_name(&full);
    for index in &table.indexes {
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {schema}.{name}_{}_idx ON {name} ({})",
            index.name,
            index.columns.join(", ")
        ))
        .map_err(sql_err)?;
    }
    Ok(())
}

/// Create missing tables, columns and indexes of `check` for `projection`.
///
/// Runs in one immediate transaction: either every table of the check is
/// ready afterwards or none of the changes is kept. Safe to call on every
/// start and from concurrent processes.
///
/// # Errors
///
/// Returns [`SchemaError`] when a table cannot be created or brought up to
/// date, e.g. a required column is missing and has no default.
pub fn init(conn: &mut Connection, projection: &str, check: &Check) -> Result<(), SchemaError> {
    let begin_err = |source| SchemaError::Sql {
        table: projection.to_owned(),
        source,
    };
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(begin_err)?;
    for table in &check.tables {
        ensure_table(&tx, check, table, projection)?;
    }
    tx.commit().map_err(begin_err)?;
    tracing::debug!(projection, tables = check.tables.len(), "projection schema ready");
    Ok(())
}

/// Delete projection rows of one tenant (or all rows), side tables first.
///
/// Tables without an `instance_id` column are cleared entirely.
///
/// # Errors
///
/// Returns the first `SQLite` error.
pub fn truncate(
    conn: &Connection,
    projection: &str,
    check: &Check,
    instance_id: Option<&str>,
) -> rusqlite::Result<usize> {
    let mut deleted = 0;
    for table in check.tables.iter().rev() {
        let full = table.full_name(projection);
        deleted += match instance_id {
            Some(id) if table.has_column("instance_id") => {
                conn.execute(&format!("DELETE FROM {full} WHERE instance_id = ?1"), [id])?
            }
            _ => conn.execute(&format!("DELETE FROM {full}"), [])?,
        };
    }
    Ok(deleted)
}
