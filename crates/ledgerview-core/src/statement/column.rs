//! Column values and filter conditions, and their rendering into SQL
//! fragments with numbered `?N` placeholders.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue};

/// A bound argument of a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Stored as RFC 3339 text with microsecond precision.
    Timestamp(DateTime<Utc>),
    /// Stored as a JSON array.
    TextArray(Vec<String>),
    /// Stored as a JSON array.
    IntArray(Vec<i64>),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn to_sql_value(&self) -> SqlValue {
        match self {
            Self::Null => SqlValue::Null,
            Self::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Self::Int(i) => SqlValue::Integer(*i),
            Self::Float(f) => SqlValue::Real(*f),
            Self::Text(s) => SqlValue::Text(s.clone()),
            Self::Timestamp(ts) => SqlValue::Text(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
            Self::TextArray(items) => SqlValue::Text(json_text(items)),
            Self::IntArray(items) => SqlValue::Text(json_text(items)),
            Self::Json(json) => SqlValue::Text(json.to_string()),
            Self::Bytes(bytes) => SqlValue::Blob(bytes.clone()),
        }
    }
}

fn json_text<T: serde::Serialize>(items: &[T]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_owned())
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(self.to_sql_value()))
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::$variant(value.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int,
    u32 => Int,
    f64 => Float,
    String => Text,
    &str => Text,
    DateTime<Utc> => Timestamp,
    Vec<String> => TextArray,
    Vec<i64> => IntArray,
    serde_json::Value => Json,
    Vec<u8> => Bytes,
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// How a column receives its value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// Bind the value as-is.
    Value(Value),
    /// Append the value to the column's JSON array.
    ArrayAppend(Value),
    /// Remove every occurrence of the value from the column's JSON array.
    ArrayRemove(Value),
}

/// A named column assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub value: ColumnValue,
    /// Written on insert, kept as-is when an upsert hits an existing row.
    pub insert_only: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: ColumnValue::Value(value.into()),
            insert_only: false,
        }
    }

    /// Column an upsert must not overwrite, e.g. `creation_date`.
    pub fn insert_only(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            insert_only: true,
            ..Self::new(name, value)
        }
    }

    pub fn array_append(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: ColumnValue::ArrayAppend(value.into()),
            insert_only: false,
        }
    }

    pub fn array_remove(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: ColumnValue::ArrayRemove(value.into()),
            insert_only: false,
        }
    }
}

/// A single `WHERE` predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `col = ?`, or `col IS NULL` when the value is [`Value::Null`].
    Eq(String, Value),
    LessThan(String, Value),
    IsNull(String),
    /// The column's JSON array contains the text value.
    TextArrayContains(String, String),
    Not(Box<Condition>),
}

impl Condition {
    pub fn equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    pub fn less_than(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::LessThan(column.into(), value.into())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    pub fn text_array_contains(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::TextArrayContains(column.into(), value.into())
    }

    #[must_use]
    pub fn negate(condition: Self) -> Self {
        Self::Not(Box::new(condition))
    }

    /// Render without the surrounding parentheses.
    fn render(&self, args: &mut Vec<Value>, offset: usize) -> String {
        fn bind(args: &mut Vec<Value>, offset: usize, value: Value) -> String {
            args.push(value);
            format!("?{}", offset + args.len() - 1)
        }
        match self {
            Self::Eq(column, Value::Null) | Self::IsNull(column) => format!("{column} IS NULL"),
            Self::Eq(column, value) => format!("{column} = {}", bind(args, offset, value.clone())),
            Self::LessThan(column, value) => {
                format!("{column} < {}", bind(args, offset, value.clone()))
            }
            Self::TextArrayContains(column, value) => format!(
                "EXISTS (SELECT 1 FROM json_each({column}) WHERE value = {})",
                bind(args, offset, Value::Text(value.clone()))
            ),
            Self::Not(inner) => format!("NOT ({})", inner.render(args, offset)),
        }
    }
}

/// Render column values as placeholders for an `INSERT`.
///
/// Returns `(names, placeholders, args)`; the first placeholder is `?offset`.
pub(crate) fn columns_to_insert(
    columns: &[Column],
    offset: usize,
) -> (Vec<String>, Vec<String>, Vec<Value>) {
    let mut names = Vec::with_capacity(columns.len());
    let mut placeholders = Vec::with_capacity(columns.len());
    let mut args = Vec::with_capacity(columns.len());
    for column in columns {
        names.push(column.name.clone());
        match &column.value {
            ColumnValue::Value(value) => {
                args.push(value.clone());
                placeholders.push(format!("?{}", offset + args.len() - 1));
            }
            ColumnValue::ArrayAppend(value) => {
                args.push(value.clone());
                placeholders.push(format!("json_array(?{})", offset + args.len() - 1));
            }
            ColumnValue::ArrayRemove(_) => placeholders.push("json_array()".to_owned()),
        }
    }
    (names, placeholders, args)
}

/// Render column values as `SET` expressions for an `UPDATE`.
///
/// Returns `(names, expressions, args)`; array operations reference the
/// current column value.
pub(crate) fn columns_to_update(
    columns: &[Column],
    offset: usize,
) -> (Vec<String>, Vec<String>, Vec<Value>) {
    let mut names = Vec::with_capacity(columns.len());
    let mut exprs = Vec::with_capacity(columns.len());
    let mut args = Vec::with_capacity(columns.len());
    for column in columns {
        let name = &column.name;
        names.push(name.clone());
        let (ColumnValue::Value(value)
        | ColumnValue::ArrayAppend(value)
        | ColumnValue::ArrayRemove(value)) = &column.value;
        args.push(value.clone());
        let p = format!("?{}", offset + args.len() - 1);
        exprs.push(match &column.value {
            ColumnValue::Value(_) => p,
            ColumnValue::ArrayAppend(_) => {
                format!("json_insert(COALESCE({name}, '[]'), '$[#]', {p})")
            }
            ColumnValue::ArrayRemove(_) => format!(
                "(SELECT json_group_array(value) FROM json_each(COALESCE({name}, '[]')) WHERE value <> {p})"
            ),
        });
    }
    (names, exprs, args)
}

/// Render conditions as parenthesized predicates, numbering from `offset`.
pub(crate) fn conditions_to_where(conditions: &[Condition], offset: usize) -> (Vec<String>, Vec<Value>) {
    let mut wheres = Vec::with_capacity(conditions.len());
    let mut args = Vec::new();
    for condition in conditions {
        let rendered = condition.render(&mut args, offset);
        wheres.push(format!("({rendered})"));
    }
    (wheres, args)
}

/// `a = x` for one column, `(a, b) = (x, y)` for several.
pub(crate) fn set_clause(names: &[String], exprs: &[String]) -> String {
    if names.len() == 1 {
        format!("{} = {}", names[0], exprs[0])
    } else {
        format!("({}) = ({})", names.join(", "), exprs.join(", "))
    }
}
