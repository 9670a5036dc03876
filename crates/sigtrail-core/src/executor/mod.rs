//! Relational executor contract.
//!
//! The engine never talks to a database driver directly. Every statement goes
//! through a [`RelationalExecutor`], which must report a missing column as
//! [`ExecutorError::SchemaCompatibility`] and every other failure as
//! [`ExecutorError::Storage`]. That single distinction is what
//! [`adaptive::SchemaAdaptiveExecutor`] negotiates on.
//!
//! Statements use named parameters (`:name`). A [`Params`] set must contain
//! exactly the parameters its statement references.

pub mod adaptive;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::cancel::Cancellation;

/// Errors reported by a relational executor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The statement referenced a column the schema does not have.
    #[error("schema incompatibility: {detail}")]
    SchemaCompatibility {
        /// Driver message naming the missing column.
        detail: String,
    },

    /// Every declared schema level failed with a missing column.
    #[error("statement {statement} exhausted all {levels} schema levels")]
    FallbackExhausted {
        /// Name of the versioned statement.
        statement: String,
        /// Number of levels attempted.
        levels: usize,
    },

    /// Any other storage failure.
    #[error("{0}")]
    Storage(String),

    /// The cancellation token fired before the statement was dispatched.
    #[error("operation cancelled")]
    Cancelled,
}

/// A single column or parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
}

impl SqlValue {
    /// Returns the integer value, if this is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text value, if this is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Renders the value as text; `NULL` renders as `None`.
    #[must_use]
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Integer(v) => Some(v.to_string()),
            Self::Real(v) => Some(v.to_string()),
            Self::Text(v) => Some(v.clone()),
        }
    }

    /// Returns `true` for SQL `NULL`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Ordered set of named statement parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(&'static str, SqlValue)>,
}

impl Params {
    /// Creates an empty parameter set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds or replaces a parameter (builder form).
    #[must_use]
    pub fn with(mut self, name: &'static str, value: impl Into<SqlValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Adds or replaces a parameter, keeping its original position.
    pub fn set(&mut self, name: &'static str, value: impl Into<SqlValue>) {
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Looks up a parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    /// Removes a parameter, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<SqlValue> {
        let index = self.entries.iter().position(|(n, _)| *n == name)?;
        Some(self.entries.remove(index).1)
    }

    /// Returns `true` if a parameter with this name is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &SqlValue)> {
        self.entries.iter().map(|(n, v)| (*n, v))
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A result row with named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    /// Builds a row from `(column, value)` pairs.
    #[must_use]
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    /// Returns the value of a column, if the row has it.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Returns an integer column; `NULL` and absent columns yield `None`.
    #[must_use]
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    /// Returns a column rendered as text; `NULL` and absent columns yield
    /// `None`.
    #[must_use]
    pub fn get_text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(SqlValue::to_text)
    }

    /// Column names in select order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(c, _)| c.as_str())
    }
}

/// Storage-agnostic statement executor.
///
/// Implementations must check `cancel` before dispatching a statement and
/// must classify "referenced column does not exist" as
/// [`ExecutorError::SchemaCompatibility`]. Vendor error codes never leave the
/// implementation.
#[async_trait]
pub trait RelationalExecutor: Send + Sync {
    /// Executes a statement and returns the number of affected rows.
    async fn execute_non_query(
        &self,
        sql: &str,
        params: &Params,
        cancel: &Cancellation,
    ) -> Result<u64, ExecutorError>;

    /// Executes a statement and returns the first column of the first row,
    /// or `None` when it produced no rows.
    async fn execute_scalar(
        &self,
        sql: &str,
        params: &Params,
        cancel: &Cancellation,
    ) -> Result<Option<SqlValue>, ExecutorError>;

    /// Executes a query and returns all rows.
    async fn execute_select(
        &self,
        sql: &str,
        params: &Params,
        cancel: &Cancellation,
    ) -> Result<Vec<Row>, ExecutorError>;
}
