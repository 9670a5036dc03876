//! Schema-adaptive statement execution.
//!
//! A [`VersionedStatement`] lists the preferred (newest-schema) statement and
//! one or more fallback levels for older schema generations, newest first.
//! [`SchemaAdaptiveExecutor`] runs the preferred statement and steps down one
//! level only when the executor reports
//! [`ExecutorError::SchemaCompatibility`]. Any other error propagates at once.
//!
//! Values a fallback level cannot carry are not dropped: they are folded into
//! a text parameter as `label=value` pairs, e.g. `sigId=777 sigHash=ABC123`.
//!
//! Once a statement has negotiated down, the level is cached per executor
//! instance so later calls skip the failing round-trip.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use super::{ExecutorError, Params, RelationalExecutor, Row, SqlValue};
use crate::cancel::Cancellation;

/// A parameter a fallback level cannot bind, and the label it is folded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldedParam {
    /// Parameter name, including the `:` prefix.
    pub param: &'static str,
    /// Label used in the folded text.
    pub label: &'static str,
}

/// One fallback level of a [`VersionedStatement`].
#[derive(Debug, Clone, Copy)]
pub struct SchemaLevel {
    /// Statement text for this schema generation.
    pub sql: &'static str,
    /// Parameters of the preferred statement this level cannot bind.
    pub omits: &'static [FoldedParam],
}

/// A statement with explicit per-generation variants.
#[derive(Debug, Clone, Copy)]
pub struct VersionedStatement {
    /// Stable name, used as the capability cache key and in logs.
    pub name: &'static str,
    /// Statement for the newest schema.
    pub preferred: &'static str,
    /// Fallback levels, newest first.
    pub fallbacks: &'static [SchemaLevel],
    /// Text parameter that receives folded values. Ignored by levels that
    /// omit nothing.
    pub fold_into: &'static str,
}

impl VersionedStatement {
    /// Total number of levels, preferred included.
    #[must_use]
    pub const fn levels(&self) -> usize {
        self.fallbacks.len() + 1
    }

    fn sql_at(&self, level: usize) -> &'static str {
        if level == 0 {
            self.preferred
        } else {
            self.fallbacks[level - 1].sql
        }
    }

    fn params_at(&self, level: usize, params: &Params) -> Params {
        if level == 0 {
            params.clone()
        } else {
            fold_params(params, self.fallbacks[level - 1].omits, self.fold_into)
        }
    }
}

/// Removes `omits` from `params` and folds their non-null values into the
/// `fold_into` text parameter.
///
/// The folded pairs are joined with single spaces. When the target already
/// holds text the pairs are appended in brackets: `"<text> [<pairs>]"`.
#[must_use]
pub fn fold_params(params: &Params, omits: &[FoldedParam], fold_into: &'static str) -> Params {
    let mut folded = params.clone();
    let pairs: Vec<String> = omits
        .iter()
        .filter_map(|f| {
            folded
                .remove(f.param)
                .and_then(|v| v.to_text())
                .map(|text| format!("{}={text}", f.label))
        })
        .collect();

    if pairs.is_empty() {
        return folded;
    }

    let suffix = pairs.join(" ");
    let merged = match folded.get(fold_into).and_then(SqlValue::as_text) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing} [{suffix}]"),
        _ => suffix,
    };
    folded.set(fold_into, merged);
    folded
}

/// Tracks where one call is in the level chain.
struct Negotiation<'a> {
    stmt: &'a VersionedStatement,
    start: usize,
    level: usize,
}

/// Executor wrapper that negotiates schema capability per statement.
pub struct SchemaAdaptiveExecutor {
    inner: Arc<dyn RelationalExecutor>,
    negotiated: RwLock<HashMap<&'static str, usize>>,
    cache_enabled: bool,
}

impl std::fmt::Debug for SchemaAdaptiveExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaAdaptiveExecutor")
            .field("cache_enabled", &self.cache_enabled)
            .finish_non_exhaustive()
    }
}

impl SchemaAdaptiveExecutor {
    /// Wraps an executor. With `cache_enabled`, negotiated levels are
    /// remembered for the lifetime of this instance.
    #[must_use]
    pub fn new(inner: Arc<dyn RelationalExecutor>, cache_enabled: bool) -> Self {
        Self {
            inner,
            negotiated: RwLock::new(HashMap::new()),
            cache_enabled,
        }
    }

    /// Returns the underlying executor.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn RelationalExecutor> {
        &self.inner
    }

    /// Returns the cached level for a statement name (0 if never negotiated).
    #[must_use]
    pub fn negotiated_level(&self, name: &str) -> usize {
        self.negotiated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Runs a versioned statement through `execute_scalar`, falling back on
    /// missing columns.
    ///
    /// # Errors
    ///
    /// Returns the first non-schema error unchanged, or
    /// [`ExecutorError::FallbackExhausted`] when every level reported a
    /// missing column.
    pub async fn execute_with_fallback(
        &self,
        stmt: &VersionedStatement,
        params: Params,
        cancel: &Cancellation,
    ) -> Result<Option<SqlValue>, ExecutorError> {
        let mut negotiation = self.begin(stmt);
        loop {
            let sql = stmt.sql_at(negotiation.level);
            let bound = stmt.params_at(negotiation.level, &params);
            match self.inner.execute_scalar(sql, &bound, cancel).await {
                Ok(value) => {
                    self.settle(&negotiation);
                    return Ok(value);
                },
                Err(ExecutorError::SchemaCompatibility { detail }) => {
                    negotiation = Self::step_down(negotiation, &detail)?;
                },
                Err(other) => return Err(other),
            }
        }
    }

    /// Runs a versioned query through `execute_select`, falling back on
    /// missing columns.
    ///
    /// # Errors
    ///
    /// Same as [`Self::execute_with_fallback`].
    pub async fn select_with_fallback(
        &self,
        stmt: &VersionedStatement,
        params: Params,
        cancel: &Cancellation,
    ) -> Result<(usize, Vec<Row>), ExecutorError> {
        let mut negotiation = self.begin(stmt);
        loop {
            let sql = stmt.sql_at(negotiation.level);
            let bound = stmt.params_at(negotiation.level, &params);
            match self.inner.execute_select(sql, &bound, cancel).await {
                Ok(rows) => {
                    self.settle(&negotiation);
                    return Ok((negotiation.level, rows));
                },
                Err(ExecutorError::SchemaCompatibility { detail }) => {
                    negotiation = Self::step_down(negotiation, &detail)?;
                },
                Err(other) => return Err(other),
            }
        }
    }

    fn begin<'a>(&self, stmt: &'a VersionedStatement) -> Negotiation<'a> {
        let start = if self.cache_enabled {
            self.negotiated_level(stmt.name).min(stmt.levels() - 1)
        } else {
            0
        };
        if start > 0 {
            debug!(
                statement = stmt.name,
                level = start,
                "using cached schema level"
            );
        }
        Negotiation {
            stmt,
            start,
            level: start,
        }
    }

    fn step_down<'a>(
        negotiation: Negotiation<'a>,
        detail: &str,
    ) -> Result<Negotiation<'a>, ExecutorError> {
        let next = negotiation.level + 1;
        if next >= negotiation.stmt.levels() {
            warn!(
                statement = negotiation.stmt.name,
                detail, "no schema level left to fall back to"
            );
            return Err(ExecutorError::FallbackExhausted {
                statement: negotiation.stmt.name.to_string(),
                levels: negotiation.stmt.levels() - negotiation.start,
            });
        }
        warn!(
            statement = negotiation.stmt.name,
            from_level = negotiation.level,
            to_level = next,
            detail,
            "schema lacks columns for statement, falling back"
        );
        Ok(Negotiation {
            level: next,
            ..negotiation
        })
    }

    fn settle(&self, negotiation: &Negotiation<'_>) {
        if !self.cache_enabled || negotiation.level == negotiation.start {
            return;
        }
        self.negotiated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(negotiation.stmt.name, negotiation.level);
    }
}
