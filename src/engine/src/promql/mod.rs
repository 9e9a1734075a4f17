//! PromQL instant query evaluation
//!
//! This module evaluates PromQL expressions against any [`Queryable`]
//! storage at a single evaluation timestamp.
//!
//! # Architecture
//!
//! ```text
//! PromQL String → Parser → AST (Expr) → Evaluator → Value
//! ```
//!
//! # Modules
//!
//! - [`parser`] - PromQL parsing using the promql-parser crate
//! - [`types`] - Values flowing through evaluation and label matchers
//! - [`error`] - Error types for PromQL operations
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use engine::promql::{QueryEngine, EngineOptions, types::Value};
//! use engine::storage::MemoryStorage;
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let engine = QueryEngine::new(EngineOptions::default());
//! let query = engine.new_instant_query(storage, "1 + 1", 0).unwrap();
//! assert!(matches!(query.exec().unwrap(), Value::Scalar { v, .. } if v == 2.0));
//! ```
//!
//! # Supported Features
//!
//! ## Selectors
//! - Instant vector selectors: `metric_name{label="value"}`
//! - Range vector selectors and subqueries: `metric_name[5m]`, `expr[10m:1m]`
//! - Label matchers: `=`, `!=`, `=~`, `!~`
//! - Offset and @ modifiers
//!
//! ## Aggregations
//! - `sum`, `avg`, `min`, `max`, `count`, `group`
//! - `stddev`, `stdvar`
//! - `topk`, `bottomk`
//! - `count_values`, `quantile`
//! - Grouping with `by` and `without`
//!
//! ## Binary operators
//! - Arithmetic, comparison (with and without `bool`) and set operators
//! - Vector matching with `on`, `ignoring`, `group_left` and `group_right`
//!
//! ## Functions
//! - Rate functions: `rate`, `irate`, `increase`, `delta`, `idelta`
//! - Aggregation over time: `avg_over_time`, `sum_over_time`, etc.
//! - Math functions: `abs`, `ceil`, `floor`, `round`, `sqrt`, etc.
//! - Histogram: `histogram_quantile`
//! - Labels: `label_replace`, `label_join`

pub mod error;
pub mod parser;
pub mod types;

mod aggregate;
mod binary;
pub(crate) mod eval;
mod functions;

use std::sync::Arc;
use std::time::Duration;

use promql_parser::parser::Expr;
use tracing::trace;

use crate::storage::Queryable;
use error::PromQLError;
use eval::Evaluator;
use types::Value;

/// Tunables for query evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// How far back an instant selector looks for the newest sample
    pub lookback_delta: Duration,
    /// Upper bound on samples loaded by a single query
    pub max_samples: usize,
    /// Resolution of subqueries that do not specify a step
    pub default_subquery_step: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lookback_delta: Duration::from_secs(5 * 60),
            max_samples: 50_000_000,
            default_subquery_step: Duration::from_secs(60),
        }
    }
}

/// Creates and runs PromQL queries
#[derive(Debug, Clone, Default)]
pub struct QueryEngine {
    options: EngineOptions,
}

impl QueryEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Parse `query` into an instant query evaluated at `ts` (milliseconds)
    pub fn new_instant_query(
        &self,
        queryable: Arc<dyn Queryable>,
        query: &str,
        ts: i64,
    ) -> Result<InstantQuery, PromQLError> {
        let expr = parser::parse(query)?;
        Ok(InstantQuery {
            engine: self.clone(),
            queryable,
            expr,
            ts,
        })
    }

    /// Evaluate an already parsed expression
    pub fn exec_expr(
        &self,
        queryable: &dyn Queryable,
        expr: &Expr,
        ts: i64,
    ) -> Result<Value, PromQLError> {
        trace!(ts, %expr, "Evaluating PromQL expression");
        let mut evaluator = Evaluator::new(queryable, &self.options, ts);
        evaluator.eval(expr, ts)
    }
}

/// A parsed query bound to storage and an evaluation time
pub struct InstantQuery {
    engine: QueryEngine,
    queryable: Arc<dyn Queryable>,
    expr: Expr,
    ts: i64,
}

impl InstantQuery {
    pub fn exec(&self) -> Result<Value, PromQLError> {
        self.engine
            .exec_expr(self.queryable.as_ref(), &self.expr, self.ts)
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn timestamp(&self) -> i64 {
        self.ts
    }
}
