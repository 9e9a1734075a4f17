//! Recording rules

use std::collections::{BTreeMap, HashSet};

use promql_parser::parser::Expr;

use super::{EvalCause, QueryFunc};
use crate::labels::{Labels, METRIC_NAME};
use crate::promql::types::Vector;

/// Stores the result of an expression as a new series
#[derive(Debug, Clone)]
pub struct RecordingRule {
    name: String,
    expr: Expr,
    labels: BTreeMap<String, String>,
}

impl RecordingRule {
    pub fn new(name: String, expr: Expr, labels: BTreeMap<String, String>) -> Self {
        Self { name, expr, labels }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Evaluate the expression at `ts` and relabel the result
    pub fn eval(&self, ts: i64, query: &QueryFunc, limit: usize) -> Result<Vector, EvalCause> {
        let mut vector = query(&self.expr, ts)?;

        for sample in &mut vector {
            sample.metric.insert(METRIC_NAME, &self.name);
            for (name, value) in &self.labels {
                sample.metric.insert(name, value);
            }
        }

        let mut seen: HashSet<&Labels> = HashSet::with_capacity(vector.len());
        if let Some(dup) = vector.iter().find(|s| !seen.insert(&s.metric)) {
            return Err(EvalCause::DuplicateLabelset(dup.metric.to_string()));
        }

        if limit > 0 && vector.len() > limit {
            return Err(EvalCause::LimitExceeded {
                limit,
                series: vector.len(),
            });
        }
        Ok(vector)
    }
}
