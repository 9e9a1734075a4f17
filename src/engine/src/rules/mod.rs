//! Recording and alerting rule evaluation
//!
//! A [`Manager`] loads rule files into [`Group`]s bound to a query function
//! and an append target. Each call to [`Group::eval`] evaluates every rule
//! of the group at one timestamp and appends the results, so later rules,
//! later evaluations and queries all observe them.

mod alerting;
mod file;
mod group;
mod recording;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use promql_parser::parser::Expr;
use thiserror::Error;
use tracing::debug;

use crate::labels::Labels;
use crate::promql::error::PromQLError;
use crate::promql::types::{Sample, Value, Vector};
use crate::promql::QueryEngine;
use crate::storage::{Appendable, Queryable, StorageError};

pub use alerting::{
    Alert, AlertState, AlertingRule, ALERT_FOR_STATE_METRIC_NAME, ALERT_METRIC_NAME,
    ALERT_NAME_LABEL, ALERT_STATE_LABEL,
};
pub use file::{RuleDef, RuleGroupDef, RuleGroupsFile};
pub use group::{Group, Rule};
pub use recording::RecordingRule;

/// Evaluates a rule expression at a timestamp (milliseconds)
pub type QueryFunc = Arc<dyn Fn(&Expr, i64) -> Result<Vector, PromQLError> + Send + Sync>;

/// Query function backed by a [`QueryEngine`]. Scalar results become a
/// single sample without labels.
pub fn engine_query_func(engine: QueryEngine, queryable: Arc<dyn Queryable>) -> QueryFunc {
    Arc::new(move |expr: &Expr, ts: i64| -> Result<Vector, PromQLError> {
        match engine.exec_expr(queryable.as_ref(), expr, ts)? {
            Value::Vector(vector) => Ok(vector),
            Value::Scalar { t, v } => Ok(vec![Sample {
                metric: Labels::new(),
                t,
                v,
            }]),
            other => Err(PromQLError::Evaluation(format!(
                "rule result is not a vector or scalar: {}",
                other.value_type()
            ))),
        }
    })
}

/// Errors found while loading rule files
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("{}: group {group:?}: {reason}", path.display())]
    Group {
        path: PathBuf,
        group: String,
        reason: String,
    },
    #[error("{}: group {group:?}, rule {} ({name}): {reason}", path.display(), index + 1)]
    Rule {
        path: PathBuf,
        group: String,
        index: usize,
        name: String,
        reason: String,
    },
}

/// Why a single rule failed to evaluate
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalCause {
    #[error(transparent)]
    Query(#[from] PromQLError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("vector contains metrics with the same labelset after applying rule labels: {0}")]
    DuplicateLabelset(String),
    #[error("exceeded limit of {limit} with {series} series")]
    LimitExceeded { limit: usize, series: usize },
}

/// A rule evaluation failure at one timestamp
#[derive(Debug, Clone, PartialEq, Error)]
#[error("group {group:?}, rule {rule:?} at {t}ms: {cause}")]
pub struct RuleEvalError {
    pub group: String,
    pub rule: String,
    pub t: i64,
    pub cause: EvalCause,
}

/// Collaborators shared by every group of a manager
#[derive(Clone)]
pub struct ManagerOptions {
    pub query_func: QueryFunc,
    pub appendable: Arc<dyn Appendable>,
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions").finish_non_exhaustive()
    }
}

/// Loads rule groups bound to one query function and append target
#[derive(Debug, Clone)]
pub struct Manager {
    options: ManagerOptions,
}

impl Manager {
    pub fn new(options: ManagerOptions) -> Self {
        Self { options }
    }

    /// Load every group from `paths`, in file order and group order.
    /// `interval` applies to groups that do not set their own.
    pub fn load_groups<P: AsRef<Path>>(
        &self,
        interval: Duration,
        paths: &[P],
    ) -> Result<Vec<Group>, Vec<RuleError>> {
        let mut groups = Vec::new();
        let mut errors = Vec::new();
        for path in paths {
            match file::parse_file(path.as_ref()) {
                Ok(parsed) => groups.extend(parsed),
                Err(errs) => errors.extend(errs),
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let groups: Vec<Group> = groups
            .into_iter()
            .map(|g| Group::new(g, interval, self.options.clone()))
            .collect();
        debug!(
            groups = groups.len(),
            rules = groups.iter().map(|g| g.rules().len()).sum::<usize>(),
            "Loaded rule groups"
        );
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::promql::EngineOptions;
    use crate::storage::MemoryStorage;

    fn manager(storage: &Arc<MemoryStorage>) -> Manager {
        Manager::new(ManagerOptions {
            query_func: engine_query_func(
                QueryEngine::new(EngineOptions::default()),
                storage.clone(),
            ),
            appendable: storage.clone(),
        })
    }

    fn rule_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_scalar_result_becomes_vector() {
        let storage = Arc::new(MemoryStorage::new());
        let query = engine_query_func(QueryEngine::default(), storage);
        let expr = crate::promql::parser::parse("1 + 1").unwrap();
        let out = query(&expr, 5_000).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].metric.is_empty());
        assert_eq!((out[0].t, out[0].v), (5_000, 2.0));
    }

    #[test]
    fn test_load_groups_in_file_order() {
        let storage = Arc::new(MemoryStorage::new());
        let file = rule_file(
            "groups:\n  - name: b\n    rules:\n      - record: x\n        expr: up\n  - name: a\n    interval: 10s\n    rules: []\n",
        );
        let groups = manager(&storage)
            .load_groups(Duration::from_secs(60), &[file.path()])
            .unwrap();
        assert_eq!(groups[0].name(), "b");
        assert_eq!(groups[0].interval(), Duration::from_secs(60));
        assert_eq!(groups[1].name(), "a");
        assert_eq!(groups[1].interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_groups_reports_missing_file() {
        let storage = Arc::new(MemoryStorage::new());
        let errors = manager(&storage)
            .load_groups(Duration::from_secs(60), &["/nonexistent/rules.yml"])
            .unwrap_err();
        assert!(matches!(errors[0], RuleError::Read { .. }));
    }
}
