//! Rule groups

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use promql_parser::parser::Expr;
use tracing::debug;

use super::file::{ValidGroup, ValidRule};
use super::{AlertingRule, EvalCause, ManagerOptions, QueryFunc, RecordingRule, RuleEvalError};
use crate::labels::Labels;
use crate::promql::types::Vector;
use crate::storage::{stale_nan, StorageError};

/// A recording or alerting rule
#[derive(Debug, Clone)]
pub enum Rule {
    Recording(RecordingRule),
    Alerting(AlertingRule),
}

impl Rule {
    pub fn name(&self) -> &str {
        match self {
            Self::Recording(rule) => rule.name(),
            Self::Alerting(rule) => rule.name(),
        }
    }

    pub fn expr(&self) -> &Expr {
        match self {
            Self::Recording(rule) => rule.expr(),
            Self::Alerting(rule) => rule.expr(),
        }
    }

    fn eval(&mut self, ts: i64, query: &QueryFunc, limit: usize) -> Result<Vector, EvalCause> {
        match self {
            Self::Recording(rule) => rule.eval(ts, query, limit),
            Self::Alerting(rule) => rule.eval(ts, query, limit),
        }
    }
}

impl From<ValidRule> for Rule {
    fn from(rule: ValidRule) -> Self {
        match rule {
            ValidRule::Recording { name, expr, labels } => {
                Self::Recording(RecordingRule::new(name, expr, labels))
            }
            ValidRule::Alerting {
                name,
                expr,
                hold,
                keep_firing_for,
                labels,
                annotations,
            } => Self::Alerting(AlertingRule::new(
                name,
                expr,
                hold,
                keep_firing_for,
                labels,
                annotations,
            )),
        }
    }
}

/// An ordered set of rules evaluated together
#[derive(Debug)]
pub struct Group {
    name: String,
    file: PathBuf,
    interval: Duration,
    limit: usize,
    rules: Vec<Rule>,
    /// Series each rule wrote in its previous evaluation
    series_in_previous_eval: Vec<BTreeSet<Labels>>,
    last_eval: Option<i64>,
    options: ManagerOptions,
}

impl Group {
    pub(crate) fn new(group: ValidGroup, default_interval: Duration, options: ManagerOptions) -> Self {
        let rules: Vec<Rule> = group.rules.into_iter().map(Rule::from).collect();
        Self {
            name: group.name,
            file: group.file,
            interval: group.interval.unwrap_or(default_interval),
            limit: group.limit,
            series_in_previous_eval: vec![BTreeSet::new(); rules.len()],
            rules,
            last_eval: None,
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Timestamp of the most recent evaluation
    pub fn last_eval(&self) -> Option<i64> {
        self.last_eval
    }

    /// Evaluate every rule at `ts` (milliseconds) in order and append the
    /// results. Series a rule stopped producing get a stale marker. A
    /// failing rule does not stop the rules after it; every failure is
    /// returned.
    pub fn eval(&mut self, ts: i64) -> Result<(), Vec<RuleEvalError>> {
        let mut errors = Vec::new();
        let mut samples = 0;

        for (i, rule) in self.rules.iter_mut().enumerate() {
            let rule_name = rule.name().to_string();
            let rule_error = |cause: EvalCause| RuleEvalError {
                group: self.name.clone(),
                rule: rule_name.clone(),
                t: ts,
                cause,
            };

            let vector = match rule.eval(ts, &self.options.query_func, self.limit) {
                Ok(vector) => vector,
                Err(cause) => {
                    errors.push(rule_error(cause));
                    continue;
                }
            };

            let mut app = self.options.appendable.appender();
            let mut returned = BTreeSet::new();
            for sample in &vector {
                match app.append(&sample.metric, sample.t, sample.v) {
                    Ok(()) => {
                        returned.insert(sample.metric.clone());
                    }
                    Err(e) => errors.push(rule_error(e.into())),
                }
            }
            samples += returned.len();

            for metric in self.series_in_previous_eval[i].difference(&returned) {
                match app.append(metric, ts, stale_nan()) {
                    // Another rule may already export the series
                    Ok(())
                    | Err(StorageError::OutOfOrder { .. })
                    | Err(StorageError::DuplicateSample { .. }) => {}
                    Err(e) => errors.push(rule_error(e.into())),
                }
            }
            if let Err(e) = app.commit() {
                errors.push(rule_error(e.into()));
            }
            self.series_in_previous_eval[i] = returned;
        }

        self.last_eval = Some(ts);
        debug!(
            group = %self.name,
            ts,
            samples,
            failed = errors.len(),
            "Evaluated rule group"
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
