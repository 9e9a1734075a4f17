//! Rule file format
//!
//! Rule files use the Prometheus rule-group layout:
//!
//! ```yaml
//! groups:
//!   - name: example
//!     interval: 30s
//!     rules:
//!       - record: job:requests:rate5m
//!         expr: sum by (job) (rate(requests_total[5m]))
//!       - alert: HighErrorRate
//!         expr: job:errors:ratio > 0.05
//!         for: 5m
//!         labels:
//!           severity: page
//!         annotations:
//!           summary: "{{ $labels.job }} error ratio is {{ $value }}"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use promql_parser::parser::Expr;
use serde::Deserialize;

use super::RuleError;
use crate::duration::parse_duration;
use crate::labels::{is_valid_label_name, is_valid_metric_name};
use crate::promql::parser;

/// Top level of a rule file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleGroupsFile {
    #[serde(default)]
    pub groups: Vec<RuleGroupDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleGroupDef {
    pub name: String,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDef {
    #[serde(default)]
    pub record: Option<String>,
    #[serde(default)]
    pub alert: Option<String>,
    #[serde(default)]
    pub expr: String,
    #[serde(default, rename = "for")]
    pub for_: Option<String>,
    #[serde(default)]
    pub keep_firing_for: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// A validated group ready to be bound to storage
#[derive(Debug, Clone)]
pub(crate) struct ValidGroup {
    pub name: String,
    pub file: PathBuf,
    pub interval: Option<Duration>,
    pub limit: usize,
    pub rules: Vec<ValidRule>,
}

#[derive(Debug, Clone)]
pub(crate) enum ValidRule {
    Recording {
        name: String,
        expr: Expr,
        labels: BTreeMap<String, String>,
    },
    Alerting {
        name: String,
        expr: Expr,
        hold: Duration,
        keep_firing_for: Duration,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    },
}

/// Read, parse and validate a rule file. Every problem in the file is
/// reported, not just the first.
pub(crate) fn parse_file(path: &Path) -> Result<Vec<ValidGroup>, Vec<RuleError>> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        vec![RuleError::Read {
            path: path.to_path_buf(),
            source,
        }]
    })?;
    parse_str(&content, path)
}

/// Parse and validate rule groups from YAML text; `path` is used for
/// error reporting only
pub(crate) fn parse_str(content: &str, path: &Path) -> Result<Vec<ValidGroup>, Vec<RuleError>> {
    let file: RuleGroupsFile = serde_yaml::from_str(content).map_err(|source| {
        vec![RuleError::Yaml {
            path: path.to_path_buf(),
            source,
        }]
    })?;

    let mut errors = Vec::new();
    let mut groups = Vec::with_capacity(file.groups.len());
    let mut seen = HashSet::new();

    for group in file.groups {
        let group_error = |reason: String| RuleError::Group {
            path: path.to_path_buf(),
            group: group.name.clone(),
            reason,
        };

        if group.name.is_empty() {
            errors.push(group_error("group name must not be empty".to_string()));
        } else if !seen.insert(group.name.clone()) {
            errors.push(group_error("group name is repeated in the same file".to_string()));
        }

        let interval = match group.interval.as_deref().map(parse_duration) {
            Some(Ok(d)) => Some(d),
            Some(Err(e)) => {
                errors.push(group_error(format!("invalid interval: {e}")));
                None
            }
            None => None,
        };

        let mut rules = Vec::with_capacity(group.rules.len());
        for (index, rule) in group.rules.iter().enumerate() {
            match validate_rule(rule) {
                Ok(valid) => rules.push(valid),
                Err(reasons) => errors.extend(reasons.into_iter().map(|reason| RuleError::Rule {
                    path: path.to_path_buf(),
                    group: group.name.clone(),
                    index,
                    name: rule.record.clone().or_else(|| rule.alert.clone()).unwrap_or_default(),
                    reason,
                })),
            }
        }

        groups.push(ValidGroup {
            name: group.name.clone(),
            file: path.to_path_buf(),
            interval,
            limit: group.limit,
            rules,
        });
    }

    if errors.is_empty() {
        Ok(groups)
    } else {
        Err(errors)
    }
}

fn validate_rule(rule: &RuleDef) -> Result<ValidRule, Vec<String>> {
    let mut reasons = Vec::new();

    match (&rule.record, &rule.alert) {
        (Some(_), Some(_)) => reasons.push("only one of 'record' and 'alert' must be set".to_string()),
        (None, None) => reasons.push("one of 'record' or 'alert' must be set".to_string()),
        (Some(record), None) if record.is_empty() => {
            reasons.push("field 'record' must not be empty".to_string())
        }
        (None, Some(alert)) if alert.is_empty() => {
            reasons.push("field 'alert' must not be empty".to_string())
        }
        _ => {}
    }

    let expr = if rule.expr.trim().is_empty() {
        reasons.push("field 'expr' must be set in rule".to_string());
        None
    } else {
        match parser::parse(&rule.expr) {
            Ok(expr) => Some(expr),
            Err(e) => {
                reasons.push(format!("could not parse expression: {e}"));
                None
            }
        }
    };

    if let Some(record) = &rule.record {
        if !record.is_empty() && !is_valid_metric_name(record) {
            reasons.push(format!("invalid recording rule name: {record}"));
        }
        if !rule.annotations.is_empty() {
            reasons.push("invalid field 'annotations' in recording rule".to_string());
        }
        if rule.for_.is_some() {
            reasons.push("invalid field 'for' in recording rule".to_string());
        }
        if rule.keep_firing_for.is_some() {
            reasons.push("invalid field 'keep_firing_for' in recording rule".to_string());
        }
    }

    for name in rule.labels.keys() {
        if !is_valid_label_name(name) {
            reasons.push(format!("invalid label name: {name}"));
        }
    }
    for name in rule.annotations.keys() {
        if !is_valid_label_name(name) {
            reasons.push(format!("invalid annotation name: {name}"));
        }
    }

    let mut duration_field = |field: &str, value: &Option<String>| -> Duration {
        match value.as_deref().map(parse_duration) {
            Some(Ok(d)) => d,
            Some(Err(e)) => {
                reasons.push(format!("invalid field '{field}': {e}"));
                Duration::ZERO
            }
            None => Duration::ZERO,
        }
    };
    let hold = duration_field("for", &rule.for_);
    let keep_firing_for = duration_field("keep_firing_for", &rule.keep_firing_for);

    if !reasons.is_empty() {
        return Err(reasons);
    }
    let Some(expr) = expr else {
        return Err(vec!["field 'expr' must be set in rule".to_string()]);
    };

    Ok(match (&rule.record, &rule.alert) {
        (Some(name), _) => ValidRule::Recording {
            name: name.clone(),
            expr,
            labels: rule.labels.clone(),
        },
        (None, Some(name)) => ValidRule::Alerting {
            name: name.clone(),
            expr,
            hold,
            keep_firing_for,
            labels: rule.labels.clone(),
            annotations: rule.annotations.clone(),
        },
        (None, None) => return Err(vec!["one of 'record' or 'alert' must be set".to_string()]),
    })
}
