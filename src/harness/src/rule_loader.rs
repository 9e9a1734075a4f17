//! Rule group loading

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use engine::load::parse_series_selector;
use engine::promql::parser::referenced_metrics;
use engine::rules::{Group, Rule};
use engine::Engine;
use tracing::{info, warn};

use crate::error::{HarnessError, Result};
use crate::fixture::Fixture;

/// Rule groups bound to one engine, in file order
#[derive(Debug)]
pub struct RuleGroupSet {
    groups: Vec<Group>,
}

impl RuleGroupSet {
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub(crate) fn groups_mut(&mut self) -> &mut [Group] {
        &mut self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn rule_count(&self) -> usize {
        self.groups.iter().map(|g| g.rules().len()).sum()
    }

    /// Names of metrics recorded by the set's recording rules
    pub fn recorded_metrics(&self) -> BTreeSet<String> {
        self.groups
            .iter()
            .flat_map(|g| g.rules())
            .filter_map(|rule| match rule {
                Rule::Recording(r) => Some(r.name().to_string()),
                Rule::Alerting(_) => None,
            })
            .collect()
    }

    /// Metrics referenced by rule expressions that neither the fixture nor
    /// another rule provides. Such rules evaluate to empty results.
    pub fn unknown_metrics(&self, fixture: &Fixture) -> BTreeSet<String> {
        let mut known = self.recorded_metrics();
        known.extend(
            fixture
                .series_specs()
                .iter()
                .filter_map(|spec| parse_series_selector(&spec.selector).ok())
                .filter_map(|labels| labels.name().map(str::to_string)),
        );
        known.insert(engine::rules::ALERT_METRIC_NAME.to_string());
        known.insert(engine::rules::ALERT_FOR_STATE_METRIC_NAME.to_string());

        self.groups
            .iter()
            .flat_map(|g| g.rules())
            .flat_map(|rule| referenced_metrics(rule.expr()))
            .filter(|name| !known.contains(name))
            .collect()
    }
}

/// Load the rule groups in `path`, bound to `engine`'s query function and
/// storage. `interval` applies to groups without their own interval.
pub fn load_rule_groups(path: &Path, engine: &Engine, interval: Duration) -> Result<RuleGroupSet> {
    let groups = engine
        .rule_manager()
        .load_groups(interval, &[path])
        .map_err(HarnessError::RuleLoad)?;
    let set = RuleGroupSet { groups };
    if set.is_empty() {
        warn!(path = %path.display(), "Rule file defines no groups");
    }
    info!(
        path = %path.display(),
        groups = set.len(),
        rules = set.rule_count(),
        "Loaded rule groups"
    );
    Ok(set)
}

/// Log a warning for every metric rules reference but nothing provides
pub(crate) fn warn_unknown_metrics(groups: &RuleGroupSet, fixture: &Fixture) {
    for metric in groups.unknown_metrics(fixture) {
        warn!(%metric, "Rules reference a metric the fixture does not define");
    }
}
