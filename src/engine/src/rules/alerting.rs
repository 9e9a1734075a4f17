//! Alerting rules and their pending/firing state machine

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use promql_parser::parser::Expr;
use tracing::debug;

use super::{EvalCause, QueryFunc};
use crate::labels::{Labels, METRIC_NAME};
use crate::promql::eval::duration_ms;
use crate::promql::types::{Sample, Vector};

pub const ALERT_METRIC_NAME: &str = "ALERTS";
pub const ALERT_FOR_STATE_METRIC_NAME: &str = "ALERTS_FOR_STATE";
pub const ALERT_NAME_LABEL: &str = "alertname";
pub const ALERT_STATE_LABEL: &str = "alertstate";

/// How long a resolved alert is remembered
const RESOLVED_RETENTION_MS: i64 = 15 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertState {
    Inactive,
    Pending,
    Firing,
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Pending => write!(f, "pending"),
            Self::Firing => write!(f, "firing"),
        }
    }
}

/// One labelled instance of an alerting rule
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub state: AlertState,
    pub value: f64,
    /// Timestamps in milliseconds
    pub active_at: i64,
    pub fired_at: Option<i64>,
    pub resolved_at: Option<i64>,
    pub keep_firing_since: Option<i64>,
}

/// Raises alerts while its expression returns results
#[derive(Debug, Clone)]
pub struct AlertingRule {
    name: String,
    expr: Expr,
    hold: Duration,
    keep_firing_for: Duration,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    active: BTreeMap<Labels, Alert>,
}

impl AlertingRule {
    pub fn new(
        name: String,
        expr: Expr,
        hold: Duration,
        keep_firing_for: Duration,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name,
            expr,
            hold,
            keep_firing_for,
            labels,
            annotations,
            active: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn hold_duration(&self) -> Duration {
        self.hold
    }

    /// Alerts that are pending or firing
    pub fn active_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.active
            .values()
            .filter(|a| a.state != AlertState::Inactive)
    }

    /// The most severe state of any alert of this rule
    pub fn state(&self) -> AlertState {
        self.active
            .values()
            .map(|a| a.state)
            .max()
            .unwrap_or(AlertState::Inactive)
    }

    /// Evaluate the expression at `ts`, advance every alert's state and
    /// return the `ALERTS` and `ALERTS_FOR_STATE` samples to record
    pub fn eval(&mut self, ts: i64, query: &QueryFunc, limit: usize) -> Result<Vector, EvalCause> {
        let result = query(&self.expr, ts)?;

        let mut current: BTreeMap<Labels, Alert> = BTreeMap::new();
        for sample in &result {
            let data = TemplateData {
                labels: &sample.metric,
                value: sample.v,
            };

            let mut labels = sample.metric.without_name();
            for (name, value) in &self.labels {
                labels.insert(name, &expand(value, &data));
            }
            labels.insert(ALERT_NAME_LABEL, &self.name);

            let annotations = self
                .annotations
                .iter()
                .map(|(name, value)| (name.clone(), expand(value, &data)))
                .collect();

            if current.contains_key(&labels) {
                return Err(EvalCause::DuplicateLabelset(labels.to_string()));
            }
            current.insert(
                labels.clone(),
                Alert {
                    labels,
                    annotations,
                    state: AlertState::Pending,
                    value: sample.v,
                    active_at: ts,
                    fired_at: None,
                    resolved_at: None,
                    keep_firing_since: None,
                },
            );
        }

        let returned: HashSet<Labels> = current.keys().cloned().collect();
        for (labels, alert) in current {
            match self.active.get_mut(&labels) {
                Some(existing) if existing.state != AlertState::Inactive => {
                    existing.value = alert.value;
                    existing.annotations = alert.annotations;
                }
                _ => {
                    self.active.insert(labels, alert);
                }
            }
        }

        let hold = duration_ms(self.hold);
        let keep_firing_for = duration_ms(self.keep_firing_for);
        let mut active_or_pending = 0;
        let mut expired = Vec::new();

        for (labels, alert) in self.active.iter_mut() {
            if !returned.contains(labels) {
                let mut keep_firing = false;
                if alert.state == AlertState::Firing && keep_firing_for > 0 {
                    let since = *alert.keep_firing_since.get_or_insert(ts);
                    keep_firing = ts - since < keep_firing_for;
                }
                let retention_over = alert
                    .resolved_at
                    .is_some_and(|resolved| ts - resolved > RESOLVED_RETENTION_MS);
                if alert.state == AlertState::Pending || retention_over {
                    expired.push(labels.clone());
                }
                if alert.state != AlertState::Inactive && !keep_firing {
                    alert.state = AlertState::Inactive;
                    alert.resolved_at = Some(ts);
                }
                if !keep_firing {
                    continue;
                }
            } else {
                alert.keep_firing_since = None;
            }

            active_or_pending += 1;
            if alert.state == AlertState::Pending && ts - alert.active_at >= hold {
                alert.state = AlertState::Firing;
                alert.fired_at = Some(ts);
                debug!(alert = %self.name, labels = %alert.labels, ts, "Alert started firing");
            }
        }
        for labels in expired {
            self.active.remove(&labels);
        }

        if limit > 0 && active_or_pending > limit {
            self.active.clear();
            return Err(EvalCause::LimitExceeded {
                limit,
                series: active_or_pending,
            });
        }

        let mut vector = Vec::new();
        for alert in self.active_alerts() {
            let mut alerts = alert.labels.clone();
            alerts.insert(METRIC_NAME, ALERT_METRIC_NAME);
            alerts.insert(ALERT_STATE_LABEL, &alert.state.to_string());
            vector.push(Sample {
                metric: alerts,
                t: ts,
                v: 1.0,
            });

            let mut for_state = alert.labels.clone();
            for_state.insert(METRIC_NAME, ALERT_FOR_STATE_METRIC_NAME);
            vector.push(Sample {
                metric: for_state,
                t: ts,
                v: (alert.active_at / 1000) as f64,
            });
        }
        Ok(vector)
    }
}

/// Values available to label and annotation templates
struct TemplateData<'a> {
    labels: &'a Labels,
    value: f64,
}

/// Expand `{{ $labels.name }}` and `{{ $value }}` style actions. Unknown
/// actions are replaced with an error marker, the way template failures are
/// reported in alert text.
fn expand(text: &str, data: &TemplateData<'_>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // unterminated action
            out.push_str(&rest[start..]);
            return out;
        };
        let action = after[..end].trim_matches('-').trim();
        let label = action
            .strip_prefix("$labels.")
            .or_else(|| action.strip_prefix(".Labels."));
        match (action, label) {
            (_, Some(name)) => out.push_str(data.labels.value(name)),
            ("$value" | ".Value", None) => out.push_str(&format_value(data.value)),
            _ => out.push_str(&format!(
                "<error expanding template: unsupported action {action:?}>"
            )),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Format a float the way Go's `%v` does: shortest representation,
/// switching to exponent form for very small or large magnitudes
pub(crate) fn format_value(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }
    if v == 0.0 {
        return "0".to_string();
    }
    let sci = format!("{v:e}");
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    if (-4..6).contains(&exp) {
        v.to_string()
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::promql::error::PromQLError;
    use crate::promql::parser::parse;

    const MIN: i64 = 60_000;

    /// Query function returning whatever the test put in the slot
    fn scripted() -> (QueryFunc, Arc<Mutex<Vector>>) {
        let slot = Arc::new(Mutex::new(Vec::new()));
        let reader = slot.clone();
        let query: QueryFunc = Arc::new(move |_: &Expr, _: i64| -> Result<Vector, PromQLError> {
            Ok(reader.lock().clone())
        });
        (query, slot)
    }

    fn sample(pairs: &[(&str, &str)], v: f64) -> Sample {
        Sample {
            metric: pairs.iter().copied().collect(),
            t: 0,
            v,
        }
    }

    fn rule(hold: Duration, keep_firing_for: Duration) -> AlertingRule {
        AlertingRule::new(
            "HighLoad".to_string(),
            parse("load > 1").unwrap(),
            hold,
            keep_firing_for,
            BTreeMap::from([("severity".to_string(), "page".to_string())]),
            BTreeMap::from([(
                "summary".to_string(),
                "{{ $labels.instance }} load is {{ $value }}".to_string(),
            )]),
        )
    }

    #[test]
    fn test_pending_then_firing() {
        let (query, slot) = scripted();
        *slot.lock() = vec![sample(&[("__name__", "load"), ("instance", "a")], 2.5)];
        let mut rule = rule(Duration::from_secs(120), Duration::ZERO);

        let out = rule.eval(0, &query, 0).unwrap();
        assert_eq!(rule.state(), AlertState::Pending);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].metric.get(ALERT_STATE_LABEL), Some("pending"));
        assert_eq!(out[0].metric.name(), Some(ALERT_METRIC_NAME));
        assert_eq!(out[0].metric.get("severity"), Some("page"));
        assert_eq!(out[1].metric.name(), Some(ALERT_FOR_STATE_METRIC_NAME));
        assert_eq!(out[1].v, 0.0);

        rule.eval(MIN, &query, 0).unwrap();
        assert_eq!(rule.state(), AlertState::Pending);
        let out = rule.eval(2 * MIN, &query, 0).unwrap();
        assert_eq!(rule.state(), AlertState::Firing);
        assert_eq!(out[0].metric.get(ALERT_STATE_LABEL), Some("firing"));

        let alert = rule.active_alerts().next().unwrap();
        assert_eq!(alert.annotations["summary"], "a load is 2.5");
        assert_eq!(alert.fired_at, Some(2 * MIN));
    }

    #[test]
    fn test_resolves_when_expression_empties() {
        let (query, slot) = scripted();
        *slot.lock() = vec![sample(&[("instance", "a")], 2.0)];
        let mut rule = rule(Duration::ZERO, Duration::ZERO);
        rule.eval(0, &query, 0).unwrap();
        assert_eq!(rule.state(), AlertState::Firing);

        slot.lock().clear();
        let out = rule.eval(MIN, &query, 0).unwrap();
        assert!(out.is_empty());
        assert_eq!(rule.state(), AlertState::Inactive);
    }

    #[test]
    fn test_keep_firing_for() {
        let (query, slot) = scripted();
        *slot.lock() = vec![sample(&[("instance", "a")], 2.0)];
        let mut rule = rule(Duration::ZERO, Duration::from_secs(120));
        rule.eval(0, &query, 0).unwrap();

        slot.lock().clear();
        assert_eq!(rule.eval(MIN, &query, 0).unwrap().len(), 2);
        assert_eq!(rule.eval(2 * MIN, &query, 0).unwrap().len(), 2);
        assert!(rule.eval(3 * MIN, &query, 0).unwrap().is_empty());
    }

    #[test]
    fn test_pending_alert_dropped_when_gone() {
        let (query, slot) = scripted();
        *slot.lock() = vec![sample(&[("instance", "a")], 2.0)];
        let mut rule = rule(Duration::from_secs(600), Duration::ZERO);
        rule.eval(0, &query, 0).unwrap();
        slot.lock().clear();
        rule.eval(MIN, &query, 0).unwrap();
        assert_eq!(rule.active.len(), 0);
    }

    #[test]
    fn test_limit_clears_alerts() {
        let (query, slot) = scripted();
        *slot.lock() = vec![sample(&[("instance", "a")], 2.0), sample(&[("instance", "b")], 2.0)];
        let mut rule = rule(Duration::ZERO, Duration::ZERO);
        assert!(matches!(
            rule.eval(0, &query, 1),
            Err(EvalCause::LimitExceeded { limit: 1, series: 2 })
        ));
        assert_eq!(rule.state(), AlertState::Inactive);
    }

    #[test]
    fn test_expand_templates() {
        let labels: Labels = [("job", "api")].into_iter().collect();
        let data = TemplateData {
            labels: &labels,
            value: 0.25,
        };
        assert_eq!(expand("{{ $labels.job }}: {{$value}}", &data), "api: 0.25");
        assert_eq!(expand("{{ .Labels.job }}", &data), "api");
        assert_eq!(expand("{{ $labels.missing }}", &data), "");
        assert!(expand("{{ humanize $value }}", &data).starts_with("<error expanding template"));
        assert_eq!(expand("plain", &data), "plain");
        assert_eq!(expand("open {{ $value", &data), "open {{ $value");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(2.5), "2.5");
        assert_eq!(format_value(100.0), "100");
        assert_eq!(format_value(0.0001), "0.0001");
        assert_eq!(format_value(0.00001), "1e-05");
        assert_eq!(format_value(1_000_000.0), "1e+06");
        assert_eq!(format_value(1_234_567.0), "1.234567e+06");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
    }
}
