//! Simulated-time rule replay
//!
//! Simulated time starts at the Unix epoch. The replay evaluates every rule
//! group at `0, interval, 2 * interval, ...` up to and including the
//! horizon, so recorded series and alert state exist before any query runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use engine::rules::RuleEvalError;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::fixture::Fixture;
use crate::rule_loader::RuleGroupSet;

/// Default last evaluation offset
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(60 * 60);

/// How far simulated time is replayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizon {
    /// Replay up to a fixed offset from the epoch
    Fixed(Duration),
    /// Replay up to the last sample of the longest fixture series
    FromFixture,
}

impl Default for Horizon {
    fn default() -> Self {
        Self::Fixed(DEFAULT_HORIZON)
    }
}

impl Horizon {
    /// Resolve to a concrete offset for `fixture`. A fixed horizon that
    /// ends before the fixture's data does is kept but logged.
    pub fn resolve(&self, fixture: &Fixture) -> Duration {
        match *self {
            Self::FromFixture => fixture.span().unwrap_or(Duration::ZERO),
            Self::Fixed(horizon) => {
                if let Some(span) = fixture.span().filter(|span| *span > horizon) {
                    warn!(
                        horizon = ?horizon,
                        fixture_span = ?span,
                        "Horizon ends before the fixture data; later samples are never evaluated by rules"
                    );
                }
                horizon
            }
        }
    }
}

/// Deterministic clock stepping from the epoch by a fixed interval
///
/// ```
/// use std::time::Duration;
/// use harness::evaluator::SimulatedClock;
///
/// let mut clock = SimulatedClock::new(Duration::from_secs(30));
/// assert_eq!(clock.now_ms(), 0);
/// clock.advance();
/// assert_eq!(clock.now_ms(), 30_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedClock {
    now_ms: i64,
    step_ms: i64,
}

impl SimulatedClock {
    #[must_use]
    pub fn new(step: Duration) -> Self {
        Self {
            now_ms: 0,
            step_ms: duration_ms(step),
        }
    }

    /// Current simulated time in milliseconds since the epoch
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    pub fn now(&self) -> DateTime<Utc> {
        timestamp_to_datetime(self.now_ms)
    }

    /// Move forward one step. Saturates instead of overflowing.
    pub fn advance(&mut self) {
        self.now_ms = self.now_ms.saturating_add(self.step_ms);
    }
}

/// Simulated wall-clock time `offset` after the epoch
pub fn simulated_time(offset: Duration) -> DateTime<Utc> {
    timestamp_to_datetime(duration_ms(offset))
}

pub(crate) fn timestamp_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Counts of a completed replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub ticks: usize,
    pub group_evaluations: usize,
}

/// Evaluate every group at each tick from the epoch through `horizon`.
///
/// A failing rule does not stop the replay. All failures are returned
/// together once the horizon is reached.
pub fn replay(groups: &mut RuleGroupSet, interval: Duration, horizon: Duration) -> Result<ReplayStats> {
    let mut clock = SimulatedClock::new(interval);
    let horizon_ms = duration_ms(horizon);
    let mut stats = ReplayStats::default();
    let mut errors: Vec<RuleEvalError> = Vec::new();

    while clock.now_ms() <= horizon_ms {
        let ts = clock.now_ms();
        for group in groups.groups_mut() {
            if let Err(errs) = group.eval(ts) {
                errors.extend(errs);
            }
            stats.group_evaluations += 1;
        }
        stats.ticks += 1;
        debug!(ts, groups = groups.len(), "Evaluated tick");

        let previous = ts;
        clock.advance();
        if clock.now_ms() == previous {
            break;
        }
    }

    info!(
        ticks = stats.ticks,
        horizon = ?horizon,
        failures = errors.len(),
        "Replayed rule groups"
    );
    if errors.is_empty() {
        Ok(stats)
    } else {
        Err(HarnessError::Evaluation(errors))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use engine::promql::types::Value;
    use engine::Engine;

    use super::*;
    use crate::fixture::SeriesSpec;
    use crate::rule_loader::load_rule_groups;

    fn rule_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn fixture(values: &str) -> Fixture {
        Fixture::new(
            vec![SeriesSpec {
                selector: "up".into(),
                values: values.into(),
            }],
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[test]
    fn test_clock_is_deterministic() {
        let mut a = SimulatedClock::new(Duration::from_secs(15));
        let mut b = SimulatedClock::new(Duration::from_secs(15));
        for _ in 0..4 {
            a.advance();
            b.advance();
        }
        assert_eq!(a, b);
        assert_eq!(a.now_ms(), 60_000);
        assert_eq!(a.now(), simulated_time(Duration::from_secs(60)));
    }

    #[test]
    fn test_simulated_time_starts_at_epoch() {
        assert_eq!(simulated_time(Duration::ZERO), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(
            simulated_time(Duration::from_secs(90)).to_rfc3339(),
            "1970-01-01T00:01:30+00:00"
        );
    }

    #[test]
    fn test_horizon_resolution() {
        let f = fixture("1x30");
        assert_eq!(Horizon::default().resolve(&f), DEFAULT_HORIZON);
        assert_eq!(Horizon::FromFixture.resolve(&f), Duration::from_secs(30 * 60));
        assert_eq!(
            Horizon::Fixed(Duration::from_secs(600)).resolve(&f),
            Duration::from_secs(600)
        );
        assert_eq!(Horizon::FromFixture.resolve(&fixture("_ _")), Duration::ZERO);
    }

    #[test]
    fn test_replay_covers_horizon_inclusively() {
        let engine = Engine::default();
        engine.load("load 1m\n  up 1x10\n").unwrap();
        let rules = rule_file("groups:\n  - name: g\n    rules:\n      - record: up:copy\n        expr: up\n");
        let mut groups = load_rule_groups(rules.path(), &engine, Duration::from_secs(60)).unwrap();

        let stats = replay(&mut groups, Duration::from_secs(60), Duration::from_secs(5 * 60)).unwrap();
        assert_eq!(stats.ticks, 6);
        assert_eq!(stats.group_evaluations, 6);
        assert_eq!(groups.groups()[0].last_eval(), Some(5 * 60_000));

        let query = |ts: i64| {
            engine
                .query_engine()
                .new_instant_query(engine.queryable(), "up:copy", ts)
                .unwrap()
                .exec()
                .unwrap()
        };
        assert!(matches!(query(5 * 60_000), Value::Vector(v) if v.len() == 1));
        // lookback from the last recorded sample has run out
        assert!(matches!(query(11 * 60_000), Value::Vector(v) if v.is_empty()));
    }

    #[test]
    fn test_replay_accumulates_errors() {
        let engine = Engine::default();
        engine
            .load("load 1m\n  up{job=\"a\"} 1x3\n  up{job=\"b\"} 1x3\n")
            .unwrap();
        let rules = rule_file(
            "groups:\n  - name: g\n    rules:\n      - record: flat\n        expr: up\n        labels:\n          job: ''\n      - record: total\n        expr: sum(up)\n",
        );
        let mut groups = load_rule_groups(rules.path(), &engine, Duration::from_secs(60)).unwrap();

        match replay(&mut groups, Duration::from_secs(60), Duration::from_secs(120)) {
            Err(HarnessError::Evaluation(errors)) => {
                assert_eq!(errors.len(), 3);
                assert_eq!(
                    errors.iter().map(|e| e.t).collect::<Vec<_>>(),
                    vec![0, 60_000, 120_000]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        // later rules kept running
        let result = engine
            .query_engine()
            .new_instant_query(engine.queryable(), "total", 120_000)
            .unwrap()
            .exec()
            .unwrap();
        assert!(matches!(result, Value::Vector(v) if v[0].v == 2.0));
    }
}
