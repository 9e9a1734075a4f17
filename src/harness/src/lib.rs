//! Offline harness for PromQL recording and alerting rules
//!
//! A [`Harness`] loads a series fixture into an in-memory engine, replays
//! the rule groups of a rule file over simulated time and then answers
//! instant queries against the result:
//!
//! ```no_run
//! use std::time::Duration;
//! use harness::{evaluator::simulated_time, Harness};
//!
//! let harness = Harness::new("series.yml", "rules.yml")?;
//! let samples = harness.query("job:requests:rate5m", simulated_time(Duration::from_secs(600)))?;
//! for sample in samples {
//!     println!("{:?} = {}", sample.metric, sample.value);
//! }
//! harness.close();
//! # Ok::<(), harness::HarnessError>(())
//! ```
//!
//! A harness is built and queried from one thread; queries from several
//! threads at once are not supported.

pub mod encoder;
pub mod error;
pub mod evaluator;
pub mod fixture;
pub mod query;
pub mod rule_loader;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::config::Configuration;
use engine::storage::StorageStats;
use engine::{Engine, EngineOptions};
use tracing::info;

pub use error::{HarnessError, Result};
pub use evaluator::{Horizon, ReplayStats};
pub use fixture::{Fixture, SeriesSpec};
pub use query::Sample;
pub use rule_loader::RuleGroupSet;

/// Construction parameters of a [`Harness`]
#[derive(Debug, Clone, Default)]
pub struct HarnessOptions {
    pub horizon: Horizon,
    pub engine: EngineOptions,
}

impl HarnessOptions {
    pub fn from_config(config: &Configuration) -> Self {
        let horizon = if config.harness.horizon_from_fixture {
            Horizon::FromFixture
        } else {
            Horizon::Fixed(config.harness.horizon)
        };
        Self {
            horizon,
            engine: EngineOptions {
                lookback_delta: config.engine.lookback_delta,
                max_samples: config.engine.max_samples,
                default_subquery_step: config.engine.default_subquery_step,
            },
        }
    }
}

/// A fixture and rule file replayed to the horizon and ready for queries
///
/// Storage is released by [`Harness::close`] or when the harness is dropped.
#[derive(Debug)]
pub struct Harness {
    engine: Engine,
    fixture: Fixture,
    groups: RuleGroupSet,
    horizon: Duration,
    replay: ReplayStats,
}

impl Harness {
    /// Build a harness with default options
    pub fn new(series_path: impl AsRef<Path>, rules_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(series_path, rules_path, HarnessOptions::default())
    }

    /// Build a harness configured from a loaded [`Configuration`]
    pub fn with_config(
        series_path: impl AsRef<Path>,
        rules_path: impl AsRef<Path>,
        config: &Configuration,
    ) -> Result<Self> {
        Self::with_options(series_path, rules_path, HarnessOptions::from_config(config))
    }

    /// Load the fixture, ingest it, load the rules and replay them up to the
    /// horizon. Any failure aborts construction and releases the engine.
    pub fn with_options(
        series_path: impl AsRef<Path>,
        rules_path: impl AsRef<Path>,
        options: HarnessOptions,
    ) -> Result<Self> {
        let fixture = Fixture::load(series_path.as_ref())?;
        let engine = Engine::new(options.engine);
        let loaded = engine.load(&encoder::encode(&fixture))?;

        let interval = fixture.interval();
        let mut groups = rule_loader::load_rule_groups(rules_path.as_ref(), &engine, interval)?;
        rule_loader::warn_unknown_metrics(&groups, &fixture);

        let horizon = options.horizon.resolve(&fixture);
        let replay = evaluator::replay(&mut groups, interval, horizon)?;

        info!(
            series = loaded.series,
            samples = loaded.samples,
            groups = groups.len(),
            interval = ?interval,
            horizon = ?horizon,
            "Harness ready"
        );
        Ok(Self {
            engine,
            fixture,
            groups,
            horizon,
            replay,
        })
    }

    /// Run an instant query at simulated time `at`
    pub fn query(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Sample>> {
        query::instant_query(&self.engine, query, at)
    }

    /// Fixture interval, also the rule evaluation step
    pub fn interval(&self) -> Duration {
        self.fixture.interval()
    }

    /// Offset of the last replayed evaluation
    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    pub fn fixture(&self) -> &Fixture {
        &self.fixture
    }

    pub fn groups(&self) -> &RuleGroupSet {
        &self.groups
    }

    pub fn replay_stats(&self) -> ReplayStats {
        self.replay
    }

    /// Series and samples currently stored, recorded series included
    pub fn storage_stats(&self) -> StorageStats {
        self.engine.storage().stats()
    }

    /// Release the engine's storage
    pub fn close(self) -> StorageStats {
        let released = self.engine.close();
        info!(series = released.series, "Harness closed");
        released
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::evaluator::simulated_time;

    fn file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const SERIES: &str = "interval: 1m\ninput_series:\n  - series: 'requests_total{job=\"api\"}'\n    values: '0+60x30'\n";
    const RULES: &str = "groups:\n  - name: api\n    rules:\n      - record: job:requests:rate5m\n        expr: sum by (job) (rate(requests_total[5m]))\n";

    #[test]
    fn test_build_and_query() {
        let (series, rules) = (file(SERIES), file(RULES));
        let harness = Harness::new(series.path(), rules.path()).unwrap();
        assert_eq!(harness.interval(), Duration::from_secs(60));
        assert_eq!(harness.horizon(), Duration::from_secs(3600));
        assert_eq!(harness.replay_stats().ticks, 61);

        let samples = harness
            .query("job:requests:rate5m", simulated_time(Duration::from_secs(600)))
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].metric["job"], "api");
        assert!((samples[0].value - 1.0).abs() < 1e-9);

        let released = harness.close();
        assert_eq!(released.series, 2);
    }

    #[test]
    fn test_horizon_from_config() {
        let (series, rules) = (file(SERIES), file(RULES));
        let mut config = Configuration::default();
        config.harness.horizon_from_fixture = true;
        let harness = Harness::with_config(series.path(), rules.path(), &config).unwrap();
        assert_eq!(harness.horizon(), Duration::from_secs(30 * 60));
        assert_eq!(harness.replay_stats().ticks, 31);
    }

    #[test]
    fn test_fixed_horizon_option() {
        let (series, rules) = (file(SERIES), file(RULES));
        let options = HarnessOptions {
            horizon: Horizon::Fixed(Duration::from_secs(300)),
            ..HarnessOptions::default()
        };
        let harness = Harness::with_options(series.path(), rules.path(), options).unwrap();
        assert_eq!(harness.replay_stats().ticks, 6);
        let late = harness
            .query("job:requests:rate5m", simulated_time(Duration::from_secs(20 * 60)))
            .unwrap();
        assert!(late.is_empty());
    }

    #[test]
    fn test_ingest_error() {
        let series = file("interval: 1m\ninput_series:\n  - series: 'up{job=~\"a\"}'\n    values: '1'\n");
        let rules = file(RULES);
        let err = Harness::new(series.path(), rules.path()).unwrap_err();
        assert!(matches!(err, HarnessError::Ingest(_)));
    }

    #[test]
    fn test_query_errors_leave_harness_usable() {
        let (series, rules) = (file(SERIES), file(RULES));
        let harness = Harness::new(series.path(), rules.path()).unwrap();
        let at = simulated_time(Duration::from_secs(600));
        assert!(harness.query("sum(", at).is_err());
        assert!(harness.query("1", at).is_err());
        assert_eq!(harness.query("requests_total", at).unwrap().len(), 1);
    }
}
