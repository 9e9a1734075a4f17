//! Series fixtures
//!
//! A fixture is a YAML document describing synthetic input series:
//!
//! ```yaml
//! interval: 1m
//! input_series:
//!   - series: 'http_requests_total{job="api"}'
//!     values: '0+10x60'
//! ```

use std::path::Path;
use std::time::Duration;

use engine::duration::{parse_positive_duration, DurationError};
use engine::load::{expand_values, SequenceValue};
use serde::Deserialize;

use crate::error::{HarnessError, Result};

/// One input series: a selector and its value sequence
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeriesSpec {
    #[serde(rename = "series")]
    pub selector: String,
    pub values: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureFile {
    input_series: Vec<SeriesSpec>,
    interval: String,
}

/// Parsed fixture file
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    series_specs: Vec<SeriesSpec>,
    interval: Duration,
}

impl Fixture {
    pub fn new(series_specs: Vec<SeriesSpec>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(DurationError::NotPositive {
                input: format!("{interval:?}"),
            }
            .into());
        }
        Ok(Self {
            series_specs,
            interval,
        })
    }

    /// Read and validate a fixture file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| HarnessError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content, path)
    }

    /// Parse fixture YAML. `path` is only used in error messages.
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        let file: FixtureFile =
            serde_yaml::from_str(content).map_err(|source| HarnessError::Format {
                path: path.to_path_buf(),
                source,
            })?;
        let interval = parse_positive_duration(&file.interval)?;
        Self::new(file.input_series, interval)
    }

    pub fn series_specs(&self) -> &[SeriesSpec] {
        &self.series_specs
    }

    /// Spacing between consecutive samples and the rule evaluation step
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Offset of the last sample of the longest series, or `None` when no
    /// series carries a value
    ///
    /// Series whose values do not parse are skipped; ingestion reports them.
    pub fn span(&self) -> Option<Duration> {
        self.series_specs
            .iter()
            .filter_map(|spec| expand_values(&spec.values).ok())
            .filter_map(|values| {
                values
                    .iter()
                    .rposition(|v| !matches!(v, SequenceValue::Omitted))
            })
            .max()
            .map(|last| {
                u32::try_from(last)
                    .ok()
                    .and_then(|n| self.interval.checked_mul(n))
                    .unwrap_or(Duration::MAX)
            })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse(yaml: &str) -> Result<Fixture> {
        Fixture::from_yaml(yaml, Path::new("fixture.yml"))
    }

    #[test]
    fn test_parse_fixture() {
        let fixture = parse(
            "interval: 30s\ninput_series:\n  - series: 'up{job=\"a\"}'\n    values: '1 1 1'\n  - series: errors_total\n    values: '0+1x5'\n",
        )
        .unwrap();
        assert_eq!(fixture.interval(), Duration::from_secs(30));
        assert_eq!(fixture.series_specs().len(), 2);
        assert_eq!(fixture.series_specs()[0].selector, "up{job=\"a\"}");
        assert_eq!(fixture.series_specs()[1].values, "0+1x5");
    }

    #[test]
    fn test_invalid_interval() {
        let err = parse("interval: abc\ninput_series: []\n").unwrap_err();
        assert!(matches!(err, HarnessError::Duration(DurationError::Invalid { .. })));

        let err = parse("interval: 0s\ninput_series: []\n").unwrap_err();
        assert!(matches!(err, HarnessError::Duration(DurationError::NotPositive { .. })));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = parse("interval: 1m\ninput_series: []\nevaluation_interval: 1m\n").unwrap_err();
        assert!(matches!(err, HarnessError::Format { .. }));

        let err = parse("interval: 1m\ninput_series:\n  - series: up\n    value: '1'\n").unwrap_err();
        assert!(matches!(err, HarnessError::Format { .. }));
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert!(matches!(
            parse("input_series: []\n").unwrap_err(),
            HarnessError::Format { .. }
        ));
        assert!(matches!(
            parse("interval: 1m\n").unwrap_err(),
            HarnessError::Format { .. }
        ));
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"interval: 1m\ninput_series:\n  - series: up\n    values: '1x3'\n")
            .unwrap();
        let fixture = Fixture::load(file.path()).unwrap();
        assert_eq!(fixture.series_specs().len(), 1);

        let err = Fixture::load("/nonexistent/fixture.yml").unwrap_err();
        assert!(matches!(err, HarnessError::Load { .. }));
    }

    #[test]
    fn test_span_uses_longest_series() {
        let fixture = Fixture::new(
            vec![
                SeriesSpec {
                    selector: "a".into(),
                    values: "1x10".into(),
                },
                SeriesSpec {
                    selector: "b".into(),
                    values: "1 2 3 _ _".into(),
                },
            ],
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(fixture.span(), Some(Duration::from_secs(600)));

        let empty = Fixture::new(Vec::new(), Duration::from_secs(60)).unwrap();
        assert_eq!(empty.span(), None);
    }

    #[test]
    fn test_span_saturates() {
        let fixture = Fixture::new(
            vec![SeriesSpec {
                selector: "a".into(),
                values: "1 2 3 4 5".into(),
            }],
            Duration::MAX / 2,
        )
        .unwrap();
        assert_eq!(fixture.span(), Some(Duration::MAX));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(Fixture::new(Vec::new(), Duration::ZERO).is_err());
    }
}
