//! Duration parsing and Prometheus-style rendering

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("invalid duration {input:?}: {reason}")]
    Invalid { input: String, reason: String },
    #[error("duration {input:?} must be positive")]
    NotPositive { input: String },
}

/// Parse a duration such as `15s`, `1m30s` or `500ms`
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    humantime::parse_duration(input.trim()).map_err(|e| DurationError::Invalid {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a duration that must be greater than zero
pub fn parse_positive_duration(input: &str) -> Result<Duration, DurationError> {
    let duration = parse_duration(input)?;
    if duration.is_zero() {
        return Err(DurationError::NotPositive {
            input: input.to_string(),
        });
    }
    Ok(duration)
}

/// Render a duration the way Prometheus prints them: `1h30m`, `15s`, `250ms`.
///
/// Sub-millisecond precision is dropped. The output contains no whitespace so
/// it can be embedded in whitespace-separated formats.
pub fn format_duration(duration: Duration) -> String {
    let mut ms = duration.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, size) in [
        ("w", 7 * 24 * 3_600_000u128),
        ("d", 24 * 3_600_000),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
        ("ms", 1),
    ] {
        if ms >= size {
            out.push_str(&format!("{}{unit}", ms / size));
            ms %= size;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prometheus_style() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_duration("abc"),
            Err(DurationError::Invalid { .. })
        ));
        assert!(parse_duration("15").is_err());
        assert!(matches!(
            parse_positive_duration("0s"),
            Err(DurationError::NotPositive { .. })
        ));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(15)), "15s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1s500ms");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_format_parses_back() {
        for d in [
            Duration::from_millis(250),
            Duration::from_secs(61),
            Duration::from_secs(26 * 3600 + 5),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }
}
