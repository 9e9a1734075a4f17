//! Series load grammar
//!
//! Synthetic data is described in the text format used by Prometheus rule
//! unit tests:
//!
//! ```text
//! load 15s
//!   http_requests_total{job="api", instance="a"} 0+10x20
//!   up{job="api", instance="a"} 1 1 _ 0 stale 1x5
//! ```
//!
//! The `load` header names the step between consecutive values; the i-th
//! value of every series is stored at `i * step` milliseconds after the
//! epoch. Value tokens:
//!
//! - a number (`1`, `-2.5`, `Inf`, `NaN`)
//! - `_` for a missing sample, `stale` for a staleness marker
//! - `a+bxN` / `a-bxN`: N+1 values starting at `a`, stepping by `b`
//! - `axN`: N+1 copies of `a`; `_xN`: N missing samples

use std::time::Duration;

use promql_parser::label::MatchOp;
use promql_parser::parser::{self, Expr};
use thiserror::Error;
use tracing::debug;

use crate::duration::{parse_positive_duration, DurationError};
use crate::labels::{Labels, METRIC_NAME};
use crate::promql::eval::duration_ms;
use crate::storage::{stale_nan, Appendable, StorageError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("line {line}: {source}")]
    Duration {
        line: usize,
        #[source]
        source: DurationError,
    },
    #[error("failed to append series {series}: {source}")]
    Storage {
        series: String,
        #[source]
        source: StorageError,
    },
}

/// One element of an expanded value sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SequenceValue {
    Value(f64),
    Stale,
    Omitted,
}

/// A series and its expanded values
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSeries {
    pub metric: Labels,
    pub values: Vec<SequenceValue>,
}

/// A parsed `load` block
#[derive(Debug, Clone, PartialEq)]
pub struct LoadCommand {
    pub interval: Duration,
    pub series: Vec<LoadSeries>,
}

/// Counts of what a load wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub series: usize,
    pub samples: usize,
}

impl LoadCommand {
    /// Write every value into storage through a single appender
    pub fn append(&self, appendable: &dyn Appendable) -> Result<LoadStats, LoadError> {
        let step = duration_ms(self.interval);
        let mut appender = appendable.appender();
        let mut stats = LoadStats::default();

        for series in &self.series {
            for (i, value) in series.values.iter().enumerate() {
                let v = match value {
                    SequenceValue::Omitted => continue,
                    SequenceValue::Stale => stale_nan(),
                    SequenceValue::Value(v) => *v,
                };
                let t = i64::try_from(i).unwrap_or(i64::MAX).saturating_mul(step);
                appender
                    .append(&series.metric, t, v)
                    .map_err(|source| LoadError::Storage {
                        series: series.metric.to_string(),
                        source,
                    })?;
                stats.samples += 1;
            }
            stats.series += 1;
        }

        appender.commit().map_err(|source| LoadError::Storage {
            series: String::new(),
            source,
        })?;
        debug!(
            series = stats.series,
            samples = stats.samples,
            "Loaded synthetic series"
        );
        Ok(stats)
    }

}

/// Parse every `load` block in `text`
pub fn parse_load_commands(text: &str) -> Result<Vec<LoadCommand>, LoadError> {
    let mut commands: Vec<LoadCommand> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let indented = raw.starts_with(char::is_whitespace);
        if !indented {
            let interval = parse_load_header(trimmed, line)?;
            commands.push(LoadCommand {
                interval,
                series: Vec::new(),
            });
            continue;
        }

        let Some(command) = commands.last_mut() else {
            return Err(LoadError::Syntax {
                line,
                reason: "series definition outside of a load command".to_string(),
            });
        };
        let (selector, values) = split_series_line(trimmed);
        let metric = parse_series_selector(selector).map_err(|reason| LoadError::Syntax {
            line,
            reason,
        })?;
        let values = expand_values(values).map_err(|reason| LoadError::Syntax { line, reason })?;
        command.series.push(LoadSeries { metric, values });
    }

    if commands.is_empty() {
        return Err(LoadError::Syntax {
            line: 0,
            reason: "no load command found".to_string(),
        });
    }
    Ok(commands)
}

fn parse_load_header(line: &str, line_no: usize) -> Result<Duration, LoadError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("load"), Some(interval), None) => {
            parse_positive_duration(interval).map_err(|source| LoadError::Duration {
                line: line_no,
                source,
            })
        }
        _ => Err(LoadError::Syntax {
            line: line_no,
            reason: format!("expected `load <interval>`, got {line:?}"),
        }),
    }
}

/// Split `metric{a="b c"} 1 2 3` into the selector and the value list
fn split_series_line(line: &str) -> (&str, &str) {
    let mut in_quotes = false;
    let mut escaped = false;
    let mut in_braces = false;

    for (i, c) in line.char_indices() {
        if in_quotes {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '{' => in_braces = true,
            '}' => return (&line[..=i], line[i + 1..].trim()),
            c if c.is_whitespace() && !in_braces => return (&line[..i], line[i..].trim()),
            _ => {}
        }
    }
    (line, "")
}

/// Parse a series selector that may only use equality matchers into a
/// label set
pub fn parse_series_selector(selector: &str) -> Result<Labels, String> {
    let expr = parser::parse(selector).map_err(|e| format!("invalid series {selector:?}: {e}"))?;
    let Expr::VectorSelector(vs) = expr else {
        return Err(format!("{selector:?} is not a series selector"));
    };
    if vs.offset.is_some() || vs.at.is_some() {
        return Err(format!("series {selector:?} must not use offset or @"));
    }
    if !vs.matchers.or_matchers.is_empty() {
        return Err(format!("series {selector:?} must not use `or` matchers"));
    }

    let mut labels = Labels::new();
    if let Some(name) = &vs.name {
        labels.insert(METRIC_NAME, name);
    }
    for matcher in &vs.matchers.matchers {
        if !matches!(matcher.op, MatchOp::Equal) {
            return Err(format!(
                "series {selector:?} may only use equality matchers, found {:?} on {}",
                matcher.op, matcher.name
            ));
        }
        labels.insert(&matcher.name, &matcher.value);
    }
    if labels.is_empty() {
        return Err(format!("series {selector:?} has no labels"));
    }
    Ok(labels)
}

/// Expand a value sequence such as `0+10x3 _ stale 5` into individual values
pub fn expand_values(input: &str) -> Result<Vec<SequenceValue>, String> {
    let mut values = Vec::new();
    for token in input.split_whitespace() {
        match token {
            "_" => values.push(SequenceValue::Omitted),
            "stale" => values.push(SequenceValue::Stale),
            _ => match token.split_once('x') {
                Some((base, times)) => expand_repeated(base, times, &mut values)
                    .map_err(|reason| format!("invalid value sequence {token:?}: {reason}"))?,
                None => values.push(SequenceValue::Value(parse_number(token)?)),
            },
        }
    }
    Ok(values)
}

fn expand_repeated(base: &str, times: &str, out: &mut Vec<SequenceValue>) -> Result<(), String> {
    let times: usize = times
        .parse()
        .map_err(|_| format!("repetition count {times:?} is not a non-negative integer"))?;

    if base == "_" {
        out.extend(std::iter::repeat_n(SequenceValue::Omitted, times));
        return Ok(());
    }

    let (start, step) = match split_step(base) {
        Some((start, sign, step)) => {
            let step = parse_number(step)?;
            (parse_number(start)?, if sign == '-' { -step } else { step })
        }
        None => (parse_number(base)?, 0.0),
    };

    let mut current = start;
    for _ in 0..=times {
        out.push(SequenceValue::Value(current));
        current += step;
    }
    Ok(())
}

/// Find the `+`/`-` separating start and step, skipping a leading sign and
/// exponent signs
fn split_step(base: &str) -> Option<(&str, char, &str)> {
    let bytes = base.as_bytes();
    (1..bytes.len()).find_map(|i| {
        let c = bytes[i];
        let after_exponent = matches!(bytes[i - 1], b'e' | b'E')
            && bytes[..i - 1].iter().any(|b| b.is_ascii_digit());
        if (c == b'+' || c == b'-') && !after_exponent {
            Some((&base[..i], c as char, &base[i + 1..]))
        } else {
            None
        }
    })
}

fn parse_number(token: &str) -> Result<f64, String> {
    token
        .parse::<f64>()
        .map_err(|_| format!("invalid number {token:?}"))
}
