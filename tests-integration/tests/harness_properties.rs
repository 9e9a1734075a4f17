//! End-to-end properties of the rule harness
//!
//! Each test writes a fixture and rule file, replays the rules over
//! simulated time and checks query results.

use std::collections::BTreeMap;

use anyhow::Result;
use engine::promql::types::ValueType;
use harness::HarnessError;
use tests_integration::fixtures::HarnessTestContext;
use tests_integration::{init_test_logging, minutes};

const SERIES: &str = r#"
interval: 1m
input_series:
  - series: 'http_requests_total{job="api", instance="a"}'
    values: '0+60x60'
  - series: 'http_requests_total{job="api", instance="b"}'
    values: '0+120x60'
  - series: 'up{job="api", instance="a"}'
    values: '1x60'
  - series: 'events_total'
    values: '0+1x60'
"#;

const RULES: &str = r#"
groups:
  - name: api
    rules:
      - record: job:http_requests:rate5m
        expr: sum by (job) (rate(http_requests_total[5m]))
      - record: instance:up:copy
        expr: up
      - record: events:full_window
        expr: count_over_time(events_total[10m]) >= 10
      - record: missing:sum
        expr: sum(metric_that_does_not_exist)
"#;

fn context() -> Result<HarnessTestContext> {
    init_test_logging();
    HarnessTestContext::new(SERIES, RULES)
}

#[test]
fn test_identical_inputs_give_identical_answers() -> Result<()> {
    let ctx = context()?;
    let first = ctx.build()?;
    let second = ctx.build()?;

    for query in [
        "job:http_requests:rate5m",
        "http_requests_total",
        "instance:up:copy",
        "events:full_window",
    ] {
        for at in [0, 7, 30, 60] {
            assert_eq!(
                first.query(query, minutes(at))?,
                second.query(query, minutes(at))?,
                "{query} at {at}m"
            );
        }
    }
    Ok(())
}

#[test]
fn test_scalar_query_is_rejected() -> Result<()> {
    let harness = context()?.build()?;
    assert!(matches!(
        harness.query("1", minutes(5)),
        Err(HarnessError::NotVector(ValueType::Scalar))
    ));
    assert!(matches!(
        harness.query("scalar(up)", minutes(5)),
        Err(HarnessError::NotVector(ValueType::Scalar))
    ));
    Ok(())
}

#[test]
fn test_queries_see_data_as_of_simulated_time() -> Result<()> {
    let harness = context()?.build()?;
    for at in [0, 7, 42] {
        let samples = harness.query("events_total", minutes(at))?;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, at as f64);
        assert_eq!(samples[0].timestamp, minutes(at));
    }

    let rate = harness.query("job:http_requests:rate5m", minutes(10))?;
    assert_eq!(rate.len(), 1);
    assert!((rate[0].value - 3.0).abs() < 1e-9, "got {}", rate[0].value);
    Ok(())
}

#[test]
fn test_labels_survive_recording_rule() -> Result<()> {
    let harness = context()?.build()?;
    let input = harness.query("up", minutes(20))?;
    let recorded = harness.query("instance:up:copy", minutes(20))?;
    assert_eq!(recorded.len(), 1);

    let without_name = |metric: &BTreeMap<String, String>| {
        let mut metric = metric.clone();
        metric.remove("__name__");
        metric
    };
    assert_eq!(without_name(&recorded[0].metric), without_name(&input[0].metric));
    assert_eq!(recorded[0].metric["__name__"], "instance:up:copy");
    assert_eq!(recorded[0].value, 1.0);
    Ok(())
}

#[test]
fn test_windowed_rule_fills_after_window_closes() -> Result<()> {
    let harness = context()?.build()?;

    let early = harness.query("events:full_window", minutes(5))?;
    assert!(early.is_empty());

    let late = harness.query("events:full_window", minutes(15))?;
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].value, 10.0);
    Ok(())
}

#[test]
fn test_rule_on_undefined_metric_is_absent() -> Result<()> {
    let harness = context()?.build()?;
    assert!(harness.query("missing:sum", minutes(30))?.is_empty());
    assert!(harness.query("metric_that_does_not_exist", minutes(30))?.is_empty());
    Ok(())
}

#[test]
fn test_recorded_series_in_storage() -> Result<()> {
    let harness = context()?.build()?;
    // 4 input series plus 3 recorded ones
    assert_eq!(harness.storage_stats().series, 7);
    let released = harness.close();
    assert_eq!(released.series, 7);
    Ok(())
}

#[test]
fn test_samples_serialize_like_cli_output() -> Result<()> {
    let harness = context()?.build()?;
    let samples = harness.query("instance:up:copy", minutes(3))?;
    let json: serde_json::Value = serde_json::from_str(&serde_json::to_string_pretty(&samples)?)?;
    assert_eq!(json[0]["metric"]["instance"], "a");
    assert_eq!(json[0]["timestamp"], "1970-01-01T00:03:00Z");
    assert_eq!(json[0]["value"], 1.0);
    Ok(())
}
