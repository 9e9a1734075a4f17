//! Harness construction failures

use std::time::Duration;

use anyhow::Result;
use engine::duration::DurationError;
use engine::rules::RuleError;
use harness::{Harness, HarnessError, HarnessOptions, Horizon};
use tests_integration::fixtures::HarnessTestContext;
use tests_integration::{init_test_logging, minutes};

const SERIES: &str = "interval: 1m\ninput_series:\n  - series: up\n    values: '1x30'\n";
const RULES: &str = "groups:\n  - name: g\n    rules:\n      - record: up:copy\n        expr: up\n";

#[test]
fn test_invalid_interval() -> Result<()> {
    init_test_logging();
    let ctx = HarnessTestContext::new("interval: abc\ninput_series: []\n", RULES)?;
    assert!(matches!(
        ctx.build(),
        Err(HarnessError::Duration(DurationError::Invalid { .. }))
    ));
    Ok(())
}

#[test]
fn test_malformed_fixture() -> Result<()> {
    init_test_logging();
    let ctx = HarnessTestContext::new("input_series: {series: up}\ninterval: 1m\n", RULES)?;
    assert!(matches!(ctx.build(), Err(HarnessError::Format { .. })));
    Ok(())
}

#[test]
fn test_missing_fixture_file() -> Result<()> {
    init_test_logging();
    let ctx = HarnessTestContext::new(SERIES, RULES)?;
    let err = Harness::new(ctx.series_path().with_extension("missing"), ctx.rules_path()).unwrap_err();
    assert!(matches!(err, HarnessError::Load { .. }));
    Ok(())
}

#[test]
fn test_bad_value_sequence() -> Result<()> {
    init_test_logging();
    let ctx = HarnessTestContext::new(
        "interval: 1m\ninput_series:\n  - series: up\n    values: '1 two 3'\n",
        RULES,
    )?;
    assert!(matches!(ctx.build(), Err(HarnessError::Ingest(_))));
    Ok(())
}

#[test]
fn test_rule_errors_are_all_reported() -> Result<()> {
    init_test_logging();
    let rules = r#"
groups:
  - name: g
    rules:
      - record: 'not a metric'
        expr: up
      - alert: Broken
        expr: 'rate(up[5m'
      - record: both
        alert: both
        expr: up
  - name: g
    rules: []
"#;
    let ctx = HarnessTestContext::new(SERIES, rules)?;
    match ctx.build() {
        Err(HarnessError::RuleLoad(errors)) => {
            assert_eq!(errors.len(), 4);
            assert_eq!(
                errors.iter().filter(|e| matches!(e, RuleError::Group { .. })).count(),
                1
            );
        }
        other => panic!("expected rule load errors, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_evaluation_errors_surface() -> Result<()> {
    init_test_logging();
    let series = "interval: 1m\ninput_series:\n  - series: 'up{job=\"a\"}'\n    values: '1x3'\n  - series: 'up{job=\"b\"}'\n    values: '1x3'\n";
    let rules = "groups:\n  - name: g\n    rules:\n      - record: flattened\n        expr: up\n        labels:\n          job: ''\n";
    let ctx = HarnessTestContext::new(series, rules)?;
    let options = HarnessOptions {
        horizon: Horizon::Fixed(Duration::from_secs(120)),
        ..HarnessOptions::default()
    };
    match ctx.build_with(options) {
        Err(HarnessError::Evaluation(errors)) => {
            assert_eq!(errors.len(), 3);
            assert!(errors[0].to_string().contains("flattened"));
        }
        other => panic!("expected evaluation errors, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_query_error_keeps_harness_usable() -> Result<()> {
    init_test_logging();
    let harness = HarnessTestContext::new(SERIES, RULES)?.build()?;
    assert!(matches!(
        harness.query("sum by (", minutes(5)),
        Err(HarnessError::Query(_))
    ));
    assert_eq!(harness.query("up:copy", minutes(5))?.len(), 1);
    Ok(())
}
