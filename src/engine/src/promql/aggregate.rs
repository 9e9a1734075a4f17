//! Aggregation operators

use std::collections::HashMap;

use promql_parser::parser::{AggregateExpr, LabelModifier};

use super::error::PromQLError;
use super::eval::Evaluator;
use super::functions::{fold_extreme, quantile, variance};
use super::types::{Sample, Value, Vector};
use crate::labels::{is_valid_label_name, Labels};

pub(super) fn eval_aggregate(
    ev: &mut Evaluator<'_>,
    agg: &AggregateExpr,
    ts: i64,
) -> Result<Value, PromQLError> {
    let op = agg.op.to_string().to_lowercase();

    // Parameters are evaluated before the aggregated expression
    let mut k = 0i64;
    let mut q = f64::NAN;
    let mut value_label = String::new();
    match op.as_str() {
        "topk" | "bottomk" => {
            let param = agg
                .param
                .as_deref()
                .ok_or_else(|| PromQLError::function(&op, "missing k parameter"))?;
            let v = ev.eval_scalar(param, ts)?;
            if v.is_nan() {
                return Err(PromQLError::function(&op, "k parameter is NaN"));
            }
            k = v as i64;
        }
        "quantile" => {
            let param = agg
                .param
                .as_deref()
                .ok_or_else(|| PromQLError::function(&op, "missing quantile parameter"))?;
            q = ev.eval_scalar(param, ts)?;
        }
        "count_values" => {
            let param = agg
                .param
                .as_deref()
                .ok_or_else(|| PromQLError::function(&op, "missing label parameter"))?;
            value_label = ev.eval_string(param, ts)?;
            if !is_valid_label_name(&value_label) {
                return Err(PromQLError::function(
                    &op,
                    format!("invalid label name {value_label:?}"),
                ));
            }
        }
        _ => {}
    }

    let input = ev.eval_vector(&agg.expr, ts)?;
    let groups = group_samples(input, agg.modifier.as_ref());

    let mut out: Vector = Vec::with_capacity(groups.len());
    for (key, samples) in groups {
        match op.as_str() {
            "topk" | "bottomk" => {
                out.extend(select_k(samples, k, op == "topk").into_iter().map(|s| Sample {
                    metric: s.metric,
                    t: ts,
                    v: s.v,
                }));
            }
            "count_values" => {
                let mut counts: Vec<(String, f64)> = Vec::new();
                for s in &samples {
                    let formatted = format_value(s.v);
                    match counts.iter_mut().find(|(v, _)| *v == formatted) {
                        Some((_, n)) => *n += 1.0,
                        None => counts.push((formatted, 1.0)),
                    }
                }
                for (formatted, n) in counts {
                    let mut metric = key.clone();
                    metric.insert(&value_label, &formatted);
                    out.push(Sample { metric, t: ts, v: n });
                }
            }
            other => {
                let values = samples.iter().map(|s| s.v);
                let v = match other {
                    "sum" => values.sum(),
                    "avg" => values.sum::<f64>() / samples.len() as f64,
                    "count" => samples.len() as f64,
                    "group" => 1.0,
                    "min" => fold_extreme(values, |cur, v| v < cur),
                    "max" => fold_extreme(values, |cur, v| v > cur),
                    "stddev" => variance(values).sqrt(),
                    "stdvar" => variance(values),
                    "quantile" => quantile(q, values.collect()),
                    unsupported => {
                        return Err(PromQLError::Unsupported(format!(
                            "aggregation {unsupported} is not supported"
                        )));
                    }
                };
                out.push(Sample {
                    metric: key,
                    t: ts,
                    v,
                });
            }
        }
    }
    Ok(Value::Vector(out))
}

/// Partition samples by their grouping labels, in order of first appearance
fn group_samples(input: Vector, modifier: Option<&LabelModifier>) -> Vec<(Labels, Vector)> {
    let mut groups: Vec<(Labels, Vector)> = Vec::new();
    let mut index: HashMap<Labels, usize> = HashMap::new();
    for sample in input {
        let key = match modifier {
            Some(LabelModifier::Include(by)) => sample.metric.keep_only(&by.labels),
            Some(LabelModifier::Exclude(without)) => {
                sample.metric.without_name().drop_names(&without.labels)
            }
            None => Labels::new(),
        };
        match index.get(&key) {
            Some(&i) => groups[i].1.push(sample),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![sample]));
            }
        }
    }
    groups
}

/// The `k` largest (or smallest) samples, NaN ranked last
fn select_k(mut samples: Vector, k: i64, largest: bool) -> Vector {
    if k < 1 {
        return Vec::new();
    }
    samples.sort_by(|a, b| match (a.v.is_nan(), b.v.is_nan()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        (false, false) if largest => b.v.total_cmp(&a.v),
        (false, false) => a.v.total_cmp(&b.v),
    });
    samples.truncate(usize::try_from(k).unwrap_or(usize::MAX));
    samples
}

/// Render a sample value as a label value
fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}
