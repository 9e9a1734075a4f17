//! PromQL function implementations

use chrono::{DateTime, Datelike, Timelike, Utc};
use promql_parser::label::MatchOp;
use promql_parser::parser::{Call, Expr};

use super::error::PromQLError;
use super::eval::{Evaluator, RangeArg};
use super::types::{anchored_regex, Point, Sample, Value, Vector};
use crate::labels::{is_valid_label_name, Labels, METRIC_NAME};

pub(super) fn eval_call(ev: &mut Evaluator<'_>, call: &Call, ts: i64) -> Result<Value, PromQLError> {
    let name = call.func.name;
    let args: Vec<&Expr> = call.args.args.iter().map(|a| a.as_ref()).collect();

    let vector = match name {
        "time" => {
            return Ok(Value::Scalar {
                t: ts,
                v: ts as f64 / 1000.0,
            });
        }
        "scalar" => {
            let v = ev.eval_vector(arg(name, &args, 0)?, ts)?;
            let v = match v.as_slice() {
                [single] => single.v,
                _ => f64::NAN,
            };
            return Ok(Value::Scalar { t: ts, v });
        }
        "vector" => {
            let v = ev.eval_scalar(arg(name, &args, 0)?, ts)?;
            vec![Sample {
                metric: Labels::new(),
                t: ts,
                v,
            }]
        }

        "rate" => over_range(ev, name, &args, ts, false, |points, r| {
            extrapolated_rate(points, r.end - r.range, r.end, true, true)
        })?,
        "increase" => over_range(ev, name, &args, ts, false, |points, r| {
            extrapolated_rate(points, r.end - r.range, r.end, true, false)
        })?,
        "delta" => over_range(ev, name, &args, ts, false, |points, r| {
            extrapolated_rate(points, r.end - r.range, r.end, false, false)
        })?,
        "irate" => over_range(ev, name, &args, ts, false, |points, _| {
            instant_value(points, true)
        })?,
        "idelta" => over_range(ev, name, &args, ts, false, |points, _| {
            instant_value(points, false)
        })?,
        "deriv" => over_range(ev, name, &args, ts, false, |points, _| {
            (points.len() >= 2).then(|| linear_regression(points, points[0].t).0)
        })?,
        "predict_linear" => {
            let seconds = ev.eval_scalar(arg(name, &args, 1)?, ts)?;
            over_range(ev, name, &args, ts, false, |points, _| {
                (points.len() >= 2).then(|| {
                    let (slope, intercept) = linear_regression(points, ts);
                    slope * seconds + intercept
                })
            })?
        }
        "changes" => over_range(ev, name, &args, ts, false, |points, _| {
            let changes = points
                .windows(2)
                .filter(|w| w[0].v != w[1].v && !(w[0].v.is_nan() && w[1].v.is_nan()))
                .count();
            Some(changes as f64)
        })?,
        "resets" => over_range(ev, name, &args, ts, false, |points, _| {
            Some(points.windows(2).filter(|w| w[1].v < w[0].v).count() as f64)
        })?,
        "avg_over_time" => over_range(ev, name, &args, ts, false, |points, _| {
            Some(points.iter().map(|p| p.v).sum::<f64>() / points.len() as f64)
        })?,
        "sum_over_time" => over_range(ev, name, &args, ts, false, |points, _| {
            Some(points.iter().map(|p| p.v).sum())
        })?,
        "min_over_time" => over_range(ev, name, &args, ts, false, |points, _| {
            Some(fold_extreme(points.iter().map(|p| p.v), |cur, v| v < cur))
        })?,
        "max_over_time" => over_range(ev, name, &args, ts, false, |points, _| {
            Some(fold_extreme(points.iter().map(|p| p.v), |cur, v| v > cur))
        })?,
        "count_over_time" => over_range(ev, name, &args, ts, false, |points, _| {
            Some(points.len() as f64)
        })?,
        "last_over_time" => over_range(ev, name, &args, ts, true, |points, _| {
            points.last().map(|p| p.v)
        })?,
        "present_over_time" => over_range(ev, name, &args, ts, false, |_, _| Some(1.0))?,
        "stddev_over_time" => over_range(ev, name, &args, ts, false, |points, _| {
            Some(variance(points.iter().map(|p| p.v)).sqrt())
        })?,
        "stdvar_over_time" => over_range(ev, name, &args, ts, false, |points, _| {
            Some(variance(points.iter().map(|p| p.v)))
        })?,
        "quantile_over_time" => {
            let q = ev.eval_scalar(arg(name, &args, 0)?, ts)?;
            let range = ev.eval_range(arg(name, &args, 1)?, ts)?;
            range
                .matrix
                .into_iter()
                .map(|s| Sample {
                    metric: s.metric.without_name(),
                    t: ts,
                    v: quantile(q, s.points.iter().map(|p| p.v).collect()),
                })
                .collect()
        }
        "absent_over_time" => {
            let expr = arg(name, &args, 0)?;
            let range = ev.eval_range(expr, ts)?;
            if range.matrix.is_empty() {
                vec![absent_sample(expr, ts)]
            } else {
                Vec::new()
            }
        }

        "absent" => {
            let expr = arg(name, &args, 0)?;
            if ev.eval_vector(expr, ts)?.is_empty() {
                vec![absent_sample(expr, ts)]
            } else {
                Vec::new()
            }
        }
        "timestamp" => {
            let expr = strip_parens(arg(name, &args, 0)?);
            if let Expr::VectorSelector(vs) = expr {
                ev.select_instant(vs, ts)?
                    .into_iter()
                    .map(|(metric, point)| Sample {
                        metric: metric.without_name(),
                        t: ts,
                        v: point.t as f64 / 1000.0,
                    })
                    .collect()
            } else {
                ev.eval_vector(expr, ts)?
                    .into_iter()
                    .map(|s| Sample {
                        metric: s.metric.without_name(),
                        t: ts,
                        v: s.t as f64 / 1000.0,
                    })
                    .collect()
            }
        }

        "abs" => map_values(ev, name, &args, ts, f64::abs)?,
        "ceil" => map_values(ev, name, &args, ts, f64::ceil)?,
        "floor" => map_values(ev, name, &args, ts, f64::floor)?,
        "exp" => map_values(ev, name, &args, ts, f64::exp)?,
        "ln" => map_values(ev, name, &args, ts, f64::ln)?,
        "log2" => map_values(ev, name, &args, ts, f64::log2)?,
        "log10" => map_values(ev, name, &args, ts, f64::log10)?,
        "sqrt" => map_values(ev, name, &args, ts, f64::sqrt)?,
        "sgn" => map_values(ev, name, &args, ts, |v| {
            if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                v
            }
        })?,
        "round" => {
            let to_nearest = match args.get(1) {
                Some(expr) => ev.eval_scalar(expr, ts)?,
                None => 1.0,
            };
            let inverse = 1.0 / to_nearest;
            map_values(ev, name, &args, ts, |v| (v * inverse + 0.5).floor() / inverse)?
        }
        "clamp" => {
            let min = ev.eval_scalar(arg(name, &args, 1)?, ts)?;
            let max = ev.eval_scalar(arg(name, &args, 2)?, ts)?;
            if max < min {
                Vec::new()
            } else {
                map_values(ev, name, &args, ts, |v| v.max(min).min(max))?
            }
        }
        "clamp_min" => {
            let min = ev.eval_scalar(arg(name, &args, 1)?, ts)?;
            map_values(ev, name, &args, ts, |v| v.max(min))?
        }
        "clamp_max" => {
            let max = ev.eval_scalar(arg(name, &args, 1)?, ts)?;
            map_values(ev, name, &args, ts, |v| v.min(max))?
        }

        "histogram_quantile" => {
            let q = ev.eval_scalar(arg(name, &args, 0)?, ts)?;
            let vector = ev.eval_vector(arg(name, &args, 1)?, ts)?;
            histogram_quantile(q, vector, ts)
        }
        "label_replace" => label_replace(ev, name, &args, ts)?,
        "label_join" => label_join(ev, name, &args, ts)?,
        "sort" | "sort_desc" => {
            let mut vector = ev.eval_vector(arg(name, &args, 0)?, ts)?;
            let descending = name == "sort_desc";
            vector.sort_by(|a, b| {
                // NaN always sorts last
                match (a.v.is_nan(), b.v.is_nan()) {
                    (true, true) => std::cmp::Ordering::Equal,
                    (true, false) => std::cmp::Ordering::Greater,
                    (false, true) => std::cmp::Ordering::Less,
                    (false, false) if descending => b.v.total_cmp(&a.v),
                    (false, false) => a.v.total_cmp(&b.v),
                }
            });
            vector
        }

        "minute" | "hour" | "day_of_week" | "day_of_month" | "day_of_year" | "days_in_month"
        | "month" | "year" => {
            let input = match args.first() {
                Some(expr) => ev.eval_vector(expr, ts)?,
                None => vec![Sample {
                    metric: Labels::new(),
                    t: ts,
                    v: ts as f64 / 1000.0,
                }],
            };
            input
                .into_iter()
                .filter_map(|s| {
                    let time = DateTime::<Utc>::from_timestamp(s.v as i64, 0)?;
                    Some(Sample {
                        metric: s.metric.without_name(),
                        t: ts,
                        v: date_part(name, &time)?,
                    })
                })
                .collect()
        }

        other => {
            return Err(PromQLError::Unsupported(format!(
                "function {other}() is not supported"
            )));
        }
    };

    ensure_unique_labels(name, &vector)?;
    Ok(Value::Vector(vector))
}

fn arg<'e>(name: &str, args: &[&'e Expr], i: usize) -> Result<&'e Expr, PromQLError> {
    args.get(i)
        .copied()
        .ok_or_else(|| PromQLError::function(name, format!("missing argument {}", i + 1)))
}

fn strip_parens(expr: &Expr) -> &Expr {
    match expr {
        Expr::Paren(paren) => strip_parens(&paren.expr),
        other => other,
    }
}

/// Apply a per-series function to the range vector in the first argument
fn over_range<F>(
    ev: &mut Evaluator<'_>,
    name: &str,
    args: &[&Expr],
    ts: i64,
    keep_name: bool,
    f: F,
) -> Result<Vector, PromQLError>
where
    F: Fn(&[Point], &RangeArg) -> Option<f64>,
{
    let range = ev.eval_range(arg(name, args, 0)?, ts)?;
    let mut vector = Vec::with_capacity(range.matrix.len());
    for series in &range.matrix {
        if let Some(v) = f(&series.points, &range) {
            vector.push(Sample {
                metric: if keep_name {
                    series.metric.clone()
                } else {
                    series.metric.without_name()
                },
                t: ts,
                v,
            });
        }
    }
    Ok(vector)
}

fn map_values<F>(
    ev: &mut Evaluator<'_>,
    name: &str,
    args: &[&Expr],
    ts: i64,
    f: F,
) -> Result<Vector, PromQLError>
where
    F: Fn(f64) -> f64,
{
    Ok(ev
        .eval_vector(arg(name, args, 0)?, ts)?
        .into_iter()
        .map(|s| Sample {
            metric: s.metric.without_name(),
            t: ts,
            v: f(s.v),
        })
        .collect())
}

fn ensure_unique_labels(name: &str, vector: &Vector) -> Result<(), PromQLError> {
    let mut seen = std::collections::HashSet::with_capacity(vector.len());
    for sample in vector {
        if !seen.insert(&sample.metric) {
            return Err(PromQLError::function(
                name,
                format!(
                    "vector cannot contain metrics with the same labelset {}",
                    sample.metric
                ),
            ));
        }
    }
    Ok(())
}

/// Rate/increase/delta with extrapolation to the window edges
pub(crate) fn extrapolated_rate(
    points: &[Point],
    range_start: i64,
    range_end: i64,
    is_counter: bool,
    is_rate: bool,
) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let first = points[0];
    let last = points[points.len() - 1];

    let mut result = last.v - first.v;
    if is_counter {
        let mut prev = first.v;
        for p in &points[1..] {
            if p.v < prev {
                result += prev;
            }
            prev = p.v;
        }
    }

    let mut duration_to_start = (first.t - range_start) as f64 / 1000.0;
    let duration_to_end = (range_end - last.t) as f64 / 1000.0;
    let sampled_interval = (last.t - first.t) as f64 / 1000.0;
    let average_between_samples = sampled_interval / (points.len() - 1) as f64;

    if is_counter && result > 0.0 && first.v >= 0.0 {
        // Counters cannot go negative, so never extrapolate below zero
        let duration_to_zero = sampled_interval * (first.v / result);
        if duration_to_zero < duration_to_start {
            duration_to_start = duration_to_zero;
        }
    }

    let threshold = average_between_samples * 1.1;
    let mut extrapolate_to = sampled_interval;
    extrapolate_to += if duration_to_start < threshold {
        duration_to_start
    } else {
        average_between_samples / 2.0
    };
    extrapolate_to += if duration_to_end < threshold {
        duration_to_end
    } else {
        average_between_samples / 2.0
    };

    let mut factor = extrapolate_to / sampled_interval;
    if is_rate {
        factor /= (range_end - range_start) as f64 / 1000.0;
    }
    Some(result * factor)
}

/// irate/idelta from the last two samples
fn instant_value(points: &[Point], is_rate: bool) -> Option<f64> {
    let [.., prev, last] = points else {
        return None;
    };
    let mut result = if is_rate && last.v < prev.v {
        // counter reset
        last.v
    } else {
        last.v - prev.v
    };
    if is_rate {
        let interval = (last.t - prev.t) as f64 / 1000.0;
        if interval == 0.0 {
            return None;
        }
        result /= interval;
    }
    Some(result)
}

/// Least-squares slope (per second) and intercept at `intercept_time`
fn linear_regression(points: &[Point], intercept_time: i64) -> (f64, f64) {
    let n = points.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    let init_y = points[0].v;
    let mut const_y = true;
    for p in points {
        if p.v != init_y {
            const_y = false;
        }
        let x = (p.t - intercept_time) as f64 / 1000.0;
        sum_x += x;
        sum_y += p.v;
        sum_xy += x * p.v;
        sum_x2 += x * x;
    }
    if const_y && init_y.is_finite() {
        return (0.0, init_y);
    }
    let cov_xy = sum_xy - sum_x * sum_y / n;
    let var_x = sum_x2 - sum_x * sum_x / n;
    let slope = cov_xy / var_x;
    let intercept = sum_y / n - slope * sum_x / n;
    (slope, intercept)
}

/// Min or max where NaN only wins when every value is NaN
pub(crate) fn fold_extreme(values: impl Iterator<Item = f64>, replace: impl Fn(f64, f64) -> bool) -> f64 {
    values.fold(f64::NAN, |cur, v| {
        if cur.is_nan() || replace(cur, v) {
            v
        } else {
            cur
        }
    })
}

/// Population variance
pub(crate) fn variance(values: impl Iterator<Item = f64>) -> f64 {
    let (mut count, mut mean, mut m2) = (0.0, 0.0, 0.0);
    for v in values {
        count += 1.0;
        let delta = v - mean;
        mean += delta / count;
        m2 += delta * (v - mean);
    }
    if count == 0.0 { f64::NAN } else { m2 / count }
}

/// φ-quantile with linear interpolation between closest ranks
pub(crate) fn quantile(q: f64, mut values: Vec<f64>) -> f64 {
    if values.is_empty() || q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    values.sort_by(f64::total_cmp);
    let n = values.len();
    let rank = q * (n - 1) as f64;
    let lower = rank.floor().max(0.0) as usize;
    let upper = (lower + 1).min(n - 1);
    let weight = rank - rank.floor();
    values[lower] * (1.0 - weight) + values[upper] * weight
}

fn histogram_quantile(q: f64, vector: Vector, ts: i64) -> Vector {
    let mut groups: Vec<(Labels, Vec<(f64, f64)>)> = Vec::new();
    for sample in vector {
        let Some(upper) = sample.metric.get("le").and_then(parse_bucket_bound) else {
            continue;
        };
        let key = sample.metric.without_name().drop_names(&["le".to_string()]);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, buckets)) => buckets.push((upper, sample.v)),
            None => groups.push((key, vec![(upper, sample.v)])),
        }
    }

    groups
        .into_iter()
        .map(|(metric, buckets)| Sample {
            metric,
            t: ts,
            v: bucket_quantile(q, buckets),
        })
        .collect()
}

fn parse_bucket_bound(le: &str) -> Option<f64> {
    match le {
        "+Inf" | "Inf" | "inf" => Some(f64::INFINITY),
        other => other.parse().ok(),
    }
}

/// Quantile over cumulative histogram buckets `(upper bound, count)`
fn bucket_quantile(q: f64, mut buckets: Vec<(f64, f64)>) -> f64 {
    if q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
    if buckets.len() < 2 || buckets[buckets.len() - 1].0 != f64::INFINITY {
        return f64::NAN;
    }
    // Counts must be monotonic; smooth out precision errors
    let mut max = f64::NEG_INFINITY;
    for bucket in &mut buckets {
        if bucket.1 > max {
            max = bucket.1;
        } else {
            bucket.1 = max;
        }
    }

    let observations = buckets[buckets.len() - 1].1;
    if observations == 0.0 {
        return f64::NAN;
    }
    let mut rank = q * observations;
    let b = buckets
        .iter()
        .position(|(_, count)| *count >= rank)
        .unwrap_or(buckets.len() - 1);

    if b == buckets.len() - 1 {
        return buckets[buckets.len() - 2].0;
    }
    if b == 0 && buckets[0].0 <= 0.0 {
        return buckets[0].0;
    }

    let mut bucket_start = 0.0;
    let bucket_end = buckets[b].0;
    let mut count = buckets[b].1;
    if b > 0 {
        bucket_start = buckets[b - 1].0;
        count -= buckets[b - 1].1;
        rank -= buckets[b - 1].1;
    }
    bucket_start + (bucket_end - bucket_start) * (rank / count)
}

/// Sample returned by `absent()` when nothing matched: the equality
/// matchers of the selector become labels
fn absent_sample(expr: &Expr, ts: i64) -> Sample {
    let mut metric = Labels::new();
    let vs = match strip_parens(expr) {
        Expr::VectorSelector(vs) => Some(vs),
        Expr::MatrixSelector(ms) => Some(&ms.vs),
        _ => None,
    };
    if let Some(vs) = vs {
        let mut repeated = Vec::new();
        for m in &vs.matchers.matchers {
            if m.name == METRIC_NAME || !matches!(m.op, MatchOp::Equal) {
                continue;
            }
            if metric.contains(&m.name) {
                repeated.push(m.name.clone());
            }
            metric.insert(&m.name, &m.value);
        }
        for name in repeated {
            metric.remove(&name);
        }
    }
    Sample { metric, t: ts, v: 1.0 }
}

fn label_replace(
    ev: &mut Evaluator<'_>,
    name: &str,
    args: &[&Expr],
    ts: i64,
) -> Result<Vector, PromQLError> {
    let vector = ev.eval_vector(arg(name, args, 0)?, ts)?;
    let dst = ev.eval_string(arg(name, args, 1)?, ts)?;
    let replacement = ev.eval_string(arg(name, args, 2)?, ts)?;
    let src = ev.eval_string(arg(name, args, 3)?, ts)?;
    let pattern = ev.eval_string(arg(name, args, 4)?, ts)?;

    let regex = anchored_regex(&pattern)
        .map_err(|e| PromQLError::function(name, e.to_string()))?;
    if !is_valid_label_name(&dst) {
        return Err(PromQLError::function(name, format!("invalid destination label name {dst:?}")));
    }

    Ok(vector
        .into_iter()
        .map(|mut s| {
            let value = s.metric.value(&src).to_string();
            if let Some(captures) = regex.captures(&value) {
                let mut expanded = String::new();
                captures.expand(&replacement, &mut expanded);
                s.metric.insert(&dst, &expanded);
            }
            s
        })
        .collect())
}

fn label_join(
    ev: &mut Evaluator<'_>,
    name: &str,
    args: &[&Expr],
    ts: i64,
) -> Result<Vector, PromQLError> {
    let vector = ev.eval_vector(arg(name, args, 0)?, ts)?;
    let dst = ev.eval_string(arg(name, args, 1)?, ts)?;
    let separator = ev.eval_string(arg(name, args, 2)?, ts)?;
    let mut sources = Vec::new();
    for expr in args.iter().skip(3) {
        let src = ev.eval_string(expr, ts)?;
        if !is_valid_label_name(&src) {
            return Err(PromQLError::function(name, format!("invalid source label name {src:?}")));
        }
        sources.push(src);
    }
    if !is_valid_label_name(&dst) {
        return Err(PromQLError::function(name, format!("invalid destination label name {dst:?}")));
    }

    Ok(vector
        .into_iter()
        .map(|mut s| {
            let joined = sources
                .iter()
                .map(|src| s.metric.value(src))
                .collect::<Vec<_>>()
                .join(&separator);
            s.metric.insert(&dst, &joined);
            s
        })
        .collect())
}

fn date_part(name: &str, time: &DateTime<Utc>) -> Option<f64> {
    let v = match name {
        "minute" => time.minute(),
        "hour" => time.hour(),
        "day_of_week" => time.weekday().num_days_from_sunday(),
        "day_of_month" => time.day(),
        "day_of_year" => time.ordinal(),
        "month" => time.month(),
        "year" => return Some(f64::from(time.year())),
        "days_in_month" => {
            let first = time.date_naive().with_day(1)?;
            let next = first.checked_add_months(chrono::Months::new(1))?;
            next.signed_duration_since(first).num_days() as u32
        }
        _ => return None,
    };
    Some(f64::from(v))
}
