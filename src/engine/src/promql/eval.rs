//! Recursive instant evaluation of a PromQL AST

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use promql_parser::parser::{AtModifier, Expr, Offset, SubqueryExpr, VectorSelector};

use super::error::PromQLError;
use super::types::{selector_matcher_sets, Matrix, Point, Sample, Series, Value, Vector};
use super::{aggregate, binary, functions, EngineOptions};
use crate::labels::Labels;
use crate::storage::{is_stale_nan, Queryable};

/// Evaluation state for a single query
pub(crate) struct Evaluator<'a> {
    queryable: &'a dyn Queryable,
    lookback_delta: i64,
    subquery_step: i64,
    max_samples: usize,
    samples: usize,
    /// Query start/end, the targets of `@ start()` and `@ end()`
    start: i64,
    end: i64,
}

/// A range-vector argument together with the window it covers
pub(crate) struct RangeArg {
    pub matrix: Matrix,
    /// Window length in milliseconds
    pub range: i64,
    /// Inclusive end of the window after offset and @ adjustments
    pub end: i64,
}

impl<'a> Evaluator<'a> {
    pub fn new(queryable: &'a dyn Queryable, options: &EngineOptions, ts: i64) -> Self {
        Self {
            queryable,
            lookback_delta: duration_ms(options.lookback_delta),
            subquery_step: duration_ms(options.default_subquery_step).max(1),
            max_samples: options.max_samples,
            samples: 0,
            start: ts,
            end: ts,
        }
    }

    pub fn eval(&mut self, expr: &Expr, ts: i64) -> Result<Value, PromQLError> {
        match expr {
            Expr::NumberLiteral(n) => Ok(Value::Scalar { t: ts, v: n.val }),
            Expr::StringLiteral(s) => Ok(Value::String {
                t: ts,
                v: s.val.clone(),
            }),
            Expr::Paren(paren) => self.eval(&paren.expr, ts),
            Expr::Unary(unary) => match self.eval(&unary.expr, ts)? {
                Value::Scalar { t, v } => Ok(Value::Scalar { t, v: -v }),
                Value::Vector(vector) => Ok(Value::Vector(
                    vector
                        .into_iter()
                        .map(|s| Sample {
                            metric: s.metric.without_name(),
                            t: s.t,
                            v: -s.v,
                        })
                        .collect(),
                )),
                other => Err(PromQLError::Evaluation(format!(
                    "unary minus is not defined for {}",
                    other.value_type()
                ))),
            },
            Expr::VectorSelector(vs) => {
                let vector = self
                    .select_instant(vs, ts)?
                    .into_iter()
                    .map(|(metric, point)| Sample {
                        metric,
                        t: ts,
                        v: point.v,
                    })
                    .collect();
                Ok(Value::Vector(vector))
            }
            Expr::MatrixSelector(ms) => {
                let range = duration_ms(ms.range);
                let end = self.adjusted_ts(ts, &ms.vs.offset, &ms.vs.at);
                Ok(Value::Matrix(self.select_range(&ms.vs, range, end)?))
            }
            Expr::Subquery(sq) => {
                let (matrix, _, _) = self.eval_subquery(sq, ts)?;
                Ok(Value::Matrix(matrix))
            }
            Expr::Call(call) => functions::eval_call(self, call, ts),
            Expr::Aggregate(agg) => aggregate::eval_aggregate(self, agg, ts),
            Expr::Binary(bin) => binary::eval_binary(self, bin, ts),
            Expr::Extension(_) => Err(PromQLError::Unsupported(
                "extension expressions are not supported".to_string(),
            )),
        }
    }

    pub fn eval_vector(&mut self, expr: &Expr, ts: i64) -> Result<Vector, PromQLError> {
        match self.eval(expr, ts)? {
            Value::Vector(v) => Ok(v),
            other => Err(PromQLError::Evaluation(format!(
                "expected instant vector, got {}",
                other.value_type()
            ))),
        }
    }

    pub fn eval_scalar(&mut self, expr: &Expr, ts: i64) -> Result<f64, PromQLError> {
        match self.eval(expr, ts)? {
            Value::Scalar { v, .. } => Ok(v),
            other => Err(PromQLError::Evaluation(format!(
                "expected scalar, got {}",
                other.value_type()
            ))),
        }
    }

    pub fn eval_string(&mut self, expr: &Expr, ts: i64) -> Result<String, PromQLError> {
        match self.eval(expr, ts)? {
            Value::String { v, .. } => Ok(v),
            other => Err(PromQLError::Evaluation(format!(
                "expected string, got {}",
                other.value_type()
            ))),
        }
    }

    /// Evaluate a range-vector expression (matrix selector or subquery)
    pub fn eval_range(&mut self, expr: &Expr, ts: i64) -> Result<RangeArg, PromQLError> {
        match expr {
            Expr::Paren(paren) => self.eval_range(&paren.expr, ts),
            Expr::MatrixSelector(ms) => {
                let range = duration_ms(ms.range);
                let end = self.adjusted_ts(ts, &ms.vs.offset, &ms.vs.at);
                let matrix = self.select_range(&ms.vs, range, end)?;
                Ok(RangeArg { matrix, range, end })
            }
            Expr::Subquery(sq) => {
                let (matrix, range, end) = self.eval_subquery(sq, ts)?;
                Ok(RangeArg { matrix, range, end })
            }
            _ => Err(PromQLError::Evaluation(
                "expected range vector argument".to_string(),
            )),
        }
    }

    /// The newest non-stale sample of every matching series within the
    /// lookback window, with its original timestamp
    pub fn select_instant(
        &mut self,
        vs: &VectorSelector,
        ts: i64,
    ) -> Result<Vec<(Labels, Point)>, PromQLError> {
        let ref_ts = self.adjusted_ts(ts, &vs.offset, &vs.at);
        let series = self.select_series(vs, ref_ts - self.lookback_delta + 1, ref_ts)?;

        let result: Vec<_> = series
            .into_iter()
            .filter_map(|s| {
                let last = *s.points.last()?;
                (!is_stale_nan(last.v)).then_some((s.metric, last))
            })
            .collect();
        self.count_samples(result.len())?;
        Ok(result)
    }

    /// Series matching any of the selector's matcher sets, in label order
    fn select_series(
        &self,
        vs: &VectorSelector,
        mint: i64,
        maxt: i64,
    ) -> Result<Vec<Series>, PromQLError> {
        let mut sets = selector_matcher_sets(vs)?;
        if sets.len() == 1 {
            let matchers = sets.pop().unwrap_or_default();
            return Ok(self.queryable.select(&matchers, mint, maxt)?);
        }

        let mut union = BTreeMap::new();
        for matchers in &sets {
            for s in self.queryable.select(matchers, mint, maxt)? {
                union.entry(s.metric.clone()).or_insert(s);
            }
        }
        Ok(union.into_values().collect())
    }

    /// Every non-stale sample in `(end - range, end]`
    fn select_range(
        &mut self,
        vs: &VectorSelector,
        range: i64,
        end: i64,
    ) -> Result<Matrix, PromQLError> {
        let series = self.select_series(vs, end - range + 1, end)?;

        let mut matrix = Vec::with_capacity(series.len());
        let mut loaded = 0;
        for mut s in series {
            s.points.retain(|p| !is_stale_nan(p.v));
            if s.points.is_empty() {
                continue;
            }
            loaded += s.points.len();
            matrix.push(s);
        }
        self.count_samples(loaded)?;
        Ok(matrix)
    }

    /// Evaluate the inner expression at every step inside the subquery
    /// window. Steps are aligned to absolute multiples of the step size.
    fn eval_subquery(
        &mut self,
        sq: &SubqueryExpr,
        ts: i64,
    ) -> Result<(Matrix, i64, i64), PromQLError> {
        let end = self.adjusted_ts(ts, &sq.offset, &sq.at);
        let range = duration_ms(sq.range);
        let step = sq.step.map(duration_ms).unwrap_or(self.subquery_step).max(1);

        let mint = end - range;
        let mut t = mint - mint.rem_euclid(step);
        if t <= mint {
            t += step;
        }

        let mut matrix: Matrix = Vec::new();
        let mut index: HashMap<Labels, usize> = HashMap::new();
        let mut push = |metric: Labels, point: Point, matrix: &mut Matrix| {
            let i = *index.entry(metric.clone()).or_insert_with(|| {
                matrix.push(Series {
                    metric,
                    points: Vec::new(),
                });
                matrix.len() - 1
            });
            matrix[i].points.push(point);
        };

        while t <= end {
            match self.eval(&sq.expr, t)? {
                Value::Vector(vector) => {
                    for s in vector {
                        push(s.metric, Point::new(t, s.v), &mut matrix);
                    }
                }
                Value::Scalar { v, .. } => push(Labels::new(), Point::new(t, v), &mut matrix),
                other => {
                    return Err(PromQLError::Evaluation(format!(
                        "subquery expression must return vector or scalar, got {}",
                        other.value_type()
                    )));
                }
            }
            t += step;
        }
        Ok((matrix, range, end))
    }

    /// Apply `@` and `offset` modifiers to an evaluation timestamp
    fn adjusted_ts(
        &self,
        ts: i64,
        offset: &Option<Offset>,
        at: &Option<AtModifier>,
    ) -> i64 {
        let base = match at {
            None => ts,
            Some(AtModifier::Start) => self.start,
            Some(AtModifier::End) => self.end,
            Some(AtModifier::At(time)) => system_time_ms(*time),
        };
        match offset {
            None => base,
            Some(Offset::Pos(d)) => base - duration_ms(*d),
            Some(Offset::Neg(d)) => base + duration_ms(*d),
        }
    }

    fn count_samples(&mut self, n: usize) -> Result<(), PromQLError> {
        self.samples += n;
        if self.samples > self.max_samples {
            return Err(PromQLError::TooManySamples {
                limit: self.max_samples,
            });
        }
        Ok(())
    }
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn system_time_ms(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => duration_ms(d),
        Err(e) => -duration_ms(e.duration()),
    }
}
