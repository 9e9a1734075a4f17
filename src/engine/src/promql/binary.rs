//! Binary operators and vector matching

use std::collections::{HashMap, HashSet};

use promql_parser::parser::{BinModifier, BinaryExpr, LabelModifier, VectorMatchCardinality};

use super::error::PromQLError;
use super::eval::Evaluator;
use super::types::{Sample, Value, Vector};
use crate::labels::Labels;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Atan2,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Unless,
}

impl BinOp {
    fn parse(op: &str) -> Result<Self, PromQLError> {
        Ok(match op {
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "/" => Self::Div,
            "%" => Self::Mod,
            "^" => Self::Pow,
            "atan2" => Self::Atan2,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            ">" => Self::Gt,
            "<" => Self::Lt,
            ">=" => Self::Ge,
            "<=" => Self::Le,
            "and" => Self::And,
            "or" => Self::Or,
            "unless" => Self::Unless,
            other => {
                return Err(PromQLError::Unsupported(format!(
                    "binary operator {other} is not supported"
                )));
            }
        })
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Gt | Self::Lt | Self::Ge | Self::Le
        )
    }

    fn is_set(self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Unless)
    }

    /// Apply the operator to two values. Comparisons return the left value
    /// and whether the comparison held.
    fn apply(self, lhs: f64, rhs: f64) -> (f64, bool) {
        match self {
            Self::Add => (lhs + rhs, true),
            Self::Sub => (lhs - rhs, true),
            Self::Mul => (lhs * rhs, true),
            Self::Div => (lhs / rhs, true),
            Self::Mod => (lhs % rhs, true),
            Self::Pow => (lhs.powf(rhs), true),
            Self::Atan2 => (lhs.atan2(rhs), true),
            Self::Eq => (lhs, lhs == rhs),
            Self::Ne => (lhs, lhs != rhs),
            Self::Gt => (lhs, lhs > rhs),
            Self::Lt => (lhs, lhs < rhs),
            Self::Ge => (lhs, lhs >= rhs),
            Self::Le => (lhs, lhs <= rhs),
            Self::And | Self::Or | Self::Unless => (f64::NAN, false),
        }
    }
}

pub(super) fn eval_binary(
    ev: &mut Evaluator<'_>,
    bin: &BinaryExpr,
    ts: i64,
) -> Result<Value, PromQLError> {
    let op = BinOp::parse(&bin.op.to_string().to_lowercase())?;
    let return_bool = bin.modifier.as_ref().is_some_and(|m| m.return_bool);

    let lhs = ev.eval(&bin.lhs, ts)?;
    let rhs = ev.eval(&bin.rhs, ts)?;

    match (lhs, rhs) {
        (Value::Scalar { v: l, .. }, Value::Scalar { v: r, .. }) => {
            let (v, keep) = op.apply(l, r);
            let v = if op.is_comparison() {
                if keep { 1.0 } else { 0.0 }
            } else {
                v
            };
            Ok(Value::Scalar { t: ts, v })
        }
        (Value::Vector(vector), Value::Scalar { v: scalar, .. }) => Ok(Value::Vector(
            vector_scalar(op, vector, scalar, false, return_bool, ts),
        )),
        (Value::Scalar { v: scalar, .. }, Value::Vector(vector)) => Ok(Value::Vector(
            vector_scalar(op, vector, scalar, true, return_bool, ts),
        )),
        (Value::Vector(lhs), Value::Vector(rhs)) => {
            let modifier = bin.modifier.as_ref();
            let vector = match op {
                BinOp::And => and(lhs, rhs, modifier),
                BinOp::Or => or(lhs, rhs, modifier),
                BinOp::Unless => unless(lhs, rhs, modifier),
                _ => vector_vector(op, lhs, rhs, modifier, return_bool, ts)?,
            };
            Ok(Value::Vector(vector))
        }
        (lhs, rhs) => Err(PromQLError::Evaluation(format!(
            "binary expression must contain only scalar and instant vector types, got {} and {}",
            lhs.value_type(),
            rhs.value_type()
        ))),
    }
}

fn vector_scalar(
    op: BinOp,
    vector: Vector,
    scalar: f64,
    scalar_on_left: bool,
    return_bool: bool,
    ts: i64,
) -> Vector {
    let drop_name = !op.is_comparison() || return_bool;
    vector
        .into_iter()
        .filter_map(|s| {
            let (l, r) = if scalar_on_left { (scalar, s.v) } else { (s.v, scalar) };
            let (mut v, keep) = op.apply(l, r);
            if op.is_comparison() {
                // Filtering keeps the vector element's value
                v = s.v;
            }
            if return_bool {
                v = if keep { 1.0 } else { 0.0 };
            } else if !keep {
                return None;
            }
            Some(Sample {
                metric: if drop_name {
                    s.metric.without_name()
                } else {
                    s.metric
                },
                t: ts,
                v,
            })
        })
        .collect()
}

/// Labels used to match samples across the two sides
fn signature(metric: &Labels, modifier: Option<&BinModifier>) -> Labels {
    match modifier.and_then(|m| m.matching.as_ref()) {
        Some(LabelModifier::Include(on)) => metric.keep_only(&on.labels),
        Some(LabelModifier::Exclude(ignoring)) => {
            metric.without_name().drop_names(&ignoring.labels)
        }
        None => metric.without_name(),
    }
}

fn signatures(vector: &Vector, modifier: Option<&BinModifier>) -> HashSet<Labels> {
    vector.iter().map(|s| signature(&s.metric, modifier)).collect()
}

fn and(lhs: Vector, rhs: Vector, modifier: Option<&BinModifier>) -> Vector {
    let right = signatures(&rhs, modifier);
    lhs.into_iter()
        .filter(|s| right.contains(&signature(&s.metric, modifier)))
        .collect()
}

fn or(lhs: Vector, rhs: Vector, modifier: Option<&BinModifier>) -> Vector {
    let left = signatures(&lhs, modifier);
    let mut out = lhs;
    out.extend(
        rhs.into_iter()
            .filter(|s| !left.contains(&signature(&s.metric, modifier))),
    );
    out
}

fn unless(lhs: Vector, rhs: Vector, modifier: Option<&BinModifier>) -> Vector {
    let right = signatures(&rhs, modifier);
    lhs.into_iter()
        .filter(|s| !right.contains(&signature(&s.metric, modifier)))
        .collect()
}

fn vector_vector(
    op: BinOp,
    lhs: Vector,
    rhs: Vector,
    modifier: Option<&BinModifier>,
    return_bool: bool,
    ts: i64,
) -> Result<Vector, PromQLError> {
    debug_assert!(!op.is_set());
    let (include, one_to_many, one_to_one) = match modifier.map(|m| &m.card) {
        Some(VectorMatchCardinality::ManyToOne(labels)) => (labels.labels.as_slice(), false, false),
        Some(VectorMatchCardinality::OneToMany(labels)) => (labels.labels.as_slice(), true, false),
        Some(VectorMatchCardinality::OneToOne) | None => (&[][..], false, true),
        Some(VectorMatchCardinality::ManyToMany) => {
            return Err(PromQLError::Evaluation(
                "many-to-many matching is only allowed for set operators".to_string(),
            ));
        }
    };

    // The "many" side is always iterated; for group_right that is the right
    let (many, one) = if one_to_many { (rhs, lhs) } else { (lhs, rhs) };

    let mut one_side: HashMap<Labels, Sample> = HashMap::with_capacity(one.len());
    for sample in one {
        let sig = signature(&sample.metric, modifier);
        if one_side.contains_key(&sig) {
            return Err(PromQLError::Evaluation(format!(
                "found duplicate series for the match group {sig} on the {} hand-side of the operation; many-to-many matching not allowed: matching labels must be unique on one side",
                if one_to_many { "left" } else { "right" }
            )));
        }
        one_side.insert(sig, sample);
    }

    let drop_name = !op.is_comparison() || return_bool;
    let mut matched: HashSet<Labels> = HashSet::new();
    let mut seen_metrics: HashSet<Labels> = HashSet::new();
    let mut out = Vec::new();

    for sample in many {
        let sig = signature(&sample.metric, modifier);
        let Some(other) = one_side.get(&sig) else {
            continue;
        };

        let (l, r) = if one_to_many {
            (other.v, sample.v)
        } else {
            (sample.v, other.v)
        };
        let (value, keep) = op.apply(l, r);
        let value = if return_bool {
            if keep { 1.0 } else { 0.0 }
        } else if !keep {
            continue;
        } else {
            value
        };

        let metric = result_metric(&sample.metric, &other.metric, modifier, include, drop_name);

        if one_to_one {
            if !matched.insert(sig.clone()) {
                return Err(PromQLError::Evaluation(format!(
                    "multiple matches for labels {sig}: many-to-one matching must be explicit (group_left/group_right)"
                )));
            }
        } else if !seen_metrics.insert(metric.clone()) {
            return Err(PromQLError::Evaluation(format!(
                "multiple matches for labels {metric}: grouping labels must ensure unique matches"
            )));
        }

        out.push(Sample {
            metric,
            t: ts,
            v: value,
        });
    }
    Ok(out)
}

/// Labels of an output sample built from the "many" side sample and its
/// match on the "one" side
fn result_metric(
    many: &Labels,
    one: &Labels,
    modifier: Option<&BinModifier>,
    include: &[String],
    drop_name: bool,
) -> Labels {
    let mut metric = if drop_name {
        many.without_name()
    } else {
        many.clone()
    };

    let grouped = modifier.is_some_and(|m| {
        matches!(
            m.card,
            VectorMatchCardinality::ManyToOne(_) | VectorMatchCardinality::OneToMany(_)
        )
    });
    if !grouped {
        match modifier.and_then(|m| m.matching.as_ref()) {
            Some(LabelModifier::Include(on)) => metric = metric.keep_only(&on.labels),
            Some(LabelModifier::Exclude(ignoring)) => {
                metric = metric.drop_names(&ignoring.labels)
            }
            None => {}
        }
    }

    for name in include {
        metric.insert(name, one.value(name));
    }
    metric
}
