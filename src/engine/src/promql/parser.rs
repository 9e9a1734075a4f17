//! Parsing on top of the promql-parser crate

use std::collections::BTreeSet;

use promql_parser::label::MatchOp;
use promql_parser::parser::{self, Expr, VectorSelector};

use super::error::PromQLError;
use crate::labels::METRIC_NAME;

/// Parse a PromQL query into its AST
///
/// ```
/// use engine::promql::parser::parse;
///
/// assert!(parse("sum by (job) (rate(http_requests_total[5m]))").is_ok());
/// assert!(parse("sum by (job").is_err());
/// ```
pub fn parse(query: &str) -> Result<Expr, PromQLError> {
    if query.trim().is_empty() {
        return Err(PromQLError::Parse("empty query".to_string()));
    }
    parser::parse(query).map_err(PromQLError::Parse)
}

/// Metric name a selector pins down, either written bare or as a
/// `__name__="..."` matcher
pub fn selector_metric_name(vs: &VectorSelector) -> Option<&str> {
    vs.name.as_deref().or_else(|| {
        vs.matchers
            .matchers
            .iter()
            .find(|m| m.name == METRIC_NAME && matches!(m.op, MatchOp::Equal))
            .map(|m| m.value.as_str())
    })
}

/// Every metric name selected anywhere in `expr`
pub fn referenced_metrics(expr: &Expr) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut pending = vec![expr];
    while let Some(expr) = pending.pop() {
        match expr {
            Expr::VectorSelector(vs) => names.extend(selector_metric_name(vs).map(str::to_string)),
            Expr::MatrixSelector(ms) => {
                names.extend(selector_metric_name(&ms.vs).map(str::to_string))
            }
            Expr::Call(call) => pending.extend(call.args.args.iter().map(|arg| arg.as_ref())),
            Expr::Aggregate(agg) => {
                pending.push(&agg.expr);
                pending.extend(agg.param.as_deref());
            }
            Expr::Binary(bin) => pending.extend([bin.lhs.as_ref(), bin.rhs.as_ref()]),
            Expr::Paren(paren) => pending.push(&paren.expr),
            Expr::Unary(unary) => pending.push(&unary.expr),
            Expr::Subquery(sq) => pending.push(&sq.expr),
            Expr::NumberLiteral(_) | Expr::StringLiteral(_) | Expr::Extension(_) => {}
        }
    }
    names
}
