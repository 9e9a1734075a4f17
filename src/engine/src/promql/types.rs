//! PromQL value types and label matchers
//!
//! This module provides the types flowing through query evaluation:
//! instant vectors, range vectors (matrices), scalars and strings, plus the
//! label matchers used to select series from storage.

use std::fmt;

use promql_parser::label::{MatchOp, Matcher};
use promql_parser::parser::VectorSelector;
use regex::Regex;

use super::error::PromQLError;
use crate::labels::{Labels, METRIC_NAME};

/// A single timestamped value. Timestamps are milliseconds since epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub t: i64,
    pub v: f64,
}

impl Point {
    pub fn new(t: i64, v: f64) -> Self {
        Self { t, v }
    }
}

/// A single sample (metric + value at a point in time)
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Metric labels (including __name__)
    pub metric: Labels,
    /// Timestamp in milliseconds since epoch
    pub t: i64,
    /// The sample value
    pub v: f64,
}

/// A time series (metric + multiple values over time)
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    /// Metric labels (including __name__)
    pub metric: Labels,
    /// Points in ascending timestamp order
    pub points: Vec<Point>,
}

/// Result of an instant evaluation of a vector expression
pub type Vector = Vec<Sample>;

/// Result of a range evaluation
pub type Matrix = Vec<Series>;

/// The value produced by evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Vector(Vector),
    Matrix(Matrix),
    /// Scalar value and the timestamp it was evaluated at
    Scalar { t: i64, v: f64 },
    String { t: i64, v: String },
}

/// Type tag of a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Vector,
    Matrix,
    Scalar,
    String,
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Vector(_) => ValueType::Vector,
            Self::Matrix(_) => ValueType::Matrix,
            Self::Scalar { .. } => ValueType::Scalar,
            Self::String { .. } => ValueType::String,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vector => write!(f, "vector"),
            Self::Matrix => write!(f, "matrix"),
            Self::Scalar => write!(f, "scalar"),
            Self::String => write!(f, "string"),
        }
    }
}

/// Label matcher types matching Prometheus semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherOp {
    /// Exact string match (=)
    Equal,
    /// Not equal (!=)
    NotEqual,
    /// Regex match (=~)
    RegexMatch,
    /// Regex not match (!~)
    RegexNotMatch,
}

impl fmt::Display for MatcherOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
            Self::RegexMatch => write!(f, "=~"),
            Self::RegexNotMatch => write!(f, "!~"),
        }
    }
}

/// A single label matcher
///
/// Regex matchers are compiled once, fully anchored, when the matcher is
/// built.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    /// Label name
    pub name: String,
    /// Match operation
    pub op: MatcherOp,
    /// Value to match against
    pub value: String,
    regex: Option<Regex>,
}

impl LabelMatcher {
    pub fn new(op: MatcherOp, name: &str, value: &str) -> Result<Self, PromQLError> {
        let regex = match op {
            MatcherOp::RegexMatch | MatcherOp::RegexNotMatch => Some(anchored_regex(value)?),
            MatcherOp::Equal | MatcherOp::NotEqual => None,
        };
        Ok(Self {
            name: name.to_string(),
            op,
            value: value.to_string(),
            regex,
        })
    }

    /// Create a new equality matcher
    pub fn equal(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            op: MatcherOp::Equal,
            value: value.to_string(),
            regex: None,
        }
    }

    /// Create a new not-equal matcher
    pub fn not_equal(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            op: MatcherOp::NotEqual,
            value: value.to_string(),
            regex: None,
        }
    }

    /// Create a new regex matcher
    pub fn regex_match(name: &str, pattern: &str) -> Result<Self, PromQLError> {
        Self::new(MatcherOp::RegexMatch, name, pattern)
    }

    /// Create a new regex not-match matcher
    pub fn regex_not_match(name: &str, pattern: &str) -> Result<Self, PromQLError> {
        Self::new(MatcherOp::RegexNotMatch, name, pattern)
    }

    /// Whether a label value satisfies this matcher. Missing labels are
    /// matched as the empty string.
    pub fn matches(&self, value: &str) -> bool {
        match self.op {
            MatcherOp::Equal => value == self.value,
            MatcherOp::NotEqual => value != self.value,
            MatcherOp::RegexMatch => self.regex.as_ref().is_some_and(|re| re.is_match(value)),
            MatcherOp::RegexNotMatch => !self.regex.as_ref().is_some_and(|re| re.is_match(value)),
        }
    }

    /// Whether a label set satisfies this matcher
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.value(&self.name))
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

impl TryFrom<&Matcher> for LabelMatcher {
    type Error = PromQLError;

    fn try_from(matcher: &Matcher) -> Result<Self, Self::Error> {
        let op = match &matcher.op {
            MatchOp::Equal => MatcherOp::Equal,
            MatchOp::NotEqual => MatcherOp::NotEqual,
            MatchOp::Re(_) => MatcherOp::RegexMatch,
            MatchOp::NotRe(_) => MatcherOp::RegexNotMatch,
        };
        Self::new(op, &matcher.name, &matcher.value)
    }
}

/// Matcher sets of a selector, one per `or` alternative. A series is
/// selected when it satisfies every matcher of at least one set.
pub fn selector_matcher_sets(vs: &VectorSelector) -> Result<Vec<Vec<LabelMatcher>>, PromQLError> {
    let mut common = Vec::with_capacity(vs.matchers.matchers.len() + 1);
    if let Some(name) = vs.name.as_deref() {
        common.push(LabelMatcher::equal(METRIC_NAME, name));
    }
    for matcher in &vs.matchers.matchers {
        common.push(LabelMatcher::try_from(matcher)?);
    }
    if vs.matchers.or_matchers.is_empty() {
        return Ok(vec![common]);
    }

    vs.matchers
        .or_matchers
        .iter()
        .map(|alternative| {
            let mut set = common.clone();
            for matcher in alternative {
                set.push(LabelMatcher::try_from(matcher)?);
            }
            Ok(set)
        })
        .collect()
}

/// Compile a regex anchored at both ends, the way PromQL applies them
pub fn anchored_regex(pattern: &str) -> Result<Regex, PromQLError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| PromQLError::InvalidMatcher(format!("invalid regex {pattern:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_matcher_display() {
        assert_eq!(format!("{}", MatcherOp::Equal), "=");
        assert_eq!(format!("{}", MatcherOp::NotEqual), "!=");
        assert_eq!(format!("{}", MatcherOp::RegexMatch), "=~");
        assert_eq!(format!("{}", MatcherOp::RegexNotMatch), "!~");
        assert_eq!(LabelMatcher::equal("job", "api").to_string(), r#"job="api""#);
    }

    #[test]
    fn test_regex_matchers_are_anchored() {
        let m = LabelMatcher::regex_match("verb", "GET|LIST").unwrap();
        assert!(m.matches("GET"));
        assert!(m.matches("LIST"));
        assert!(!m.matches("WATCHLIST"));

        let m = LabelMatcher::regex_not_match("subresource", "log|exec").unwrap();
        assert!(m.matches(""));
        assert!(!m.matches("exec"));
    }

    #[test]
    fn test_missing_label_matches_empty() {
        let labels = Labels::with_name("up");
        assert!(LabelMatcher::equal("job", "").matches_labels(&labels));
        assert!(LabelMatcher::not_equal("job", "api").matches_labels(&labels));
        assert!(!LabelMatcher::equal("job", "api").matches_labels(&labels));
    }

    #[test]
    fn test_or_matchers_become_separate_sets() {
        let expr = promql_parser::parser::parse(r#"up{job="a" or job="b"}"#).unwrap();
        let promql_parser::parser::Expr::VectorSelector(vs) = expr else {
            panic!("expected a vector selector");
        };
        let sets = selector_matcher_sets(&vs).unwrap();
        assert_eq!(sets.len(), 2);
        let b = Labels::from_iter([("__name__", "up"), ("job", "b")]);
        let c = Labels::from_iter([("__name__", "up"), ("job", "c")]);
        assert!(sets.iter().any(|set| set.iter().all(|m| m.matches_labels(&b))));
        assert!(!sets.iter().any(|set| set.iter().all(|m| m.matches_labels(&c))));
    }

    #[test]
    fn test_invalid_regex() {
        let result = LabelMatcher::regex_match("job", "(");
        assert!(matches!(result, Err(PromQLError::InvalidMatcher(_))));
    }

    #[test]
    fn test_value_type_names() {
        assert_eq!(Value::Scalar { t: 0, v: 1.0 }.value_type().to_string(), "scalar");
        assert_eq!(Value::Vector(vec![]).value_type(), ValueType::Vector);
    }
}
