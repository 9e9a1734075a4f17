use std::fmt::Display;
use std::path::PathBuf;

use engine::duration::DurationError;
use engine::load::LoadError;
use engine::promql::error::PromQLError;
use engine::promql::types::ValueType;
use engine::rules::{RuleError, RuleEvalError};
use thiserror::Error;

/// Errors raised while building or querying a [`crate::Harness`]
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to read fixture {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed fixture {}: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid fixture interval: {0}")]
    Duration(#[from] DurationError),

    #[error("engine rejected synthetic series: {0}")]
    Ingest(#[from] LoadError),

    #[error("failed to load rule groups:\n{}", bullet_list(.0))]
    RuleLoad(Vec<RuleError>),

    #[error("{} rule evaluation error(s) during replay:\n{}", .0.len(), bullet_list(.0))]
    Evaluation(Vec<RuleEvalError>),

    #[error("query failed: {0}")]
    Query(#[from] PromQLError),

    #[error("query result is not a vector (got {0})")]
    NotVector(ValueType),
}

fn bullet_list<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| format!("  - {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, HarnessError>;
