use thiserror::Error;

use crate::storage::StorageError;

/// Why a query could not be parsed or evaluated
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PromQLError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid label matcher: {0}")]
    InvalidMatcher(String),

    #[error("{name}(): {reason}")]
    Function { name: String, reason: String },

    #[error("query processing would load too many samples into memory (limit {limit})")]
    TooManySamples { limit: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PromQLError {
    pub(crate) fn function(name: &str, reason: impl Into<String>) -> Self {
        Self::Function {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
