//! Instant queries against a replayed engine

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use engine::promql::types::{Sample as EngineSample, Value};
use engine::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::evaluator::timestamp_to_datetime;

/// One element of a query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl From<EngineSample> for Sample {
    fn from(sample: EngineSample) -> Self {
        Self {
            metric: sample.metric.into_map(),
            timestamp: timestamp_to_datetime(sample.t),
            value: sample.v,
        }
    }
}

/// Run `query` at `at`. Only vector results are accepted.
pub(crate) fn instant_query(engine: &Engine, query: &str, at: DateTime<Utc>) -> Result<Vec<Sample>> {
    let ts = at.timestamp_millis();
    let value = engine
        .query_engine()
        .new_instant_query(engine.queryable(), query, ts)?
        .exec()?;
    match value {
        Value::Vector(vector) => {
            debug!(query, ts, samples = vector.len(), "Executed query");
            Ok(vector.into_iter().map(Sample::from).collect())
        }
        other => Err(HarnessError::NotVector(other.value_type())),
    }
}
