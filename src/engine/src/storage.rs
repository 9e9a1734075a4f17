//! In-memory series storage
//!
//! Series are kept in label order so selections are deterministic. Reads go
//! through [`Queryable`], writes through an [`Appender`] obtained from
//! [`Appendable`]; an appender validates samples as they are added and makes
//! them visible atomically on commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::labels::Labels;
use crate::promql::types::{LabelMatcher, Point, Series};

/// Bit pattern Prometheus uses to mark a series as stale
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// The stale marker value
pub fn stale_nan() -> f64 {
    f64::from_bits(STALE_NAN_BITS)
}

/// Whether a value is the stale marker (and not an ordinary NaN)
pub fn is_stale_nan(v: f64) -> bool {
    v.to_bits() == STALE_NAN_BITS
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("out of order sample for {labels} at {t}")]
    OutOfOrder { labels: String, t: i64 },
    #[error("duplicate sample for timestamp {t} with different value for {labels}")]
    DuplicateSample { labels: String, t: i64 },
    #[error("storage is closed")]
    Closed,
}

/// Read access to series data
pub trait Queryable: Send + Sync {
    /// Series matching every matcher, restricted to points in `[mint, maxt]`.
    /// Series without points in the window are omitted.
    fn select(
        &self,
        matchers: &[LabelMatcher],
        mint: i64,
        maxt: i64,
    ) -> Result<Vec<Series>, StorageError>;
}

/// Write access to series data
pub trait Appendable: Send + Sync {
    fn appender(&self) -> Box<dyn Appender + '_>;
}

/// A batch of pending writes
pub trait Appender {
    fn append(&mut self, labels: &Labels, t: i64, v: f64) -> Result<(), StorageError>;

    /// Make every appended sample visible
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard every appended sample
    fn rollback(self: Box<Self>);
}

/// Size of the stored data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub series: usize,
    pub samples: usize,
}

/// Series storage held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    series: RwLock<BTreeMap<Labels, Vec<Point>>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StorageStats {
        let series = self.series.read();
        StorageStats {
            series: series.len(),
            samples: series.values().map(Vec::len).sum(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop every stored series. Later reads and writes fail with
    /// [`StorageError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> StorageStats {
        if self.closed.swap(true, Ordering::AcqRel) {
            return StorageStats::default();
        }
        let stats = self.stats();
        self.series.write().clear();
        debug!(
            series = stats.series,
            samples = stats.samples,
            "Released in-memory series storage"
        );
        stats
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Last stored timestamp and value for a series
    fn last_point(&self, labels: &Labels) -> Option<Point> {
        self.series
            .read()
            .get(labels)
            .and_then(|points| points.last().copied())
    }
}

impl Queryable for MemoryStorage {
    fn select(
        &self,
        matchers: &[LabelMatcher],
        mint: i64,
        maxt: i64,
    ) -> Result<Vec<Series>, StorageError> {
        self.check_open()?;
        let series = self.series.read();
        let mut result = Vec::new();
        for (labels, points) in series.iter() {
            if !matchers.iter().all(|m| m.matches_labels(labels)) {
                continue;
            }
            let start = points.partition_point(|p| p.t < mint);
            let end = points.partition_point(|p| p.t <= maxt);
            if start >= end {
                continue;
            }
            result.push(Series {
                metric: labels.clone(),
                points: points[start..end].to_vec(),
            });
        }
        Ok(result)
    }
}

impl Appendable for MemoryStorage {
    fn appender(&self) -> Box<dyn Appender + '_> {
        Box::new(MemoryAppender {
            storage: self,
            pending: BTreeMap::new(),
        })
    }
}

/// Appender buffering samples until commit
struct MemoryAppender<'a> {
    storage: &'a MemoryStorage,
    pending: BTreeMap<Labels, Vec<Point>>,
}

impl Appender for MemoryAppender<'_> {
    fn append(&mut self, labels: &Labels, t: i64, v: f64) -> Result<(), StorageError> {
        self.storage.check_open()?;
        let last = self
            .pending
            .get(labels)
            .and_then(|points| points.last().copied())
            .or_else(|| self.storage.last_point(labels));

        if let Some(last) = last {
            if t < last.t {
                return Err(StorageError::OutOfOrder {
                    labels: labels.to_string(),
                    t,
                });
            }
            if t == last.t {
                if last.v.to_bits() == v.to_bits() {
                    return Ok(());
                }
                return Err(StorageError::DuplicateSample {
                    labels: labels.to_string(),
                    t,
                });
            }
        }

        self.pending
            .entry(labels.clone())
            .or_default()
            .push(Point::new(t, v));
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.storage.check_open()?;
        let mut series = self.storage.series.write();
        for (labels, points) in self.pending {
            series.entry(labels).or_default().extend(points);
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(name: &str, job: &str) -> Labels {
        [("__name__", name), ("job", job)].into_iter().collect()
    }

    #[test]
    fn test_append_commit_select() {
        let storage = MemoryStorage::new();
        let mut app = storage.appender();
        app.append(&labels("up", "b"), 0, 1.0).unwrap();
        app.append(&labels("up", "a"), 0, 1.0).unwrap();
        app.append(&labels("up", "a"), 15_000, 0.0).unwrap();
        app.commit().unwrap();

        let result = storage
            .select(&[LabelMatcher::equal("__name__", "up")], 0, 60_000)
            .unwrap();
        assert_eq!(result.len(), 2);
        // label order
        assert_eq!(result[0].metric.get("job"), Some("a"));
        assert_eq!(result[0].points.len(), 2);

        let windowed = storage
            .select(&[LabelMatcher::equal("job", "a")], 1, 60_000)
            .unwrap();
        assert_eq!(windowed[0].points, vec![Point::new(15_000, 0.0)]);
    }

    #[test]
    fn test_uncommitted_samples_are_invisible() {
        let storage = MemoryStorage::new();
        let mut app = storage.appender();
        app.append(&labels("up", "a"), 0, 1.0).unwrap();
        app.rollback();
        assert_eq!(storage.stats().samples, 0);
    }

    #[test]
    fn test_out_of_order_and_duplicates() {
        let storage = MemoryStorage::new();
        let mut app = storage.appender();
        app.append(&labels("up", "a"), 10, 1.0).unwrap();
        app.commit().unwrap();

        let mut app = storage.appender();
        assert!(matches!(
            app.append(&labels("up", "a"), 5, 1.0),
            Err(StorageError::OutOfOrder { .. })
        ));
        assert!(matches!(
            app.append(&labels("up", "a"), 10, 2.0),
            Err(StorageError::DuplicateSample { .. })
        ));
        // identical re-append is ignored
        app.append(&labels("up", "a"), 10, 1.0).unwrap();
        app.commit().unwrap();
        assert_eq!(storage.stats().samples, 1);
    }

    #[test]
    fn test_close_releases_series() {
        let storage = MemoryStorage::new();
        let mut app = storage.appender();
        app.append(&labels("up", "a"), 0, 1.0).unwrap();
        app.commit().unwrap();

        let stats = storage.close();
        assert_eq!(stats, StorageStats { series: 1, samples: 1 });
        assert_eq!(storage.stats(), StorageStats::default());
        assert_eq!(storage.select(&[], 0, 10), Err(StorageError::Closed));
        assert_eq!(storage.close(), StorageStats::default());
    }

    #[test]
    fn test_stale_marker() {
        assert!(is_stale_nan(stale_nan()));
        assert!(!is_stale_nan(f64::NAN));
        assert!(!is_stale_nan(1.0));
    }
}
