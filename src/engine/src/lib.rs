//! In-memory PromQL engine
//!
//! Stores synthetic series, evaluates instant PromQL queries against them and
//! runs recording and alerting rules. [`Engine`] bundles the pieces that
//! share one storage instance.

pub mod duration;
pub mod labels;
pub mod load;
pub mod promql;
pub mod rules;
pub mod storage;

use std::sync::Arc;

use tracing::debug;

pub use promql::{EngineOptions, InstantQuery, QueryEngine};

use load::{parse_load_commands, LoadError, LoadStats};
use rules::{engine_query_func, Manager, ManagerOptions, QueryFunc};
use storage::{Appendable, MemoryStorage, Queryable, StorageStats};

/// Storage plus a query engine reading from it
///
/// Storage is released by [`Engine::close`] or when the engine is dropped.
#[derive(Debug)]
pub struct Engine {
    storage: Arc<MemoryStorage>,
    query_engine: QueryEngine,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            query_engine: QueryEngine::new(options),
        }
    }

    /// Parse `load` blocks and write their samples
    pub fn load(&self, text: &str) -> Result<LoadStats, LoadError> {
        let mut total = LoadStats::default();
        for command in parse_load_commands(text)? {
            let stats = command.append(self.storage.as_ref())?;
            total.series += stats.series;
            total.samples += stats.samples;
        }
        Ok(total)
    }

    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    pub fn queryable(&self) -> Arc<dyn Queryable> {
        self.storage.clone()
    }

    pub fn appendable(&self) -> Arc<dyn Appendable> {
        self.storage.clone()
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.query_engine
    }

    /// Rule query function reading from this engine's storage
    pub fn query_func(&self) -> QueryFunc {
        engine_query_func(self.query_engine.clone(), self.queryable())
    }

    /// Rule manager that reads from and writes to this engine's storage
    pub fn rule_manager(&self) -> Manager {
        Manager::new(ManagerOptions {
            query_func: self.query_func(),
            appendable: self.appendable(),
        })
    }

    /// Release every stored series. Later reads and writes fail.
    pub fn close(&self) -> StorageStats {
        self.storage.close()
    }

    pub fn is_closed(&self) -> bool {
        self.storage.is_closed()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.storage.is_closed() {
            debug!("Engine dropped without close");
            self.storage.close();
        }
    }
}
