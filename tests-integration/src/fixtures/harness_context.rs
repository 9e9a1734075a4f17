//! Harness test context
//!
//! Writes a series fixture and a rule file into a temporary directory that
//! lives as long as the context.

use std::path::{Path, PathBuf};

use anyhow::Result;
use harness::{Harness, HarnessOptions, HarnessError};
use tempfile::TempDir;

/// Temporary fixture and rule files for one test
pub struct HarnessTestContext {
    series_path: PathBuf,
    rules_path: PathBuf,
    _dir: TempDir,
}

impl HarnessTestContext {
    /// Write `series` and `rules` YAML to fresh files
    pub fn new(series: &str, rules: &str) -> Result<Self> {
        let dir = TempDir::new()?;
        let series_path = dir.path().join("series.yml");
        let rules_path = dir.path().join("rules.yml");
        std::fs::write(&series_path, series)?;
        std::fs::write(&rules_path, rules)?;
        Ok(Self {
            series_path,
            rules_path,
            _dir: dir,
        })
    }

    pub fn series_path(&self) -> &Path {
        &self.series_path
    }

    pub fn rules_path(&self) -> &Path {
        &self.rules_path
    }

    /// Build a harness with default options
    pub fn build(&self) -> Result<Harness, HarnessError> {
        Harness::new(&self.series_path, &self.rules_path)
    }

    pub fn build_with(&self, options: HarnessOptions) -> Result<Harness, HarnessError> {
        Harness::with_options(&self.series_path, &self.rules_path, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_writes_files() {
        let ctx = HarnessTestContext::new("interval: 1m\ninput_series: []\n", "groups: []\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(ctx.series_path()).unwrap(),
            "interval: 1m\ninput_series: []\n"
        );
        assert!(ctx.rules_path().exists());
        assert!(ctx.build().is_ok());
    }
}
