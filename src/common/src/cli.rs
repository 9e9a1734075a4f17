use clap::Parser;
use std::path::PathBuf;

/// Common CLI arguments shared across all subcommands
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Log level picked by the verbosity flags
    pub fn log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments. `RUST_LOG` takes
    /// precedence when set. Logs go to stderr so command output stays
    /// machine readable.
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(args)));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Render configuration in human-readable or JSON format
    pub fn render_config(config: &Configuration, json: bool) -> Result<String> {
        if json {
            return serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON");
        }
        let harness = &config.harness;
        let horizon = if harness.horizon_from_fixture {
            "derived from fixture".to_string()
        } else {
            format!("{:?}", harness.horizon)
        };
        Ok(format!(
            "promharness configuration:\n\
             ==========================\n\
             Lookback delta: {:?}\n\
             Max samples per query: {}\n\
             Default subquery step: {:?}\n\
             Horizon: {horizon}",
            config.engine.lookback_delta,
            config.engine.max_samples,
            config.engine.default_subquery_step,
        ))
    }

    /// Print configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        println!("{}", render_config(config, json)?);
        Ok(())
    }
}
