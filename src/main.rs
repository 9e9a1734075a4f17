use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use common::cli::{CommonArgs, utils};
use common::config::Configuration;
use harness::evaluator::simulated_time;
use harness::{Harness, HarnessOptions, Horizon};

#[derive(Parser)]
#[command(name = "promharness")]
#[command(about = "Replay PromQL recording and alerting rules over synthetic series")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay the rules and run instant queries
    Query {
        #[command(flatten)]
        input: InputArgs,

        /// Simulated time of the queries, as an offset from the epoch
        #[arg(long, value_parser = humantime::parse_duration)]
        at: Duration,

        /// PromQL queries; each prints one JSON array of samples
        #[arg(required = true)]
        queries: Vec<String>,
    },
    /// Build the harness and report what was loaded
    Check {
        #[command(flatten)]
        input: InputArgs,
    },
    /// Show the effective configuration
    Config {
        #[arg(long, help = "Output as JSON")]
        json: bool,
    },
}

#[derive(Args)]
struct InputArgs {
    #[arg(long, help = "Series fixture file")]
    series: PathBuf,

    #[arg(long, help = "Rule group file")]
    rules: PathBuf,

    #[arg(long, value_parser = humantime::parse_duration, help = "Last simulated evaluation time")]
    horizon: Option<Duration>,

    #[arg(long, conflicts_with = "horizon", help = "Replay up to the end of the fixture data")]
    horizon_from_fixture: bool,
}

impl InputArgs {
    fn build(&self, config: &Configuration) -> Result<Harness> {
        let mut options = HarnessOptions::from_config(config);
        if let Some(horizon) = self.horizon {
            options.horizon = Horizon::Fixed(horizon);
        }
        if self.horizon_from_fixture {
            options.horizon = Horizon::FromFixture;
        }
        Harness::with_options(&self.series, &self.rules, options).with_context(|| {
            format!(
                "Failed to build harness from {} and {}",
                self.series.display(),
                self.rules.display()
            )
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;
    tracing::debug!(?config, "Loaded configuration");

    match cli.command {
        Commands::Query { input, at, queries } => {
            let harness = input.build(&config)?;
            let at = simulated_time(at);
            for query in &queries {
                let samples = harness
                    .query(query, at)
                    .with_context(|| format!("Query {query:?} failed"))?;
                let json = serde_json::to_string_pretty(&samples)
                    .context("Failed to serialize query result")?;
                println!("{json}");
            }
            harness.close();
        }
        Commands::Check { input } => {
            let harness = input.build(&config)?;
            let groups = harness.groups();
            let stats = harness.storage_stats();
            println!(
                "OK: {} input series, {} rule groups, {} rules, {} evaluations up to {}",
                harness.fixture().series_specs().len(),
                groups.len(),
                groups.rule_count(),
                harness.replay_stats().ticks,
                humantime::format_duration(harness.horizon()),
            );
            println!(
                "Storage: {} series, {} samples",
                stats.series, stats.samples
            );
            harness.close();
        }
        Commands::Config { json } => {
            utils::display_config(&config, json)?;
        }
    }

    Ok(())
}
