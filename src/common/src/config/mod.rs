use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file, looked up in the working directory
pub const CONFIG_FILE: &str = "promharness.toml";

/// Prefix of environment variable overrides, e.g. `PROMHARNESS__HARNESS__HORIZON=2h`
pub const ENV_PREFIX: &str = "PROMHARNESS__";

/// Query engine tunables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How far back an instant selector looks for a sample
    #[serde(with = "humantime_serde")]
    pub lookback_delta: Duration,
    /// Upper bound on samples a single query may load
    pub max_samples: usize,
    /// Resolution of subqueries without an explicit step
    #[serde(with = "humantime_serde")]
    pub default_subquery_step: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookback_delta: Duration::from_secs(5 * 60),
            max_samples: 50_000_000,
            default_subquery_step: Duration::from_secs(60),
        }
    }
}

/// Rule replay settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Last simulated timestamp rules are evaluated at
    #[serde(with = "humantime_serde")]
    pub horizon: Duration,
    /// Derive the horizon from the longest fixture series instead
    pub horizon_from_fixture: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            horizon: Duration::from_secs(60 * 60),
            horizon_from_fixture: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Query engine configuration
    pub engine: EngineConfig,
    /// Rule replay configuration
    pub harness: HarnessConfig,
}

impl Configuration {
    /// Defaults, then `promharness.toml`, then `PROMHARNESS__*` variables
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(CONFIG_FILE))
            .extract()
            .map_err(Box::new)
    }

    /// Like [`Configuration::load`] but reading the given file
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file_exact(path))
            .extract()
            .map_err(Box::new)
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.engine.lookback_delta, Duration::from_secs(300));
        assert_eq!(config.engine.max_samples, 50_000_000);
        assert_eq!(config.harness.horizon, Duration::from_secs(3600));
        assert!(!config.harness.horizon_from_fixture);
    }

    #[test]
    fn test_configless_operation() {
        Jail::expect_with(|_jail| {
            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config, Configuration::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                [engine]
                lookback_delta = "2m"

                [harness]
                horizon = "90m"
                "#,
            )?;
            jail.set_env("PROMHARNESS__HARNESS__HORIZON", "2h");
            jail.set_env("PROMHARNESS__ENGINE__MAX_SAMPLES", "1000");

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.engine.lookback_delta, Duration::from_secs(120));
            assert_eq!(config.engine.max_samples, 1000);
            assert_eq!(config.harness.horizon, Duration::from_secs(2 * 3600));
            Ok(())
        });
    }

    #[test]
    fn test_load_from_path() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[harness]\nhorizon_from_fixture = true\n")?;
            let config = Configuration::load_from_path(Path::new("custom.toml")).map_err(|e| *e)?;
            assert!(config.harness.horizon_from_fixture);
            assert_eq!(config.harness.horizon, Duration::from_secs(3600));
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        Jail::expect_with(|_jail| {
            assert!(Configuration::load_from_path(Path::new("missing.toml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_invalid_duration_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("PROMHARNESS__HARNESS__HORIZON", "soon");
            assert!(Configuration::load().is_err());
            Ok(())
        });
    }
}
