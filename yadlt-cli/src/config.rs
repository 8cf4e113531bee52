//! Layered benchmark configuration.
use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use yadlt::models::autoencoder::{DenoisingAutoencoderConfig, StackedDenoisingAutoencoderConfig};
use yadlt::models::dbn::{BackpropConfig, WakeSleepConfig};
use yadlt::models::logistic::LogisticRegressionConfig;
use yadlt::models::rbm::RbmTrainingConfig;

/// Configuration file used when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "yadlt.toml";

/// Benchmark configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub seed: u64,
    pub data: DataConfig,
    pub rbm: RbmSection,
    pub logistic: LogisticRegressionConfig,
    pub dbn: DbnSection,
    pub dae: DenoisingAutoencoderConfig,
    pub sdae: StackedDenoisingAutoencoderConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            data: DataConfig::default(),
            rbm: RbmSection::default(),
            logistic: LogisticRegressionConfig::default(),
            dbn: DbnSection::default(),
            dae: DenoisingAutoencoderConfig::default(),
            sdae: StackedDenoisingAutoencoderConfig::default(),
        }
    }
}

/// Dataset sizes and encodings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Number of training samples taken after shuffling.
    pub train_size: usize,
    /// Number of test samples taken after shuffling.
    pub test_size: usize,
    pub n_classes: usize,
    /// States per pixel for multinomial models.
    pub n_visible_states: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_size: 60_000,
            test_size: 10_000,
            n_classes: 10,
            n_visible_states: 8,
        }
    }
}

/// Single RBM benchmarks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbmSection {
    pub n_hidden: usize,
    /// States per hidden unit for multinomial models.
    pub n_hidden_states: usize,
    pub training: RbmTrainingConfig,
}

impl Default for RbmSection {
    fn default() -> Self {
        Self {
            n_hidden: 250,
            n_hidden_states: 2,
            training: RbmTrainingConfig::default(),
        }
    }
}

/// Deep belief network benchmark.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbnSection {
    pub layers: Vec<usize>,
    pub pretrain: RbmTrainingConfig,
    /// Hidden units of the associative memory used by wake-sleep.
    pub n_top: usize,
    /// Gibbs steps in the associative memory when predicting.
    pub predict_gibbs_k: usize,
    pub wake_sleep: WakeSleepConfig,
    pub backprop: BackpropConfig,
}

impl Default for DbnSection {
    fn default() -> Self {
        Self {
            layers: vec![784, 500, 500],
            pretrain: RbmTrainingConfig::default(),
            n_top: 2000,
            predict_gibbs_k: 10,
            wake_sleep: WakeSleepConfig::default(),
            backprop: BackpropConfig::default(),
        }
    }
}

/// Load the configuration.
///
/// Priority (highest to lowest):
/// 1. `seed` from the command line
/// 2. Environment variables (prefixed with `YADLT_`, `__` separates keys)
/// 3. The configuration file (`config_file`, or `yadlt.toml` if present)
/// 4. Built-in defaults
pub fn load_config(
    config_file: Option<&Path>,
    seed: Option<u64>,
) -> Result<RunConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

    match config_file {
        // An explicitly given file must exist.
        Some(path) => figment = figment.merge(Toml::file_exact(path)),
        None => {
            if Path::new(DEFAULT_CONFIG_FILE).exists() {
                figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE));
            }
        }
    }

    figment = figment.merge(Env::prefixed("YADLT_").split("__"));

    if let Some(seed) = seed {
        figment = figment.merge(Serialized::default("seed", seed));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use yadlt::models::dbn::WakeSleepConfig;

    use super::{load_config, RunConfig};

    #[test]
    fn defaults_without_sources() {
        Jail::expect_with(|_jail| {
            assert_eq!(load_config(None, None).map_err(|e| *e)?, RunConfig::default());
            Ok(())
        });
    }

    #[test]
    fn file_env_and_seed_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "yadlt.toml",
                r#"
                seed = 1

                [data]
                train_size = 1000

                [dbn]
                layers = [784, 100, 100]

                [dbn.wake_sleep]
                epochs = 3
                "#,
            )?;
            jail.set_env("YADLT_DATA__TEST_SIZE", "200");

            let config = load_config(None, None).map_err(|e| *e)?;
            assert_eq!(config.seed, 1);
            assert_eq!(config.data.train_size, 1000);
            assert_eq!(config.data.test_size, 200);
            assert_eq!(config.dbn.layers, vec![784, 100, 100]);
            assert_eq!(config.dbn.wake_sleep, WakeSleepConfig::default().epochs(3));

            let config = load_config(None, Some(7)).map_err(|e| *e)?;
            assert_eq!(config.seed, 7);
            Ok(())
        });
    }

    #[test]
    fn explicit_file_must_exist() {
        Jail::expect_with(|_jail| {
            assert!(load_config(Some("missing.toml".as_ref()), None).is_err());
            Ok(())
        });
    }

    #[test]
    fn rejects_non_positive_exponential_schedule() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "yadlt.toml",
                r#"
                [rbm.training]
                learning_rate = { rule = "exponential", start = 0.0, end = 0.01 }
                "#,
            )?;
            assert!(load_config(None, None).is_err());
            Ok(())
        });
    }

    #[test]
    fn parses_schedules_and_units() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bench.toml",
                r#"
                [rbm.training]
                learning_rate = { rule = "linear", start = 0.1, end = 0.01 }

                [dae]
                optimizer = "adam"
                corruption = { type = "masking", fraction = 0.3 }
                "#,
            )?;
            let config = load_config(Some("bench.toml".as_ref()), None).map_err(|e| *e)?;
            assert_ne!(config.rbm.training, RunConfig::default().rbm.training);
            assert_ne!(config.dae, RunConfig::default().dae);
            Ok(())
        });
    }
}
