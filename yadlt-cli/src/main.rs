//! `yadlt`: train and benchmark the yadlt models on MNIST.
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "yadlt", version, about = "Deep learning benchmarks on MNIST")]
struct Cli {
    /// Configuration file (default: yadlt.toml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory with the MNIST IDX files.
    #[arg(long, global = true, default_value = "mnist")]
    mnist_dir: PathBuf,

    /// Directory to save trained models to.
    #[arg(long, global = true, default_value = "models")]
    output_dir: PathBuf,

    /// Seed for data shuffling and model initialization.
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Print a reconstruction of the first test image.
    #[arg(long, global = true)]
    display: bool,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train and save a restricted Boltzmann machine.
    Rbm {
        #[arg(long, value_enum, default_value_t = UnitsArg::Standard)]
        units: UnitsArg,
    },

    /// Compare logistic regression on RBM features with logistic regression
    /// on the raw input.
    RbmVsLogistic {
        #[arg(long, value_enum, default_value_t = UnitsArg::Standard)]
        units: UnitsArg,
    },

    /// Pretrain and fine-tune a deep belief network.
    Dbn {
        #[arg(long, value_enum, default_value_t = FineTune::Logistic)]
        finetune: FineTune,
    },

    /// Train a denoising autoencoder.
    Dae,

    /// Train a stacked denoising autoencoder classifier.
    Sdae {
        /// Fine-tune from randomly initialized weights.
        #[arg(long)]
        no_pretrain: bool,
    },
}

/// Visible unit types of the RBM benchmarks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum UnitsArg {
    /// Bernoulli visible units on binarized pixels.
    Standard,
    /// Gaussian visible units on normalized pixels.
    Gaussian,
    /// Multinomial visible units on discretized pixels.
    Multinomial,
}

/// DBN fine-tuning strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FineTune {
    Logistic,
    WakeSleep,
    Backprop,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(env_filter))
        .init();

    let config = config::load_config(cli.config.as_deref(), cli.seed)
        .context("Cannot load configuration")?;
    tracing::debug!(?config, "Configuration loaded");

    let ctx = commands::Context {
        config,
        mnist_dir: cli.mnist_dir,
        output_dir: cli.output_dir,
        display: cli.display,
    };

    let report = match cli.command {
        Command::Rbm { units } => commands::rbm(&ctx, units)?,
        Command::RbmVsLogistic { units } => commands::rbm_vs_logistic(&ctx, units)?,
        Command::Dbn { finetune } => commands::dbn(&ctx, finetune)?,
        Command::Dae => commands::dae(&ctx)?,
        Command::Sdae { no_pretrain } => commands::sdae(&ctx, !no_pretrain)?,
    };

    for line in report {
        println!("{line}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Cli, Command, FineTune, UnitsArg};

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::parse_from(["yadlt", "-vv", "rbm", "--units", "gaussian"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Command::Rbm {
                units: UnitsArg::Gaussian
            }
        ));

        let cli = Cli::parse_from(["yadlt", "dbn", "--finetune", "wake-sleep", "--seed", "3"]);
        assert_eq!(cli.seed, Some(3));
        assert!(matches!(
            cli.command,
            Command::Dbn {
                finetune: FineTune::WakeSleep
            }
        ));

        let cli = Cli::parse_from(["yadlt", "sdae", "--no-pretrain"]);
        assert_eq!(cli.mnist_dir.to_str(), Some("mnist"));
        assert!(matches!(cli.command, Command::Sdae { no_pretrain: true }));
    }

    #[test]
    fn rejects_unknown_units() {
        assert!(Cli::try_parse_from(["yadlt", "rbm", "--units", "poisson"]).is_err());
    }
}
