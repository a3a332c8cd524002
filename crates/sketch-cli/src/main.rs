mod config;
mod pipeline;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{OracleFlags, TrainingFlags};
use pipeline::{CacheSummaryArgs, CommonArgs, EvalArgs, NearestNeighborArgs, TrainArgs, TrainRlArgs};

/// deep-sketch: question-to-sketch parser trained with MLE and oracle rewards.
#[derive(Parser)]
#[command(name = "deep-sketch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for training, evaluation and cache inspection.
#[derive(Subcommand)]
enum Command {
    /// Train the seq2seq model with maximum likelihood.
    Train {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        training: TrainingFlags,
    },
    /// Warm-start, then train against the reward oracle.
    TrainRl {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        training: TrainingFlags,
        #[command(flatten)]
        oracle: OracleFlags,
        /// Load `<model-id>` checkpoint instead of warm-starting with MLE.
        #[arg(long)]
        warm_model_id: Option<String>,
    },
    /// Greedy-decode the dev split with a checkpoint and report accuracy.
    Eval {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        training: TrainingFlags,
        #[command(flatten)]
        oracle: OracleFlags,
        /// Checkpoint suffix to load (`best`, `warm` or an epoch number).
        #[arg(long, default_value = "best")]
        checkpoint: String,
        /// Also count DFA-equivalent predictions.
        #[arg(long)]
        denotation: bool,
        /// Write `question<TAB>prediction` lines to this file.
        #[arg(long)]
        outfile: Option<PathBuf>,
    },
    /// Evaluate the nearest-neighbor baseline on the dev split.
    NearestNeighbor {
        #[command(flatten)]
        common: CommonArgs,
        /// Write `question<TAB>prediction` lines to this file.
        #[arg(long)]
        outfile: Option<PathBuf>,
    },
    /// Print entry count, coverage and match rates of a reward cache.
    CacheSummary {
        #[command(flatten)]
        common: CommonArgs,
        /// Override the cache file prefix.
        #[arg(long)]
        cache_id: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train { common, training } => {
            let shutdown = shutdown::install()?;
            pipeline::run_train(TrainArgs { common, training }, &shutdown)
        }
        Command::TrainRl {
            common,
            training,
            oracle,
            warm_model_id,
        } => {
            let shutdown = shutdown::install()?;
            pipeline::run_train_rl(
                TrainRlArgs {
                    common,
                    training,
                    oracle,
                    warm_model_id,
                },
                &shutdown,
            )
        }
        Command::Eval {
            common,
            training,
            oracle,
            checkpoint,
            denotation,
            outfile,
        } => pipeline::run_eval(EvalArgs {
            common,
            training,
            oracle,
            checkpoint,
            denotation,
            outfile,
        }),
        Command::NearestNeighbor { common, outfile } => {
            pipeline::run_nearest_neighbor(NearestNeighborArgs { common, outfile })
        }
        Command::CacheSummary { common, cache_id } => {
            pipeline::run_cache_summary(CacheSummaryArgs { common, cache_id })
        }
    }
}
