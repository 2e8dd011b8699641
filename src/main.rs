use dagshield_train::config::TrainerConfig;
use dagshield_train::pipeline;
use dagshield_train::utils;

use anyhow::Result;
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "dagshield-train",
    about = "Train the DAGShield Web3 threat classifier and export it",
    version
)]
struct Args {
    /// Directory where synthetic/input data is read or written
    #[arg(long, default_value = "./data")]
    data_path: std::path::PathBuf,
    /// Directory where all model artifacts are written
    #[arg(long, default_value = "./models")]
    model_path: std::path::PathBuf,
    /// Training CSV (defaults to <data-path>/synthetic_threat_data.csv)
    #[arg(long)]
    input: Option<std::path::PathBuf>,
    /// Number of synthetic samples to generate when no data exists
    #[arg(long, default_value_t = 10_000)]
    samples: usize,
    /// Seed for data generation, splitting and model fitting
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Held-out fraction
    #[arg(long, default_value_t = 0.2)]
    test_size: f64,
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = TrainerConfig {
        data_path: args.data_path,
        model_path: args.model_path,
        input_file: args.input,
        n_samples: args.samples,
        seed: args.seed,
        test_size: args.test_size,
    };
    info!(?config, "starting threat detector training");

    let summary = pipeline::run(&config)?;
    utils::print_summary(&summary);
    info!(
        winner = %summary.winner,
        accuracy = summary.held_out_accuracy,
        onnx = summary.onnx_exported,
        "training pipeline completed"
    );

    Ok(())
}
