//! Supervised Telemetry Training
//!
//! Trains the flight transformer to predict the next telemetry row from a CSV
//! log, then writes the weights, their architecture config, and the column
//! ranges the telemetry was normalised with (`<out>.norm.json`).
//!
//! ## Usage
//!
//! ```bash
//! # Controller-sized model on a flight log
//! flightnet-train --data flight.csv --preset flight --out runs/flight.bin
//!
//! # Override the training hyperparameters from a JSON file
//! flightnet-train --data flight.csv --config training.json --epochs 20
//!
//! # Continue from earlier weights (their sibling .json supplies the architecture)
//! flightnet-train --data flight.csv --init runs/flight.bin --out runs/flight2.bin
//! ```
//!
//! The CSV has one header line, then `cond_features + seq_features` numbers per
//! row. Set `RUST_LOG=debug` for per-step detail.

use clap::Parser;
use flightnet::{
    train::GradientMode,
    weights::{
        config_path, load_config, load_weights, normalization_path, save_config, save_weights,
    },
    Config, FlightTransformer, SupervisedTrainer, TelemetryDataset, TrainingConfig,
    TrainingLogger,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "flightnet-train",
    about = "Supervised next-step training of the flight transformer"
)]
struct Args {
    /// Telemetry CSV file
    #[arg(long)]
    data: PathBuf,

    /// Architecture preset: flight, telemetry or tiny
    #[arg(long, default_value = "flight")]
    preset: String,

    /// Training config JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initial weights (architecture read from the sibling .json)
    #[arg(long)]
    init: Option<PathBuf>,

    /// Where to write the trained weights
    #[arg(long, default_value = "flight.bin")]
    out: PathBuf,

    /// Optional CSV training log
    #[arg(long)]
    log: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    /// Estimate gradients by finite differences with this step
    #[arg(long)]
    finite_difference: Option<f64>,

    /// Evaluate finite differences on private model copies in parallel
    #[arg(long)]
    parallel: bool,

    #[arg(long)]
    seed: Option<u64>,
}

fn preset(name: &str) -> Option<Config> {
    match name {
        "flight" => Some(Config::flight()),
        "telemetry" => Some(Config::telemetry()),
        "tiny" => Some(Config::tiny()),
        _ => None,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut training: TrainingConfig = match &args.config {
        Some(path) => load_config(path)?,
        None => TrainingConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        training.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        training.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        training.learning_rate = lr;
    }
    if let Some(seed) = args.seed {
        training.seed = seed;
    }
    if let Some(epsilon) = args.finite_difference {
        training.gradient_mode = GradientMode::FiniteDifference {
            epsilon,
            parallel: args.parallel,
        };
    }

    let model_config = match &args.init {
        Some(weights) => load_config(config_path(weights))?,
        None => preset(&args.preset)
            .ok_or_else(|| format!("unknown preset '{}' (flight, telemetry, tiny)", args.preset))?,
    };

    println!("\n{}", "=".repeat(70));
    println!("  Flight transformer: supervised training");
    println!("{}", "=".repeat(70));
    println!(
        "  d_model {} | heads {} | layers {} | seq_len {} | {} parameters",
        model_config.d_model,
        model_config.n_head,
        model_config.n_layers,
        model_config.seq_len,
        model_config.num_parameters()
    );
    println!(
        "  epochs {} | batch {} | lr {:e} | gradients {:?}\n",
        training.epochs, training.batch_size, training.learning_rate, training.gradient_mode
    );

    let dataset = TelemetryDataset::from_csv(
        &args.data,
        model_config.cond_features,
        model_config.seq_features,
    )?;
    // Fine-tuning keeps the ranges the initial weights were trained with
    let dataset = match &args.init {
        Some(weights) if normalization_path(weights).exists() => {
            dataset.with_normalization(load_config(normalization_path(weights))?)?
        }
        _ => dataset,
    };
    let (train_set, val_set) = dataset.split(training.val_fraction, model_config.seq_len);
    println!(
        "Loaded {} rows from {} ({} training windows)",
        dataset.rows(),
        args.data.display(),
        train_set.num_windows(model_config.seq_len)
    );

    let mut rng = StdRng::seed_from_u64(training.seed);
    let mut model = FlightTransformer::new(&model_config, &mut rng)?;
    if let Some(weights) = &args.init {
        load_weights(&mut model, weights)?;
    }

    let mut logger = match &args.log {
        Some(path) => TrainingLogger::with_csv(path)?,
        None => TrainingLogger::stdout(),
    };

    let mut trainer = SupervisedTrainer::new(model, training)?;
    let loss = trainer.fit(&train_set, val_set.as_ref(), &mut logger)?;

    if let Some(val) = &val_set {
        println!("\nValidation loss: {:.6}", trainer.evaluate(val));
    }
    println!(
        "Final training loss: {loss:.6} after {} steps ({:.1}s)",
        trainer.steps(),
        logger.elapsed_seconds()
    );

    if let Some(dir) = args.out.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    save_weights(&trainer.model, &args.out)?;
    save_config(&trainer.model.config, config_path(&args.out))?;
    save_config(&dataset.normalization, normalization_path(&args.out))?;
    println!("Saved weights to {}", args.out.display());
    Ok(())
}
