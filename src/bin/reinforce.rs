//! REINFORCE Hover Training
//!
//! Trains the Gaussian MLP policy to hold position on the hover simulator and
//! prints one summary line per epoch:
//!
//! ```text
//! Iteration 12/100 [n=128]: 141.203311 ± 30.550012 (min: 52.000000, max: 226.310000)
//! ```
//!
//! ## Usage
//!
//! ```bash
//! flightnet-reinforce --epochs 200 --out runs/policy.bin
//!
//! # Resume; the sibling runs/policy.json supplies the layer sizes
//! flightnet-reinforce --init runs/policy.bin --reparam dynamic_bounds
//! ```

use clap::{Parser, ValueEnum};
use flightnet::{
    weights::{config_path, load_config, load_weights, save_config, save_weights},
    HoverSim, PolicyConfig, PolicyNet, PolicyTrainer, Reparam, TrainingLogger,
};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;

#[derive(Clone, Copy, ValueEnum)]
enum ReparamArg {
    FixedBounds,
    DynamicBounds,
    LogVariance,
}

impl From<ReparamArg> for Reparam {
    fn from(arg: ReparamArg) -> Self {
        match arg {
            ReparamArg::FixedBounds => Reparam::FixedBounds,
            ReparamArg::DynamicBounds => Reparam::DynamicBounds,
            ReparamArg::LogVariance => Reparam::LogVariance,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "flightnet-reinforce",
    about = "REINFORCE training of the hover policy"
)]
struct Args {
    /// Policy config JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initial policy weights (config read from the sibling .json)
    #[arg(long)]
    init: Option<PathBuf>,

    /// Where to write the trained weights
    #[arg(long, default_value = "policy.bin")]
    out: PathBuf,

    /// Optional CSV training log
    #[arg(long)]
    log: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    rollouts: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    entropy: Option<f64>,

    #[arg(long, value_enum)]
    reparam: Option<ReparamArg>,

    /// Standardise returns before the update
    #[arg(long)]
    normalize: bool,

    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config: PolicyConfig = match (&args.config, &args.init) {
        (Some(path), _) => load_config(path)?,
        (None, Some(weights)) => load_config(config_path(weights))?,
        (None, None) => PolicyConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(rollouts) = args.rollouts {
        config.rollouts_per_epoch = rollouts;
    }
    if let Some(lr) = args.lr {
        config.learning_rate = lr;
    }
    if let Some(entropy) = args.entropy {
        config.entropy_coeff = entropy;
    }
    if let Some(reparam) = args.reparam {
        config.reparam = reparam.into();
    }
    if args.normalize {
        config.normalize_returns = true;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    let mut trainer = match &args.init {
        Some(weights) => {
            let mut rng = StdRng::seed_from_u64(config.seed);
            let mut policy = PolicyNet::new(&config.layer_sizes(), &mut rng)?;
            load_weights(&mut policy, weights)?;
            PolicyTrainer::from_policy(policy, config)?
        }
        None => PolicyTrainer::new(config)?,
    };
    info!(
        "policy layers {:?}, reparameterisation {:?}",
        trainer.policy.sizes(),
        trainer.config.reparam
    );

    let mut logger = match &args.log {
        Some(path) => TrainingLogger::with_csv(path)?,
        None => TrainingLogger::stdout(),
    };

    let mut sim = HoverSim::default();
    let theoretical_max = trainer.theoretical_max();
    for _ in 0..trainer.config.epochs {
        let summary = trainer.train_epoch(&mut sim);
        logger.log_epoch(&summary, theoretical_max)?;
    }
    println!(
        "Best mean return {:.2} of {:.2} possible",
        trainer.best_mean(),
        theoretical_max
    );

    if let Some(dir) = args.out.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    save_weights(&trainer.policy, &args.out)?;
    save_config(&trainer.config, config_path(&args.out))?;
    Ok(())
}
