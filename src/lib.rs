//! Flightnet: Hand-Derived Flight Models
//!
//! A small causal transformer and a Gaussian MLP policy for quadrotor control,
//! trained from first principles in Rust: manual forward passes, hand-derived
//! backward passes (or finite differences), and a manual Adam update.
//!
//! # Modules
//!
//! - [`tensor`] - Row-major `f64` tensors and trainable [`Param`]s
//! - [`layers`] - Embedding, RMSNorm, GELU feed-forward, ALiBi attention
//! - [`model`] - The flight transformer and its loss
//! - [`gradients`] - Clipping and finite-difference estimators
//! - [`optimizer`] - Adam and the adaptive learning rate
//! - [`train`] - Telemetry dataset and supervised trainer
//! - [`policy`] - Squashed Gaussian policy head and network
//! - [`rollout`] - Episodes and discounted returns
//! - [`reinforce`] - REINFORCE trainer and epoch summaries
//! - [`sim`] - Simulator boundary and a hover stand-in
//! - [`controller`] - Rolling-history transformer controller
//! - [`weights`] - Flat weight files
//!
//! # Example
//!
//! ```rust,no_run
//! use flightnet::{HoverSim, PolicyConfig, PolicyTrainer};
//!
//! let mut trainer = PolicyTrainer::new(PolicyConfig::default()).unwrap();
//! let mut sim = HoverSim::default();
//! for _ in 0..trainer.config.epochs {
//!     let summary = trainer.train_epoch(&mut sim);
//!     println!("{summary}");
//! }
//! flightnet::weights::save_weights(&trainer.policy, "policy.bin").unwrap();
//! ```

pub mod controller;
pub mod error;
pub mod gradients;
pub mod layers;
pub mod model;
pub mod optimizer;
pub mod policy;
pub mod reinforce;
pub mod rollout;
pub mod sim;
pub mod tensor;
pub mod train;
pub mod training_logger;
pub mod weights;

// Re-export main types for convenience
pub use controller::TransformerController;
pub use error::{Error, LoadError, Result};
pub use model::{Config, FlightTransformer};
pub use optimizer::{AdaptiveLearningRate, Adam};
pub use policy::{PolicyNet, Reparam};
pub use reinforce::{EpochSummary, PolicyConfig, PolicyTrainer};
pub use rollout::Rollout;
pub use sim::{FlightSim, HoverSim, Observation};
pub use tensor::{Param, Parameters, Tensor};
pub use train::{GradientMode, SupervisedTrainer, TelemetryDataset, TrainingConfig};
pub use training_logger::{StepRecord, TrainingLogger};
