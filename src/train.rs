//! Supervised Telemetry Training
//!
//! Teaches a [`FlightTransformer`] to predict the next telemetry row.
//!
//! ## How Windows Are Generated
//!
//! ```text
//! Rows:    r0 r1 r2 r3 r4 r5
//! seq_len: 3
//!
//!   Input: [r0 r1 r2]  Target: [r1 r2 r3]
//!   Input: [r1 r2 r3]  Target: [r2 r3 r4]
//!   Input: [r2 r3 r4]  Target: [r3 r4 r5]
//! ```
//!
//! The target is the input shifted by one row. Only the sequence-feature
//! columns of the target enter the loss.
//!
//! ## Training Step
//!
//! 1. Forward each window of the batch, clamped MSE, averaged over the batch
//! 2. Skip the batch if the loss is not finite
//! 3. Gradients, exact or by finite differences
//! 4. Element-wise clip, then global-norm clip inside Adam
//! 5. Adam step, optional adaptive learning rate

use crate::error::{invalid_config, Error, Result};
use crate::gradients::{
    accumulate_flat, clip_elementwise, finite_difference_parallel, finite_difference_serial,
    grad_norm,
};
use crate::model::{clamped_mse, FlightTransformer};
use crate::optimizer::{Adam, AdaptiveLearningRate};
use crate::tensor::{Parameters, Tensor};
use crate::training_logger::{StepRecord, TrainingLogger};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Per-column min-max ranges mapping raw telemetry into `[-1, 1]`
///
/// Columns with zero range pass through unchanged in both directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mins: Vec<f64>,
    pub maxs: Vec<f64>,
}

impl Normalization {
    /// Column ranges of `rows`, all of which have `width` entries
    pub fn fit(rows: &[Vec<f64>], width: usize) -> Self {
        let mut mins = vec![f64::INFINITY; width];
        let mut maxs = vec![f64::NEG_INFINITY; width];
        for row in rows {
            for (j, &v) in row.iter().enumerate() {
                mins[j] = mins[j].min(v);
                maxs[j] = maxs[j].max(v);
            }
        }
        Self { mins, maxs }
    }

    pub fn width(&self) -> usize {
        self.mins.len()
    }

    fn range(&self, column: usize) -> f64 {
        self.maxs[column] - self.mins[column]
    }

    /// Raw value of `column` to normalised units
    pub fn scale(&self, column: usize, value: f64) -> f64 {
        let range = self.range(column);
        if range > 0.0 {
            2.0 * (value - self.mins[column]) / range - 1.0
        } else {
            value
        }
    }

    /// Normalised value of `column` back to raw units
    pub fn unscale(&self, column: usize, value: f64) -> f64 {
        let range = self.range(column);
        if range > 0.0 {
            (value + 1.0) / 2.0 * range + self.mins[column]
        } else {
            value
        }
    }

    pub fn scale_row(&self, row: &mut [f64]) {
        for (j, v) in row.iter_mut().enumerate() {
            *v = self.scale(j, *v);
        }
    }
}

/// Min-max normalised telemetry rows `[cond | seq]`
#[derive(Clone, Debug)]
pub struct TelemetryDataset {
    pub data: Tensor,
    pub cond_features: usize,
    pub seq_features: usize,
    /// Ranges the rows were scaled with
    pub normalization: Normalization,
}

impl TelemetryDataset {
    /// Parse a CSV file with one header line
    pub fn from_csv(
        path: impl AsRef<Path>,
        cond_features: usize,
        seq_features: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let dataset = Self::parse_csv(&text, cond_features, seq_features)?;
        info!("loaded {} telemetry rows from {}", dataset.rows(), path.display());
        Ok(dataset)
    }

    pub fn parse_csv(text: &str, cond_features: usize, seq_features: usize) -> Result<Self> {
        let width = cond_features + seq_features;
        let mut lines = text.lines();
        if lines.next().is_none() {
            return Err(Error::Dataset("missing header line".into()));
        }

        let mut rows = Vec::new();
        for (i, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row = line
                .split(',')
                .map(|field| field.trim().parse::<f64>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::Dataset(format!("line {}: {e}", i + 2)))?;
            if row.len() < width {
                return Err(Error::Dataset(format!(
                    "line {}: expected {width} columns, found {}",
                    i + 2,
                    row.len()
                )));
            }
            rows.push(row[..width].to_vec());
        }

        Self::from_rows(rows, cond_features, seq_features)
    }

    /// Normalise each column of `rows` into `[-1, 1]`
    ///
    /// Columns with zero range are left unchanged.
    pub fn from_rows(rows: Vec<Vec<f64>>, cond_features: usize, seq_features: usize) -> Result<Self> {
        let width = cond_features + seq_features;
        if rows.is_empty() {
            return Err(Error::Dataset("no data rows".into()));
        }
        if let Some(bad) = rows.iter().position(|r| r.len() != width) {
            return Err(Error::Dataset(format!("row {bad} does not have {width} columns")));
        }

        let normalization = Normalization::fit(&rows, width);
        let n = rows.len();
        let mut data: Vec<f64> = rows.into_iter().flatten().collect();
        for row in data.chunks_mut(width) {
            normalization.scale_row(row);
        }

        Ok(Self {
            data: Tensor::new(data, vec![n, width]),
            cond_features,
            seq_features,
            normalization,
        })
    }

    /// Rescale the rows with ranges fitted elsewhere, e.g. the ones saved with
    /// weights being fine-tuned
    pub fn with_normalization(mut self, normalization: Normalization) -> Result<Self> {
        let width = self.cond_features + self.seq_features;
        if normalization.width() != width {
            return Err(Error::Dataset(format!(
                "normalization covers {} columns, dataset has {width}",
                normalization.width()
            )));
        }
        for row in self.data.data.chunks_mut(width) {
            for (j, v) in row.iter_mut().enumerate() {
                *v = normalization.scale(j, self.normalization.unscale(j, *v));
            }
        }
        self.normalization = normalization;
        Ok(self)
    }

    pub fn rows(&self) -> usize {
        self.data.rows()
    }

    /// Number of `(input, target)` windows of length `seq_len`
    pub fn num_windows(&self, seq_len: usize) -> usize {
        self.rows().saturating_sub(seq_len)
    }

    /// Input rows `[start, start + seq_len)` and target rows one later
    pub fn window(&self, start: usize, seq_len: usize) -> (Tensor, Tensor) {
        let width = self.data.cols();
        let slice = |from: usize| {
            Tensor::new(
                self.data.data[from * width..(from + seq_len) * width].to_vec(),
                vec![seq_len, width],
            )
        };
        (slice(start), slice(start + 1))
    }

    /// Split off the last `val_fraction` of rows
    ///
    /// The validation part is `None` when it would hold no complete window.
    pub fn split(&self, val_fraction: f64, seq_len: usize) -> (Self, Option<Self>) {
        let n = self.rows();
        let n_val = ((n as f64) * val_fraction.clamp(0.0, 1.0)).round() as usize;
        if n_val <= seq_len || n - n_val <= seq_len {
            return (self.clone(), None);
        }

        let width = self.data.cols();
        let part = |from: usize, to: usize| Self {
            data: Tensor::new(self.data.data[from * width..to * width].to_vec(), vec![to - from, width]),
            ..self.clone()
        };
        (part(0, n - n_val), Some(part(n - n_val, n)))
    }
}

/// How the trainer obtains gradients
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientMode {
    /// Hand-derived reverse pass
    #[default]
    Exact,
    /// Forward differences, one full evaluation per scalar
    FiniteDifference { epsilon: f64, parallel: bool },
}

/// Supervised training hyperparameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Global gradient norm bound
    pub clip_norm: f64,
    /// Element-wise gradient bound
    pub grad_clip: f64,
    pub adaptive_lr: bool,
    pub gradient_mode: GradientMode,
    /// Log every this many steps
    pub log_every: usize,
    pub val_fraction: f64,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 4,
            learning_rate: 1e-4,
            weight_decay: 0.01,
            clip_norm: 1.0,
            grad_clip: 1.0,
            adaptive_lr: true,
            gradient_mode: GradientMode::Exact,
            log_every: 100,
            val_fraction: 0.1,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Reject settings that would panic or poison the weights
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(invalid_config(format!("{name} must be positive and finite, got {v}")))
            }
        };
        positive("learning_rate", self.learning_rate)?;
        positive("grad_clip", self.grad_clip)?;
        positive("clip_norm", self.clip_norm)?;
        if let GradientMode::FiniteDifference { epsilon, .. } = self.gradient_mode {
            positive("finite-difference epsilon", epsilon)?;
        }
        if !(self.weight_decay >= 0.0) {
            return Err(invalid_config("weight_decay must be non-negative"));
        }
        if !(0.0..1.0).contains(&self.val_fraction) {
            return Err(invalid_config(format!(
                "val_fraction must lie in [0, 1), got {}",
                self.val_fraction
            )));
        }
        if self.batch_size == 0 {
            return Err(invalid_config("batch_size must be non-zero"));
        }
        Ok(())
    }

    /// Short run for tests and smoke checks
    pub fn tiny() -> Self {
        Self {
            epochs: 2,
            batch_size: 2,
            learning_rate: 1e-3,
            log_every: 1,
            val_fraction: 0.0,
            ..Self::default()
        }
    }
}

pub struct SupervisedTrainer {
    pub model: FlightTransformer,
    pub optimizer: Adam,
    pub config: TrainingConfig,
    schedule: Option<AdaptiveLearningRate>,
    rng: StdRng,
    step: usize,
    last_grad_norm: f64,
}

impl SupervisedTrainer {
    pub fn new(model: FlightTransformer, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let optimizer =
            Adam::new(config.learning_rate, config.weight_decay).with_clip_norm(config.clip_norm);
        let schedule = config.adaptive_lr.then(AdaptiveLearningRate::default);
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            model,
            optimizer,
            config,
            schedule,
            rng,
            step: 0,
            last_grad_norm: 0.0,
        })
    }

    /// Completed optimizer steps
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Mean loss over a batch of `(input, target)` windows
    pub fn batch_loss(model: &FlightTransformer, batch: &[(Tensor, Tensor)]) -> f64 {
        let cond = model.config.cond_features;
        let total: f64 = batch
            .iter()
            .map(|(x, y)| clamped_mse(&model.inference(x), y, cond).0)
            .sum();
        total / batch.len() as f64
    }

    /// One optimizer step on `batch`
    ///
    /// Returns the pre-update loss, or `None` when the batch was skipped
    /// because its loss was not finite.
    pub fn train_step(&mut self, batch: &[(Tensor, Tensor)]) -> Option<f64> {
        if batch.is_empty() {
            return None;
        }
        let cond = self.model.config.cond_features;
        let scale = 1.0 / batch.len() as f64;

        let loss = match self.config.gradient_mode {
            GradientMode::Exact => {
                let mut total = 0.0;
                for (x, y) in batch {
                    let (pred, cache) = self.model.forward(x);
                    let (loss, grad) = clamped_mse(&pred, y, cond);
                    total += loss;
                    if loss.is_finite() {
                        self.model.backward(&grad.mul_scalar(scale), &cache);
                    }
                }
                total * scale
            }
            GradientMode::FiniteDifference { epsilon, parallel } => {
                let loss = Self::batch_loss(&self.model, batch);
                if loss.is_finite() {
                    let f = |m: &FlightTransformer| Self::batch_loss(m, batch);
                    let grads = if parallel {
                        finite_difference_parallel(&self.model, f, epsilon)
                    } else {
                        finite_difference_serial(&mut self.model, f, epsilon)
                    };
                    accumulate_flat(&mut self.model, &grads);
                }
                loss
            }
        };

        if !loss.is_finite() {
            warn!("skipping step {}: non-finite loss {loss}", self.step + 1);
            self.model.zero_grad();
            return None;
        }

        clip_elementwise(&mut self.model, self.config.grad_clip);
        let norm = grad_norm(&self.model);
        self.optimizer.step(&mut self.model);
        self.step += 1;
        self.last_grad_norm = norm;

        if let Some(schedule) = &mut self.schedule {
            self.optimizer.learning_rate = schedule.adjust(self.optimizer.learning_rate, loss);
        }
        debug!("step {} loss {loss:.6} grad norm {norm:.4}", self.step);
        Some(loss)
    }

    /// Mean loss over every window of `dataset`, without updating
    pub fn evaluate(&self, dataset: &TelemetryDataset) -> f64 {
        let seq_len = self.model.config.seq_len;
        let n = dataset.num_windows(seq_len);
        if n == 0 {
            return f64::NAN;
        }
        let windows: Vec<(Tensor, Tensor)> = (0..n).map(|s| dataset.window(s, seq_len)).collect();
        Self::batch_loss(&self.model, &windows)
    }

    /// One pass over shuffled windows of `dataset`
    ///
    /// Returns the mean loss of the steps that were not skipped.
    pub fn train_epoch(
        &mut self,
        epoch: usize,
        dataset: &TelemetryDataset,
        validation: Option<&TelemetryDataset>,
        logger: &mut TrainingLogger,
    ) -> Result<f64> {
        let seq_len = self.model.config.seq_len;
        let mut starts: Vec<usize> = (0..dataset.num_windows(seq_len)).collect();
        if starts.is_empty() {
            return Err(Error::Dataset(format!(
                "need more than {seq_len} rows, found {}",
                dataset.rows()
            )));
        }
        starts.shuffle(&mut self.rng);

        let mut total = 0.0;
        let mut counted = 0usize;
        for chunk in starts.chunks(self.config.batch_size.max(1)) {
            let batch: Vec<(Tensor, Tensor)> =
                chunk.iter().map(|&s| dataset.window(s, seq_len)).collect();
            let lr = self.optimizer.learning_rate;
            let Some(loss) = self.train_step(&batch) else {
                continue;
            };
            total += loss;
            counted += 1;

            if self.step % self.config.log_every.max(1) == 0 {
                logger.log_step(&StepRecord {
                    step: self.step,
                    epoch,
                    learning_rate: lr,
                    train_loss: loss,
                    val_loss: validation.map(|v| self.evaluate(v)),
                    grad_norm: self.last_grad_norm,
                })?;
            }
        }

        let mean = if counted > 0 { total / counted as f64 } else { f64::NAN };
        info!("epoch {epoch}: mean loss {mean:.6} over {counted} steps");
        Ok(mean)
    }

    /// Run `config.epochs` epochs; returns the last epoch's mean loss
    pub fn fit(
        &mut self,
        dataset: &TelemetryDataset,
        validation: Option<&TelemetryDataset>,
        logger: &mut TrainingLogger,
    ) -> Result<f64> {
        let mut last = f64::NAN;
        for epoch in 1..=self.config.epochs {
            last = self.train_epoch(epoch, dataset, validation, logger)?;
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Config;

    fn sine_rows(n: usize, width: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|i| {
                (0..width)
                    .map(|j| ((i as f64) * 0.3 + j as f64).sin() * (j + 1) as f64)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_parse_csv_normalises_columns() {
        let csv = "a,b,c\n0,10,5\n5,20,5\n10,30,5\n";
        let ds = TelemetryDataset::parse_csv(csv, 1, 2).unwrap();
        assert_eq!(ds.rows(), 3);
        assert_eq!(ds.data.row(0), &[-1.0, -1.0, 5.0]);
        assert_eq!(ds.data.row(1), &[0.0, 0.0, 5.0]);
        assert_eq!(ds.data.row(2), &[1.0, 1.0, 5.0]);
    }

    #[test]
    fn test_parse_csv_rejects_short_rows() {
        let err = TelemetryDataset::parse_csv("h\n1,2\n", 1, 2).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
        let err = TelemetryDataset::parse_csv("h\n1,x,3\n", 1, 2).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_window_target_is_shifted() {
        let ds = TelemetryDataset::from_rows(sine_rows(10, 5), 2, 3).unwrap();
        assert_eq!(ds.num_windows(4), 6);
        let (x, y) = ds.window(2, 4);
        assert_eq!(x.row(1), ds.data.row(3));
        assert_eq!(y.row(0), ds.data.row(3));
        assert_eq!(y.row(3), ds.data.row(6));
    }

    #[test]
    fn test_split_keeps_tail_for_validation() {
        let ds = TelemetryDataset::from_rows(sine_rows(40, 5), 2, 3).unwrap();
        let (train, val) = ds.split(0.25, 4);
        let val = val.unwrap();
        assert_eq!(train.rows(), 30);
        assert_eq!(val.rows(), 10);
        assert_eq!(val.data.row(0), ds.data.row(30));

        let (_, none) = ds.split(0.05, 4);
        assert!(none.is_none());
    }

    #[test]
    fn test_training_reduces_loss() {
        let config = Config::tiny();
        let mut rng = StdRng::seed_from_u64(9);
        let model = FlightTransformer::new(&config, &mut rng).unwrap();
        let ds = TelemetryDataset::from_rows(sine_rows(30, config.input_width()), 2, 3).unwrap();

        let mut trainer = SupervisedTrainer::new(
            model,
            TrainingConfig {
                epochs: 15,
                adaptive_lr: false,
                learning_rate: 3e-3,
                ..TrainingConfig::tiny()
            },
        )
        .unwrap();
        let before = trainer.evaluate(&ds);
        let mut logger = TrainingLogger::stdout().quiet();
        trainer.fit(&ds, None, &mut logger).unwrap();
        let after = trainer.evaluate(&ds);

        assert!(after < before, "loss {before} -> {after}");
        assert!(trainer.steps() > 0);
    }

    #[test]
    fn test_finite_difference_mode_steps() {
        let config = Config::tiny();
        let mut rng = StdRng::seed_from_u64(10);
        let model = FlightTransformer::new(&config, &mut rng).unwrap();
        let ds = TelemetryDataset::from_rows(sine_rows(12, config.input_width()), 2, 3).unwrap();
        let batch = vec![ds.window(0, config.seq_len), ds.window(3, config.seq_len)];

        let mut trainer = SupervisedTrainer::new(
            model,
            TrainingConfig {
                gradient_mode: GradientMode::FiniteDifference {
                    epsilon: 1e-6,
                    parallel: true,
                },
                ..TrainingConfig::tiny()
            },
        )
        .unwrap();
        let before = SupervisedTrainer::batch_loss(&trainer.model, &batch);
        let loss = trainer.train_step(&batch).unwrap();
        assert!((loss - before).abs() < 1e-12);
        assert_eq!(trainer.optimizer.t, 1);
        assert!(trainer.model.flat_grad().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_non_finite_batch_is_skipped() {
        let config = Config::tiny();
        let mut rng = StdRng::seed_from_u64(11);
        let model = FlightTransformer::new(&config, &mut rng).unwrap();
        let mut x = Tensor::zeros(vec![config.seq_len, config.input_width()]);
        x.data[0] = f64::NAN;
        let y = Tensor::zeros(vec![config.seq_len, config.input_width()]);

        let mut trainer = SupervisedTrainer::new(model, TrainingConfig::tiny()).unwrap();
        assert!(trainer.train_step(&[(x, y)]).is_none());
        assert_eq!(trainer.optimizer.t, 0);
        assert_eq!(trainer.steps(), 0);
    }

    #[test]
    fn test_normalization_maps_back_to_raw_units() {
        let rows = vec![vec![0.0, 48.0, 7.0], vec![4.0, 52.0, 7.0]];
        let norm = Normalization::fit(&rows, 3);
        assert_eq!(norm.scale(1, 50.0), 0.0);
        assert_eq!(norm.unscale(1, 0.0), 50.0);
        assert_eq!(norm.unscale(1, -1.0), 48.0);
        assert_eq!(norm.unscale(0, 0.5), 3.0);
        assert_eq!(norm.scale(2, 7.0), 7.0);
        assert_eq!(norm.unscale(2, 7.0), 7.0);
    }

    #[test]
    fn test_with_normalization_rescales_rows() {
        let ds = TelemetryDataset::from_rows(vec![vec![0.0, 10.0], vec![10.0, 20.0]], 1, 1).unwrap();
        let wider = Normalization {
            mins: vec![-10.0, 0.0],
            maxs: vec![10.0, 20.0],
        };
        let ds = ds.with_normalization(wider.clone()).unwrap();
        assert_eq!(ds.data.row(0), &[0.0, 0.0]);
        assert_eq!(ds.data.row(1), &[1.0, 1.0]);
        assert_eq!(ds.normalization, wider);

        let narrow = Normalization {
            mins: vec![0.0],
            maxs: vec![1.0],
        };
        assert!(matches!(ds.with_normalization(narrow), Err(Error::Dataset(_))));
    }

    #[test]
    fn test_config_validation_rejects_unusable_settings() {
        let mut rng = StdRng::seed_from_u64(12);
        let model = FlightTransformer::new(&Config::tiny(), &mut rng).unwrap();
        let reject = |config: TrainingConfig| {
            matches!(
                SupervisedTrainer::new(model.clone(), config),
                Err(Error::InvalidConfig(_))
            )
        };

        assert!(reject(TrainingConfig {
            grad_clip: -1.0,
            ..TrainingConfig::tiny()
        }));
        assert!(reject(TrainingConfig {
            grad_clip: f64::NAN,
            ..TrainingConfig::tiny()
        }));
        assert!(reject(TrainingConfig {
            clip_norm: 0.0,
            ..TrainingConfig::tiny()
        }));
        assert!(reject(TrainingConfig {
            learning_rate: 0.0,
            ..TrainingConfig::tiny()
        }));
        assert!(reject(TrainingConfig {
            gradient_mode: GradientMode::FiniteDifference {
                epsilon: 0.0,
                parallel: false,
            },
            ..TrainingConfig::tiny()
        }));
        assert!(reject(TrainingConfig {
            val_fraction: 1.0,
            ..TrainingConfig::tiny()
        }));
        assert!(SupervisedTrainer::new(model, TrainingConfig::default()).is_ok());
    }
}
