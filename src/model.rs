//! Flight Transformer
//!
//! A small causal transformer that predicts the next telemetry row from a
//! window of past rows.
//!
//! ## Architecture Overview
//!
//! ```text
//! Input rows [seq_len, cond_features + seq_features]
//!     ↓
//! seq @ W_seq + cond @ W_cond          [seq_len, d_model]
//!     ↓
//! Transformer Block 1 (RMSNorm → ALiBi attention, RMSNorm → GELU FFN)
//!     ↓
//!     ...
//!     ↓
//! Transformer Block N
//!     ↓
//! hidden @ W_out                        [seq_len, seq_features]
//! ```
//!
//! There is no final normalization and no positional embedding.
//!
//! ## Parameter Order
//!
//! `W_seq, W_cond`, then per layer `Wq, Wk, Wv, Wo, Wff1, Wff2`, then `W_out`.
//! This is both the optimizer's iteration order and the weight file layout.
//!
//! ## Example
//!
//! ```rust
//! use flightnet::{Config, FlightTransformer, Tensor};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let config = Config::tiny();
//! let mut rng = StdRng::seed_from_u64(0);
//! let model = FlightTransformer::new(&config, &mut rng).unwrap();
//! let x = Tensor::zeros(vec![config.seq_len, config.input_width()]);
//! let y = model.inference(&x);
//! assert_eq!(y.shape, vec![config.seq_len, config.seq_features]);
//! ```

use crate::error::{invalid_config, Result};
use crate::layers::{BlockCache, Embedding, EmbeddingCache, Linear, TransformerBlock};
use crate::tensor::{Param, Parameters, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-element bound applied to prediction errors in the loss
pub const LOSS_CLAMP: f64 = 100.0;

/// Model configuration
///
/// # Fields
///
/// - `cond_features`: Leading input columns that condition the prediction
/// - `seq_features`: Trailing input columns that are predicted one step ahead
/// - `d_model`: Hidden width
/// - `n_head`: Attention heads per layer; must divide `d_model`
/// - `n_layers`: Number of transformer blocks
/// - `seq_len`: Window length
///
/// # Parameter Count
///
/// ```text
/// (cond + seq) × d_model + n_layers × 12 × d_model² + d_model × seq
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub cond_features: usize,
    pub seq_features: usize,
    pub d_model: usize,
    pub n_head: usize,
    pub n_layers: usize,
    pub seq_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::flight()
    }
}

impl Config {
    /// Controller-sized model
    ///
    /// Conditions on the desired body velocity (3) and predicts angular velocity,
    /// acceleration and rotor speeds (10).
    pub fn flight() -> Self {
        Self {
            cond_features: 3,
            seq_features: 10,
            d_model: 32,
            n_head: 4,
            n_layers: 2,
            seq_len: 64,
        }
    }

    /// Wider model for offline telemetry prediction
    pub fn telemetry() -> Self {
        Self {
            cond_features: 4,
            seq_features: 10,
            d_model: 128,
            n_head: 4,
            n_layers: 2,
            seq_len: 64,
        }
    }

    /// Minimal model for tests and smoke runs
    pub fn tiny() -> Self {
        Self {
            cond_features: 2,
            seq_features: 3,
            d_model: 8,
            n_head: 2,
            n_layers: 1,
            seq_len: 6,
        }
    }

    /// Columns per input row
    pub fn input_width(&self) -> usize {
        self.cond_features + self.seq_features
    }

    pub fn d_head(&self) -> usize {
        self.d_model / self.n_head
    }

    /// Initialization scale `√(2 / d_model)`
    pub fn init_scale(&self) -> f64 {
        (2.0 / self.d_model as f64).sqrt()
    }

    pub fn num_parameters(&self) -> usize {
        let d = self.d_model;
        self.input_width() * d + self.n_layers * 12 * d * d + d * self.seq_features
    }

    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 || self.n_head == 0 || self.seq_len == 0 {
            return Err(invalid_config("d_model, n_head and seq_len must be non-zero"));
        }
        if self.d_model % self.n_head != 0 {
            return Err(invalid_config(format!(
                "d_model ({}) must be a multiple of n_head ({})",
                self.d_model, self.n_head
            )));
        }
        if self.seq_features == 0 {
            return Err(invalid_config("seq_features must be non-zero"));
        }
        Ok(())
    }
}

/// Intermediates from [`FlightTransformer::forward`]
#[derive(Clone, Debug)]
pub struct ModelCache {
    pub embedding: EmbeddingCache,
    pub blocks: Vec<BlockCache>,
    /// Input to the output projection
    pub hidden: Tensor,
}

#[derive(Clone, Debug)]
pub struct FlightTransformer {
    pub config: Config,
    pub embedding: Embedding,
    pub blocks: Vec<TransformerBlock>,
    pub out: Linear,
}

impl FlightTransformer {
    /// Build a model with weights drawn from `N(0, 1) × √(2 / d_model)`
    pub fn new<R: Rng + ?Sized>(config: &Config, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let scale = config.init_scale();
        let d = config.d_model;

        let embedding = Embedding::new(config.cond_features, config.seq_features, d, scale, rng);
        let blocks = (0..config.n_layers)
            .map(|_| TransformerBlock::new(d, config.n_head, scale, rng))
            .collect();
        let out = Linear::new(d, config.seq_features, scale, false, rng);

        Ok(Self {
            config: config.clone(),
            embedding,
            blocks,
            out,
        })
    }

    /// Forward pass over one window of `[rows, cond + seq]` inputs
    ///
    /// Returns predictions `[rows, seq_features]` and the cache for
    /// [`FlightTransformer::backward`]. Any number of rows is accepted; row `i`
    /// of the output depends only on input rows `0..=i`.
    pub fn forward(&self, x: &Tensor) -> (Tensor, ModelCache) {
        let (mut hidden, embedding) = self.embedding.forward(x);

        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (h, cache) = block.forward(&hidden);
            hidden = h;
            blocks.push(cache);
        }

        let y = self.out.forward(&hidden);
        let cache = ModelCache {
            embedding,
            blocks,
            hidden,
        };
        (y, cache)
    }

    /// Forward pass without keeping intermediates
    pub fn inference(&self, x: &Tensor) -> Tensor {
        self.forward(x).0
    }

    /// Exact reverse pass
    ///
    /// Adds the gradient of the loss with respect to every weight into the
    /// parameters' `grad` buffers, given `grad_out = ∂L/∂output`.
    pub fn backward(&mut self, grad_out: &Tensor, cache: &ModelCache) {
        let mut grad = self.out.backward(grad_out, &cache.hidden);
        for (block, block_cache) in self.blocks.iter_mut().zip(&cache.blocks).rev() {
            grad = block.backward(&grad, block_cache);
        }
        self.embedding.backward(&grad, &cache.embedding);
    }
}

impl Parameters for FlightTransformer {
    fn parameters(&self) -> Vec<&Param> {
        let mut out = self.embedding.params();
        for block in &self.blocks {
            out.extend(block.params());
        }
        out.push(&self.out.weight);
        out
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut out = self.embedding.params_mut();
        for block in &mut self.blocks {
            out.extend(block.params_mut());
        }
        out.push(&mut self.out.weight);
        out
    }
}

/// Mean squared error over the sequence-feature columns
///
/// `target` holds full input rows `[cond | seq]`; only the trailing
/// `seq_features` columns are compared. Each difference is clamped to
/// `±LOSS_CLAMP` before squaring.
///
/// Returns the loss and `∂L/∂prediction`.
pub fn clamped_mse(prediction: &Tensor, target: &Tensor, cond_features: usize) -> (f64, Tensor) {
    let rows = prediction.rows();
    let width = prediction.cols();
    assert_eq!(target.rows(), rows, "Target has {} rows, expected {rows}", target.rows());
    assert_eq!(target.cols(), cond_features + width, "Target width mismatch");

    let count = (rows * width) as f64;
    let mut grad = Tensor::zeros(prediction.shape.clone());
    let mut loss = 0.0;

    for r in 0..rows {
        let t = &target.row(r)[cond_features..];
        let p = prediction.row(r);
        let g = grad.row_mut(r);
        for c in 0..width {
            let raw = p[c] - t[c];
            let diff = raw.clamp(-LOSS_CLAMP, LOSS_CLAMP);
            loss += diff * diff;
            if raw.abs() < LOSS_CLAMP {
                g[c] = 2.0 * diff / count;
            }
        }
    }

    (loss / count, grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model(seed: u64) -> FlightTransformer {
        let mut rng = StdRng::seed_from_u64(seed);
        FlightTransformer::new(&Config::tiny(), &mut rng).unwrap()
    }

    #[test]
    fn test_parameter_count_matches_config() {
        let model = tiny_model(0);
        assert_eq!(model.num_scalars(), Config::tiny().num_parameters());
        assert_eq!(model.parameters().len(), 2 + 6 + 1);
    }

    #[test]
    fn test_validate_rejects_uneven_heads() {
        let mut config = Config::tiny();
        config.n_head = 3;
        assert!(config.validate().is_err());
        let mut rng = StdRng::seed_from_u64(0);
        assert!(FlightTransformer::new(&config, &mut rng).is_err());
    }

    #[test]
    fn test_model_output_is_causal() {
        let model = tiny_model(1);
        let mut rng = StdRng::seed_from_u64(2);
        let x = Tensor::randn(vec![6, 5], 1.0, &mut rng);
        let y = model.inference(&x);

        for t in 0..5 {
            let mut x2 = x.clone();
            for r in (t + 1)..6 {
                for v in x2.row_mut(r) {
                    *v = -*v * 2.0 + 0.3;
                }
            }
            let y2 = model.inference(&x2);
            for r in 0..=t {
                assert_eq!(y.row(r), y2.row(r));
            }
        }
    }

    #[test]
    fn test_clamped_mse_ignores_condition_columns() {
        let pred = Tensor::new(vec![1.0, 2.0], vec![1, 2]);
        let target = Tensor::new(vec![99.0, 1.0, 0.0], vec![1, 3]);
        let (loss, grad) = clamped_mse(&pred, &target, 1);
        assert!((loss - 2.0).abs() < 1e-12);
        assert_eq!(grad.data, vec![0.0, 2.0]);
    }

    #[test]
    fn test_clamped_mse_bounds_large_errors() {
        let pred = Tensor::new(vec![1e6], vec![1, 1]);
        let target = Tensor::new(vec![0.0], vec![1, 1]);
        let (loss, grad) = clamped_mse(&pred, &target, 0);
        assert_eq!(loss, LOSS_CLAMP * LOSS_CLAMP);
        assert_eq!(grad.data, vec![0.0]);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut model = tiny_model(5);
        let mut rng = StdRng::seed_from_u64(6);
        let x = Tensor::randn(vec![4, 5], 1.0, &mut rng);
        let target = Tensor::randn(vec![4, 5], 1.0, &mut rng);

        let loss_of = |m: &FlightTransformer| clamped_mse(&m.inference(&x), &target, 2).0;

        let (y, cache) = model.forward(&x);
        let (_, grad_out) = clamped_mse(&y, &target, 2);
        model.backward(&grad_out, &cache);
        let analytic = model.flat_grad();

        let h = 1e-6;
        for i in (0..model.num_scalars()).step_by(7) {
            let mut plus = model.clone();
            *plus.scalar_mut(i).unwrap() += h;
            let mut minus = model.clone();
            *minus.scalar_mut(i).unwrap() -= h;
            let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * h);
            assert!(
                (numeric - analytic[i]).abs() < 1e-6 + 1e-4 * numeric.abs(),
                "scalar {i}: numeric {numeric}, analytic {}",
                analytic[i]
            );
        }
    }
}
