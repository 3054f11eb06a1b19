//! Gaussian Rotor Policy
//!
//! The policy network maps a sensor state to 8 raw outputs: 4 mean logits
//! followed by 4 spread logits, one pair per rotor. A [`Reparam`] turns each
//! pair into a bounded `(mean, std)` and differentiates the REINFORCE loss back
//! through that mapping.
//!
//! ## Per-rotor loss
//!
//! ```text
//! z        = (a − μ) / σ
//! log π(a) = −½ (ln 2π + 2 ln σ + z²)
//! H        = ½ (ln 2πe + 2 ln σ)
//! L        = −(G log π(a) + α H)
//!
//! ∂L/∂μ = −G z / σ
//! ∂L/∂σ = −G (z² − 1) / σ − α / σ
//! ```
//!
//! The raw-output gradient chains these through the reparameterisation.

use crate::error::{invalid_config, Result};
use crate::layers::{gelu_backward, gelu_forward, Linear};
use crate::sim::{OMEGA_MAX, OMEGA_MIN, ROTORS};
use crate::tensor::{Param, Parameters, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::{E, PI};

/// Sensor state: 3 accelerometer + 3 gyro readings
pub const STATE_DIM: usize = 6;
/// Raw policy outputs: 4 means then 4 spreads
pub const ACTION_DIM: usize = 2 * ROTORS;

pub const MAX_STD: f64 = 3.0;
pub const MIN_STD: f64 = 1e-5;
pub const MAX_MEAN: f64 = OMEGA_MAX - 4.0 * MAX_STD;
pub const MIN_MEAN: f64 = OMEGA_MIN + 4.0 * MAX_STD;

const LOGVAR_MIN: f64 = -4.6;
const LOGVAR_SPAN: f64 = 6.0;

/// Map `x` into `(lo, hi)` through tanh
pub fn squash(x: f64, lo: f64, hi: f64) -> f64 {
    (hi + lo) / 2.0 + (hi - lo) / 2.0 * x.tanh()
}

/// Derivative of [`squash`] with respect to `x`
pub fn dsquash(x: f64, lo: f64, hi: f64) -> f64 {
    let t = x.tanh();
    (hi - lo) / 2.0 * (1.0 - t * t)
}

/// How raw outputs become a mean and standard deviation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reparam {
    /// Mean in `[MIN_MEAN, MAX_MEAN]`, std in `[MIN_STD, MAX_STD]`
    #[default]
    FixedBounds,
    /// Std as in `FixedBounds`; mean in `[OMEGA_MIN + 4σ, OMEGA_MAX − 4σ]`
    DynamicBounds,
    /// `logvar = −4.6 + 3 (tanh b + 1)`, `σ = exp(½ logvar)`; mean as in `FixedBounds`
    LogVariance,
}

/// Per-rotor action distribution
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gaussian {
    pub mean: f64,
    pub std: f64,
}

impl Gaussian {
    pub fn log_prob(&self, action: f64) -> f64 {
        let z = (action - self.mean) / self.std;
        -0.5 * ((2.0 * PI).ln() + 2.0 * self.std.ln() + z * z)
    }

    pub fn entropy(&self) -> f64 {
        0.5 * ((2.0 * PI * E).ln() + 2.0 * self.std.ln())
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.mean + self.std * box_muller(rng)
    }
}

/// One standard normal draw via Box-Muller
///
/// `u1` is taken from `(0, 1]` so the logarithm stays finite.
pub fn box_muller<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1 = 1.0 - rng.random::<f64>();
    let u2 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn dynamic_mean_bounds(std: f64) -> (f64, f64) {
    (OMEGA_MIN + 4.0 * std, OMEGA_MAX - 4.0 * std)
}

impl Reparam {
    fn std(self, std_raw: f64) -> f64 {
        match self {
            Reparam::FixedBounds | Reparam::DynamicBounds => squash(std_raw, MIN_STD, MAX_STD),
            Reparam::LogVariance => {
                let logvar = LOGVAR_MIN + LOGVAR_SPAN * 0.5 * (std_raw.tanh() + 1.0);
                (0.5 * logvar).exp()
            }
        }
    }

    /// Distribution for one rotor from its raw mean and spread outputs
    pub fn gaussian(self, mean_raw: f64, std_raw: f64) -> Gaussian {
        let std = self.std(std_raw);
        let mean = match self {
            Reparam::DynamicBounds => {
                let (lo, hi) = dynamic_mean_bounds(std);
                squash(mean_raw, lo, hi)
            }
            Reparam::FixedBounds | Reparam::LogVariance => squash(mean_raw, MIN_MEAN, MAX_MEAN),
        };
        Gaussian { mean, std }
    }

    /// Distributions for all rotors from a full raw output row
    pub fn distributions(self, raw: &[f64]) -> [Gaussian; ROTORS] {
        std::array::from_fn(|i| self.gaussian(raw[i], raw[i + ROTORS]))
    }

    /// Gradient of `L = −(G log π(a) + α H)` with respect to the raw outputs
    ///
    /// `raw` holds 4 mean logits then 4 spread logits; the result uses the
    /// same layout.
    pub fn output_gradient(
        self,
        raw: &[f64],
        actions: &[f64],
        ret: f64,
        entropy_coeff: f64,
    ) -> [f64; ACTION_DIM] {
        let mut grad = [0.0; ACTION_DIM];

        for i in 0..ROTORS {
            let (m_raw, s_raw) = (raw[i], raw[i + ROTORS]);
            let dist = self.gaussian(m_raw, s_raw);
            let std = dist.std;
            let z = (actions[i] - dist.mean) / std;

            let (mean_grad, std_grad) = match self {
                Reparam::FixedBounds => (
                    -ret * (z / std) * dsquash(m_raw, MIN_MEAN, MAX_MEAN),
                    -(ret * (z * z - 1.0) / std + entropy_coeff / std)
                        * dsquash(s_raw, MIN_STD, MAX_STD),
                ),
                Reparam::DynamicBounds => {
                    let (lo, hi) = dynamic_mean_bounds(std);
                    let dmean_dstd = -4.0 * m_raw.tanh();
                    let dl_dstd = -ret * ((z * z - 1.0) / std + (z / std) * dmean_dstd)
                        - entropy_coeff / std;
                    (
                        -ret * (z / std) * dsquash(m_raw, lo, hi),
                        dl_dstd * dsquash(s_raw, MIN_STD, MAX_STD),
                    )
                }
                Reparam::LogVariance => {
                    let t = s_raw.tanh();
                    (
                        -ret * (z / std) * dsquash(m_raw, MIN_MEAN, MAX_MEAN),
                        -(ret * (z * z - 1.0) + entropy_coeff) * 1.5 * (1.0 - t * t),
                    )
                }
            };

            grad[i] = mean_grad;
            grad[i + ROTORS] = std_grad;
        }

        grad
    }
}

/// Fully connected policy network with GELU hidden layers
#[derive(Clone, Debug)]
pub struct PolicyNet {
    pub layers: Vec<Linear>,
}

/// Inputs and pre-activations of every layer
#[derive(Clone, Debug)]
pub struct PolicyCache {
    inputs: Vec<Tensor>,
    pre_activations: Vec<Tensor>,
}

impl PolicyNet {
    /// Build a network with layer widths `sizes`, e.g. `[6, 64, 8]`
    ///
    /// Weights use He initialization, biases start at zero.
    pub fn new<R: Rng + ?Sized>(sizes: &[usize], rng: &mut R) -> Result<Self> {
        if sizes.len() < 2 {
            return Err(invalid_config("policy needs at least an input and an output layer"));
        }
        if sizes[0] != STATE_DIM || sizes[sizes.len() - 1] != ACTION_DIM {
            return Err(invalid_config(format!(
                "policy layers must map {STATE_DIM} inputs to {ACTION_DIM} outputs, got {sizes:?}"
            )));
        }
        if sizes.contains(&0) {
            return Err(invalid_config("policy layer widths must be non-zero"));
        }

        let layers = sizes
            .windows(2)
            .map(|w| Linear::new(w[0], w[1], (2.0 / w[0] as f64).sqrt(), true, rng))
            .collect();
        Ok(Self { layers })
    }

    /// Layer widths, input first
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.layers[0].in_features()];
        sizes.extend(self.layers.iter().map(|l| l.out_features()));
        sizes
    }

    /// Forward a batch of states `[batch, STATE_DIM]` to raw outputs `[batch, ACTION_DIM]`
    pub fn forward(&self, states: &Tensor) -> (Tensor, PolicyCache) {
        let last = self.layers.len() - 1;
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre_activations = Vec::with_capacity(last);
        let mut x = states.clone();

        for (i, layer) in self.layers.iter().enumerate() {
            let u = layer.forward(&x);
            inputs.push(x);
            if i < last {
                x = gelu_forward(&u);
                pre_activations.push(u);
            } else {
                x = u;
            }
        }

        let cache = PolicyCache {
            inputs,
            pre_activations,
        };
        (x, cache)
    }

    /// Raw outputs for a single state
    pub fn act(&self, state: &[f64]) -> Vec<f64> {
        let x = Tensor::new(state.to_vec(), vec![1, state.len()]);
        self.forward(&x).0.data
    }

    /// Accumulate parameter gradients given `∂L/∂raw_outputs`
    pub fn backward(&mut self, grad_out: &Tensor, cache: &PolicyCache) {
        let mut grad = grad_out.clone();
        for i in (0..self.layers.len()).rev() {
            if i < self.layers.len() - 1 {
                grad = gelu_backward(&grad, &cache.pre_activations[i]);
            }
            grad = self.layers[i].backward(&grad, &cache.inputs[i]);
        }
    }
}

impl Parameters for PolicyNet {
    /// Per layer: weight then bias
    fn parameters(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.params()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::Adam;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const ALL: [Reparam; 3] = [
        Reparam::FixedBounds,
        Reparam::DynamicBounds,
        Reparam::LogVariance,
    ];

    #[test]
    fn test_dsquash_matches_central_difference() {
        let h = 1e-6;
        for &(lo, hi) in &[(MIN_MEAN, MAX_MEAN), (MIN_STD, MAX_STD), (-1.0, 1.0)] {
            for &x in &[-2.5, -0.3, 0.0, 0.8, 3.0] {
                let numeric = (squash(x + h, lo, hi) - squash(x - h, lo, hi)) / (2.0 * h);
                assert!((numeric - dsquash(x, lo, hi)).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_squash_stays_in_bounds() {
        for &x in &[-50.0, -1.0, 0.0, 1.0, 50.0] {
            let y = squash(x, MIN_STD, MAX_STD);
            assert!((MIN_STD..=MAX_STD).contains(&y));
        }
    }

    #[test]
    fn test_box_muller_is_finite_and_centered() {
        let mut rng = StdRng::seed_from_u64(31);
        let samples: Vec<f64> = (0..20_000).map(|_| box_muller(&mut rng)).collect();
        assert!(samples.iter().all(|s| s.is_finite()));
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
    }

    #[test]
    fn test_dynamic_mean_leaves_room_for_spread() {
        for &(m, s) in &[(10.0, 10.0), (-10.0, 10.0), (3.0, -1.0)] {
            let g = Reparam::DynamicBounds.gaussian(m, s);
            assert!(g.mean - 4.0 * g.std >= OMEGA_MIN - 1e-9);
            assert!(g.mean + 4.0 * g.std <= OMEGA_MAX + 1e-9);
        }
    }

    #[test]
    fn test_log_variance_range() {
        let lo = Reparam::LogVariance.gaussian(0.0, -30.0).std;
        let hi = Reparam::LogVariance.gaussian(0.0, 30.0).std;
        assert!((lo - (0.5 * -4.6f64).exp()).abs() < 1e-9);
        assert!((hi - (0.5 * 1.4f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn test_output_gradient_matches_finite_difference() {
        let raw = [0.3, -0.7, 1.1, 0.0, -0.4, 0.9, 0.2, -1.3];
        let actions = [49.0, 47.5, 55.0, 50.2];
        let (ret, alpha) = (1.7, 0.05);

        for reparam in ALL {
            let loss = |r: &[f64]| -> f64 {
                reparam
                    .distributions(r)
                    .iter()
                    .zip(&actions)
                    .map(|(d, &a)| -(ret * d.log_prob(a) + alpha * d.entropy()))
                    .sum()
            };

            let analytic = reparam.output_gradient(&raw, &actions, ret, alpha);
            let h = 1e-6;
            for i in 0..ACTION_DIM {
                let mut plus = raw;
                plus[i] += h;
                let mut minus = raw;
                minus[i] -= h;
                let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
                assert!(
                    (numeric - analytic[i]).abs() < 1e-4 * (1.0 + numeric.abs()),
                    "{reparam:?} output {i}: numeric {numeric}, analytic {}",
                    analytic[i]
                );
            }
        }
    }

    #[test]
    fn test_policy_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(32);
        let mut net = PolicyNet::new(&[STATE_DIM, 5, ACTION_DIM], &mut rng).unwrap();
        let states = Tensor::randn(vec![3, STATE_DIM], 1.0, &mut rng);
        let w = Tensor::randn(vec![3, ACTION_DIM], 1.0, &mut rng);

        let loss = |n: &PolicyNet| -> f64 {
            let (y, _) = n.forward(&states);
            y.data.iter().zip(&w.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = net.forward(&states);
        net.backward(&w, &cache);
        let analytic = net.flat_grad();

        let h = 1e-6;
        for i in 0..net.num_scalars() {
            let mut plus = net.clone();
            *plus.scalar_mut(i).unwrap() += h;
            let mut minus = net.clone();
            *minus.scalar_mut(i).unwrap() -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert!((numeric - analytic[i]).abs() < 1e-6, "scalar {i}");
        }
    }

    #[test]
    fn test_positive_return_increases_log_prob() {
        for reparam in ALL {
            let mut rng = StdRng::seed_from_u64(33);
            let mut net = PolicyNet::new(&[STATE_DIM, 16, ACTION_DIM], &mut rng).unwrap();
            let state = [0.1, -0.2, 9.8, 0.01, 0.0, -0.03];

            let raw = net.act(&state);
            let dists = reparam.distributions(&raw);
            let actions: Vec<f64> = dists.iter().map(|d| d.sample(&mut rng)).collect();
            let before: f64 = dists.iter().zip(&actions).map(|(d, &a)| d.log_prob(a)).sum();

            let grad = reparam.output_gradient(&raw, &actions, 1.0, 0.0);
            let x = Tensor::new(state.to_vec(), vec![1, STATE_DIM]);
            let (_, cache) = net.forward(&x);
            net.backward(&Tensor::new(grad.to_vec(), vec![1, ACTION_DIM]), &cache);
            Adam::new(1e-4, 0.0).step(&mut net);

            let after: f64 = reparam
                .distributions(&net.act(&state))
                .iter()
                .zip(&actions)
                .map(|(d, &a)| d.log_prob(a))
                .sum();
            assert!(after > before, "{reparam:?}: {before} -> {after}");
        }
    }

    #[test]
    fn test_rejects_wrong_output_width() {
        let mut rng = StdRng::seed_from_u64(34);
        assert!(PolicyNet::new(&[STATE_DIM, 8, 4], &mut rng).is_err());
        assert!(PolicyNet::new(&[STATE_DIM], &mut rng).is_err());
    }
}
