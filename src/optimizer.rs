//! Adam Optimizer
//!
//! Adam with decoupled weight decay, operating on any [`Parameters`]
//! implementor. Moment estimates live next to the weights inside each
//! [`Param`](crate::tensor::Param), so the optimizer itself only holds
//! hyperparameters and the step counter.
//!
//! ## Algorithm
//!
//! For each parameter w with gradient g, at step t (starting at 1):
//!
//! ```text
//! m = β₁ m + (1 − β₁) g
//! v = β₂ v + (1 − β₂) g²
//! m̂ = m / (1 − β₁ᵗ)
//! v̂ = v / (1 − β₂ᵗ)
//! w = w (1 − α λ) − α m̂ / (√v̂ + ε)
//! ```
//!
//! Optionally the whole gradient is first rescaled so its global L2 norm is at
//! most `clip_norm`.
//!
//! Gradients are consumed: every `grad` buffer is zero after [`Adam::step`].
//!
//! ## References
//!
//! - Kingma & Ba (2014): "Adam: A Method for Stochastic Optimization"
//!   https://arxiv.org/abs/1412.6980
//! - Loshchilov & Hutter (2019): "Decoupled Weight Decay Regularization"
//!   https://arxiv.org/abs/1711.05101

use crate::gradients::clip_global_norm;
use crate::tensor::Parameters;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Tensors above this size are updated in parallel
const PARALLEL_THRESHOLD: usize = 1000;

/// Adam hyperparameters and step counter
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// Global-norm bound applied before the update
    pub clip_norm: Option<f64>,
    /// Completed steps
    pub t: u64,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            clip_norm: None,
            t: 0,
        }
    }
}

impl Adam {
    pub fn new(learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            learning_rate,
            weight_decay,
            ..Self::default()
        }
    }

    pub fn with_clip_norm(mut self, clip_norm: f64) -> Self {
        self.clip_norm = Some(clip_norm);
        self
    }

    /// Apply one update to every parameter and clear the gradients
    pub fn step<M: Parameters + ?Sized>(&mut self, model: &mut M) {
        if let Some(c) = self.clip_norm {
            let norm = clip_global_norm(model, c);
            if norm > c {
                debug!("clipped gradient norm {norm:.4} to {c}");
            }
        }

        self.t += 1;
        let t = i32::try_from(self.t).unwrap_or(i32::MAX);
        let lr = self.learning_rate;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let decay = 1.0 - lr * self.weight_decay;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);

        let update = |w: &mut f64, g: &mut f64, m: &mut f64, v: &mut f64| {
            *m = beta1 * *m + (1.0 - beta1) * *g;
            *v = beta2 * *v + (1.0 - beta2) * *g * *g;
            let m_hat = *m / bias_correction1;
            let v_hat = *v / bias_correction2;
            *w = *w * decay - lr * m_hat / (v_hat.sqrt() + epsilon);
            *g = 0.0;
        };

        for p in model.parameters_mut() {
            let w = &mut p.value.data;
            if w.len() > PARALLEL_THRESHOLD {
                w.par_iter_mut()
                    .zip(p.grad.par_iter_mut())
                    .zip(p.m.par_iter_mut().zip(p.v.par_iter_mut()))
                    .for_each(|((w, g), (m, v))| update(w, g, m, v));
            } else {
                for (((w, g), m), v) in w
                    .iter_mut()
                    .zip(p.grad.iter_mut())
                    .zip(p.m.iter_mut())
                    .zip(p.v.iter_mut())
                {
                    update(w, g, m, v);
                }
            }
        }
    }
}

/// Multiplicative learning-rate schedule driven by the running loss
///
/// Shrinks the rate when the loss rose since the last observation and grows it
/// otherwise, always staying within `[min, max]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdaptiveLearningRate {
    pub decrease: f64,
    pub increase: f64,
    pub min: f64,
    pub max: f64,
    #[serde(skip)]
    prev_loss: Option<f64>,
}

impl Default for AdaptiveLearningRate {
    fn default() -> Self {
        Self {
            decrease: 0.95,
            increase: 1.05,
            min: 1e-9,
            max: 1e-3,
            prev_loss: None,
        }
    }
}

impl AdaptiveLearningRate {
    /// Returns the adjusted learning rate for the next step
    pub fn adjust(&mut self, learning_rate: f64, loss: f64) -> f64 {
        let rose = self.prev_loss.is_some_and(|prev| loss > prev);
        self.prev_loss = Some(loss);
        let factor = if rose { self.decrease } else { self.increase };
        (learning_rate * factor).clamp(self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Param, Tensor};

    struct Scalar(Param);

    impl Parameters for Scalar {
        fn parameters(&self) -> Vec<&Param> {
            vec![&self.0]
        }
        fn parameters_mut(&mut self) -> Vec<&mut Param> {
            vec![&mut self.0]
        }
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let mut w = Scalar(Param::new(Tensor::new(vec![0.0], vec![1])));
        let mut adam = Adam::new(0.1, 0.0);

        for _ in 0..2000 {
            let x = w.0.value.data[0];
            w.0.grad[0] = 2.0 * (x - 3.0);
            adam.step(&mut w);
        }

        assert!((w.0.value.data[0] - 3.0).abs() < 0.01, "w = {}", w.0.value.data[0]);
        assert_eq!(adam.t, 2000);
    }

    #[test]
    fn test_step_clears_gradients() {
        let mut w = Scalar(Param::new(Tensor::new(vec![1.0, 2.0], vec![2])));
        w.0.grad = vec![0.5, -0.5];
        let mut adam = Adam::default();
        adam.step(&mut w);
        assert_eq!(w.0.grad, vec![0.0, 0.0]);
        assert_eq!(adam.t, 1);
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut w = Scalar(Param::new(Tensor::new(vec![1.0], vec![1])));
        w.0.grad = vec![4.0];
        let mut adam = Adam::new(0.01, 0.0);
        adam.step(&mut w);
        // m̂ = g, v̂ = g², so the first update is lr × sign(g)
        assert!((w.0.value.data[0] - 0.99).abs() < 1e-8);
    }

    #[test]
    fn test_step_counter_beyond_i32_range() {
        let mut w = Scalar(Param::new(Tensor::new(vec![1.0], vec![1])));
        w.0.m = vec![4.0];
        w.0.v = vec![16.0];
        w.0.grad = vec![4.0];
        let mut adam = Adam::new(0.01, 0.0);
        adam.t = i32::MAX as u64 + 5;
        adam.step(&mut w);
        // Bias corrections are 1 this late, so the update is lr × m / √v
        assert!((w.0.value.data[0] - 0.99).abs() < 1e-8, "w = {}", w.0.value.data[0]);
        assert_eq!(adam.t, i32::MAX as u64 + 6);
    }

    #[test]
    fn test_adaptive_learning_rate() {
        let mut sched = AdaptiveLearningRate::default();
        let lr = sched.adjust(1e-4, 1.0);
        assert!((lr - 1.05e-4).abs() < 1e-15);
        let lr = sched.adjust(lr, 2.0);
        assert!((lr - 1.05e-4 * 0.95).abs() < 1e-15);
        assert_eq!(sched.adjust(1e-3, 0.5), 1e-3);
        assert_eq!(sched.adjust(1e-9, 0.9), 1e-9);
    }
}
