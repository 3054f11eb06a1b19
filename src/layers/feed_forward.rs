//! Feed-Forward Network
//!
//! ```text
//! x → W1 → GELU → W2 → y
//! ```
//!
//! Hidden width is `4 × d_model`, with no biases. The pre-activation `u` is kept
//! for the backward pass.

use super::activation::{gelu_backward, gelu_forward};
use super::linear::Linear;
use crate::tensor::{Param, Tensor};
use rand::Rng;

#[derive(Clone, Debug)]
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
}

#[derive(Clone, Debug)]
pub struct FeedForwardCache {
    pub x: Tensor,
    /// Pre-activation `x @ W1`
    pub u: Tensor,
    /// `GELU(u)`
    pub h: Tensor,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(d_model: usize, scale: f64, rng: &mut R) -> Self {
        let hidden = d_model * 4;
        Self {
            fc1: Linear::new(d_model, hidden, scale, false, rng),
            fc2: Linear::new(hidden, d_model, scale, false, rng),
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, FeedForwardCache) {
        let u = self.fc1.forward(x);
        let h = gelu_forward(&u);
        let y = self.fc2.forward(&h);
        let cache = FeedForwardCache {
            x: x.clone(),
            u,
            h,
        };
        (y, cache)
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &FeedForwardCache) -> Tensor {
        let grad_h = self.fc2.backward(grad_out, &cache.h);
        let grad_u = gelu_backward(&grad_h, &cache.u);
        self.fc1.backward(&grad_u, &cache.x)
    }

    /// `Wff1` then `Wff2`
    pub fn params(&self) -> Vec<&Param> {
        vec![&self.fc1.weight, &self.fc2.weight]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.fc1.weight, &mut self.fc2.weight]
    }
}
