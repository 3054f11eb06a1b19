//! Linear Layer (Fully Connected)
//!
//! Affine map `y = x @ W (+ b)`. The transformer's projections carry no bias;
//! the policy network's layers do.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! Parameter gradients are added into each [`Param`]'s `grad` buffer, so
//! several backward calls before an optimizer step sum their contributions.

use crate::tensor::{Param, Tensor};
use rand::Rng;

/// Linear layer
///
/// - `weight`: `[in_features, out_features]`
/// - `bias`: `[out_features]` when present
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Param,
    pub bias: Option<Param>,
}

impl Linear {
    /// Create a layer with weights drawn from `N(0, 1) * scale` and a zero bias
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        scale: f64,
        with_bias: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: Param::randn(vec![in_features, out_features], scale, rng),
            bias: with_bias.then(|| Param::zeros(vec![out_features])),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.value.shape[1]
    }

    /// Forward pass; the caller keeps `x` for the backward pass
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let mut y = x.matmul(&self.weight.value);
        if let Some(bias) = &self.bias {
            let cols = y.cols();
            for row in y.data.chunks_mut(cols) {
                for (v, b) in row.iter_mut().zip(&bias.value.data) {
                    *v += b;
                }
            }
        }
        y
    }

    /// Backward pass
    ///
    /// Accumulates weight and bias gradients and returns the gradient with
    /// respect to `x`.
    pub fn backward(&mut self, grad_out: &Tensor, x: &Tensor) -> Tensor {
        let grad_weight = x.transpose().matmul(grad_out);
        self.weight.accumulate(&grad_weight);

        if let Some(bias) = &mut self.bias {
            let cols = grad_out.cols();
            for row in grad_out.data.chunks(cols) {
                bias.accumulate_at(0, row);
            }
        }

        grad_out.matmul(&self.weight.value.transpose())
    }

    pub fn params(&self) -> Vec<&Param> {
        let mut out = vec![&self.weight];
        out.extend(self.bias.as_ref());
        out
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut out = vec![&mut self.weight];
        out.extend(self.bias.as_mut());
        out
    }
}
