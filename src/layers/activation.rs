//! Activation Functions
//!
//! ## GELU (Gaussian Error Linear Unit)
//!
//! Tanh approximation, used by the transformer feed-forward and the policy
//! network's hidden layer:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```

use crate::tensor::Tensor;
use rayon::prelude::*;

const GELU_COEFF: f64 = 0.044715;

#[inline]
fn sqrt_2_over_pi() -> f64 {
    (2.0 / std::f64::consts::PI).sqrt()
}

/// Scalar GELU
#[inline]
pub fn gelu(x: f64) -> f64 {
    0.5 * x * (1.0 + (sqrt_2_over_pi() * (x + GELU_COEFF * x.powi(3))).tanh())
}

/// Scalar GELU derivative
#[inline]
pub fn gelu_derivative(x: f64) -> f64 {
    let c = sqrt_2_over_pi();
    let tanh_inner = (c * (x + GELU_COEFF * x.powi(3))).tanh();
    let sech_sq = 1.0 - tanh_inner * tanh_inner;
    0.5 * (1.0 + tanh_inner) + 0.5 * x * sech_sq * c * (1.0 + 3.0 * GELU_COEFF * x * x)
}

/// GELU activation (forward pass)
///
/// Applied element-wise in parallel via Rayon.
pub fn gelu_forward(x: &Tensor) -> Tensor {
    let result = x.data.par_iter().map(|&val| gelu(val)).collect();
    Tensor::new(result, x.shape.clone())
}

/// GELU activation derivative (backward pass)
///
/// # Arguments
///
/// * `grad_out` - Gradient from next layer
/// * `x` - Pre-activation input saved by the forward pass
///
/// # Returns
///
/// `grad_out * GELU'(x)`
pub fn gelu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let grad_data: Vec<f64> = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &grad_val)| grad_val * gelu_derivative(x_val))
        .collect();

    Tensor::new(grad_data, x.shape.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gelu_known_values() {
        assert_eq!(gelu(0.0), 0.0);
        assert!((gelu(1.0) - 0.841192).abs() < 1e-5);
        assert!((gelu(-1.0) + 0.158808).abs() < 1e-5);
    }

    #[test]
    fn test_gelu_derivative_matches_central_difference() {
        let h = 1e-6;
        for &x in &[-3.0, -0.7, 0.0, 0.4, 2.5] {
            let numeric = (gelu(x + h) - gelu(x - h)) / (2.0 * h);
            assert!((numeric - gelu_derivative(x)).abs() < 1e-6, "x = {x}");
        }
    }
}
