//! Gradient Utilities
//!
//! Norms, clipping, and the finite-difference gradient estimator.
//!
//! ## Clipping
//!
//! Two kinds of clipping are applied before an optimizer step:
//!
//! ```text
//! global:       norm = √(Σ g²); if norm > C { g *= C / norm }
//! element-wise: g = clamp(g, −c, c)
//! ```
//!
//! Global clipping preserves direction; element-wise clipping bounds every
//! coordinate. The supervised trainer uses both, the policy trainer only the
//! element-wise form.
//!
//! ## Finite Differences
//!
//! ```text
//! g_i = (L(w + ε e_i) − L(w)) / ε
//! ```
//!
//! One full forward evaluation per scalar. Two estimators are provided:
//!
//! - [`finite_difference_serial`] perturbs the shared model one scalar at a time
//! - [`finite_difference_parallel`] hands each Rayon task a private clone of the
//!   model and a disjoint slice of the output
//!
//! Both restore the exact original value after each evaluation, so they return
//! identical results.
//!
//! ## Example
//!
//! ```rust
//! use flightnet::gradients::{clip_elementwise, grad_norm};
//! use flightnet::{Param, Parameters, Tensor};
//!
//! struct One(Param);
//! impl Parameters for One {
//!     fn parameters(&self) -> Vec<&Param> { vec![&self.0] }
//!     fn parameters_mut(&mut self) -> Vec<&mut Param> { vec![&mut self.0] }
//! }
//!
//! let mut m = One(Param::zeros(vec![2]));
//! m.0.grad = vec![3.0, -4.0];
//! assert_eq!(grad_norm(&m), 5.0);
//! clip_elementwise(&mut m, 1.0);
//! assert_eq!(m.0.grad, vec![1.0, -1.0]);
//! ```

use crate::tensor::Parameters;
use rayon::prelude::*;

/// Scalars per parallel finite-difference task
const FD_CHUNK: usize = 64;

/// L2 norm of every gradient in the model
pub fn grad_norm<M: Parameters + ?Sized>(model: &M) -> f64 {
    model
        .parameters()
        .iter()
        .map(|p| p.grad.par_iter().map(|&g| g * g).sum::<f64>())
        .sum::<f64>()
        .sqrt()
}

/// Scale all gradients so their global norm is at most `max_norm`
///
/// Returns the norm before clipping.
pub fn clip_global_norm<M: Parameters + ?Sized>(model: &mut M, max_norm: f64) -> f64 {
    let norm = grad_norm(model);
    if norm > max_norm {
        let scale = max_norm / norm;
        for p in model.parameters_mut() {
            p.grad.par_iter_mut().for_each(|g| *g *= scale);
        }
    }
    norm
}

/// Clamp every gradient coordinate into `[-limit, limit]`
pub fn clip_elementwise<M: Parameters + ?Sized>(model: &mut M, limit: f64) {
    for p in model.parameters_mut() {
        p.grad
            .par_iter_mut()
            .for_each(|g| *g = g.clamp(-limit, limit));
    }
}

/// Add a flat gradient vector (in parameter order) into the model's buffers
///
/// # Panics
///
/// Panics if `flat` does not have one entry per scalar parameter
pub fn accumulate_flat<M: Parameters + ?Sized>(model: &mut M, flat: &[f64]) {
    assert_eq!(
        flat.len(),
        model.num_scalars(),
        "Flat gradient length mismatch"
    );
    let mut offset = 0;
    for p in model.parameters_mut() {
        let n = p.len();
        p.accumulate_at(0, &flat[offset..offset + n]);
        offset += n;
    }
}

/// Forward-difference gradient, one scalar at a time on the shared model
pub fn finite_difference_serial<M, F>(model: &mut M, loss: F, epsilon: f64) -> Vec<f64>
where
    M: Parameters,
    F: Fn(&M) -> f64,
{
    let base = loss(model);
    let n = model.num_scalars();
    let mut grads = vec![0.0; n];

    for (i, g) in grads.iter_mut().enumerate() {
        *g = perturbed_slope(model, &loss, i, base, epsilon);
    }
    grads
}

/// Forward-difference gradient fanned out over Rayon
///
/// Every task clones the model once and only ever perturbs its own copy.
pub fn finite_difference_parallel<M, F>(model: &M, loss: F, epsilon: f64) -> Vec<f64>
where
    M: Parameters + Clone + Sync,
    F: Fn(&M) -> f64 + Sync,
{
    let base = loss(model);
    let n = model.num_scalars();
    let mut grads = vec![0.0; n];

    grads
        .par_chunks_mut(FD_CHUNK)
        .enumerate()
        .for_each(|(chunk, out)| {
            let mut snapshot = model.clone();
            for (k, g) in out.iter_mut().enumerate() {
                *g = perturbed_slope(&mut snapshot, &loss, chunk * FD_CHUNK + k, base, epsilon);
            }
        });
    grads
}

fn perturbed_slope<M, F>(model: &mut M, loss: &F, index: usize, base: f64, epsilon: f64) -> f64
where
    M: Parameters,
    F: Fn(&M) -> f64,
{
    let original = match model.scalar_mut(index) {
        Some(w) => {
            let original = *w;
            *w = original + epsilon;
            original
        }
        None => return 0.0,
    };

    let perturbed = loss(model);

    if let Some(w) = model.scalar_mut(index) {
        *w = original;
    }
    (perturbed - base) / epsilon
}
