//! Root-Mean-Square Normalization
//!
//! ```text
//! scale = 1 / sqrt(mean(x²) + ε)
//! y     = x × scale
//! ```
//!
//! There are no learned parameters. Rows are independent and are processed in
//! parallel.
//!
//! The backward pass for a row with scale `s` and width `D`:
//!
//! ```text
//! dx_j = s × g_j − x_j × s³ / D × Σ_i g_i x_i
//! ```

use crate::tensor::Tensor;
use rayon::prelude::*;

pub const RMS_EPS: f64 = 1e-5;

/// Values needed by [`rms_norm_backward`]
#[derive(Clone, Debug)]
pub struct RmsNormCache {
    pub x: Tensor,
    /// One scale per row
    pub scale: Vec<f64>,
}

pub fn rms_norm_forward(x: &Tensor) -> (Tensor, RmsNormCache) {
    let d = x.cols();
    let mut y = vec![0.0; x.len()];
    let mut scale = vec![0.0; x.rows()];

    y.par_chunks_mut(d)
        .zip(x.data.par_chunks(d))
        .zip(scale.par_iter_mut())
        .for_each(|((y_row, x_row), s)| {
            let ms = x_row.iter().map(|v| v * v).sum::<f64>() / d as f64;
            *s = 1.0 / (ms + RMS_EPS).sqrt();
            for (yo, xi) in y_row.iter_mut().zip(x_row) {
                *yo = xi * *s;
            }
        });

    let cache = RmsNormCache {
        x: x.clone(),
        scale,
    };
    (Tensor::new(y, x.shape.clone()), cache)
}

pub fn rms_norm_backward(grad_out: &Tensor, cache: &RmsNormCache) -> Tensor {
    let d = cache.x.cols();
    let mut dx = vec![0.0; cache.x.len()];

    dx.par_chunks_mut(d)
        .zip(cache.x.data.par_chunks(d))
        .zip(grad_out.data.par_chunks(d))
        .zip(cache.scale.par_iter())
        .for_each(|(((dx_row, x_row), g_row), &s)| {
            let dot: f64 = g_row.iter().zip(x_row).map(|(g, x)| g * x).sum();
            let k = s * s * s / d as f64 * dot;
            for ((o, g), x) in dx_row.iter_mut().zip(g_row).zip(x_row) {
                *o = s * g - x * k;
            }
        });

    Tensor::new(dx, cache.x.shape.clone())
}
