//! Input Embedding
//!
//! Each input row is laid out `[cond_features | seq_features]`. The two bands
//! are projected separately and summed:
//!
//! ```text
//! hidden = seq @ W_seq + cond @ W_cond
//! ```
//!
//! No positional embedding is added; attention carries position through its
//! ALiBi bias.

use super::linear::Linear;
use crate::tensor::{Param, Tensor};
use rand::Rng;

#[derive(Clone, Debug)]
pub struct Embedding {
    pub seq: Linear,
    pub cond: Linear,
}

#[derive(Clone, Debug)]
pub struct EmbeddingCache {
    pub seq_in: Tensor,
    pub cond_in: Tensor,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(
        cond_features: usize,
        seq_features: usize,
        d_model: usize,
        scale: f64,
        rng: &mut R,
    ) -> Self {
        Self {
            seq: Linear::new(seq_features, d_model, scale, false, rng),
            cond: Linear::new(cond_features, d_model, scale, false, rng),
        }
    }

    pub fn cond_features(&self) -> usize {
        self.cond.in_features()
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, EmbeddingCache) {
        let nc = self.cond_features();
        let ns = self.seq.in_features();
        assert_eq!(
            x.cols(),
            nc + ns,
            "Embedding expects {} input columns, got {}",
            nc + ns,
            x.cols()
        );

        let cond_in = x.columns(0, nc);
        let seq_in = x.columns(nc, ns);
        let mut hidden = self.seq.forward(&seq_in);
        hidden.add_assign(&self.cond.forward(&cond_in));

        (hidden, EmbeddingCache { seq_in, cond_in })
    }

    /// Accumulates both projection gradients; the input is data, so no
    /// gradient flows further back.
    pub fn backward(&mut self, grad_out: &Tensor, cache: &EmbeddingCache) {
        self.seq.backward(grad_out, &cache.seq_in);
        self.cond.backward(grad_out, &cache.cond_in);
    }

    /// `W_seq` then `W_cond`
    pub fn params(&self) -> Vec<&Param> {
        vec![&self.seq.weight, &self.cond.weight]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.seq.weight, &mut self.cond.weight]
    }
}
