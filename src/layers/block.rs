//! Transformer Block
//!
//! ```text
//! x → RMSNorm → Attention → (+) → RMSNorm → FeedForward → (+) → output
//! │                          ↑                              ↑
//! └──────────────────────────┘                              │
//!                            └──────────────────────────────┘
//! ```
//!
//! Pre-norm residual block. At each residual the gradient splits into the
//! sublayer path and the skip path, and the two are summed on the way back.

use super::attention::{AttentionCache, MultiHeadAttention};
use super::feed_forward::{FeedForward, FeedForwardCache};
use super::rms_norm::{rms_norm_backward, rms_norm_forward, RmsNormCache};
use crate::tensor::{Param, Tensor};
use rand::Rng;

#[derive(Clone, Debug)]
pub struct TransformerBlock {
    pub attn: MultiHeadAttention,
    pub ffn: FeedForward,
}

#[derive(Clone, Debug)]
pub struct BlockCache {
    pub norm1: RmsNormCache,
    pub attn: AttentionCache,
    pub norm2: RmsNormCache,
    pub ffn: FeedForwardCache,
}

impl TransformerBlock {
    pub fn new<R: Rng + ?Sized>(d_model: usize, n_head: usize, scale: f64, rng: &mut R) -> Self {
        Self {
            attn: MultiHeadAttention::new(d_model, n_head, scale, rng),
            ffn: FeedForward::new(d_model, scale, rng),
        }
    }

    /// Forward pass: `x += Attn(RMSNorm(x)); x += FFN(RMSNorm(x))`
    pub fn forward(&self, x: &Tensor) -> (Tensor, BlockCache) {
        let (n1, norm1) = rms_norm_forward(x);
        let (attn_out, attn) = self.attn.forward(&n1);
        let mut h = x.add(&attn_out);

        let (n2, norm2) = rms_norm_forward(&h);
        let (ffn_out, ffn) = self.ffn.forward(&n2);
        h.add_assign(&ffn_out);

        let cache = BlockCache {
            norm1,
            attn,
            norm2,
            ffn,
        };
        (h, cache)
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &BlockCache) -> Tensor {
        // Second residual: skip path plus feed-forward path
        let grad_n2 = self.ffn.backward(grad_out, &cache.ffn);
        let mut grad_h = grad_out.add(&rms_norm_backward(&grad_n2, &cache.norm2));

        // First residual
        let grad_n1 = self.attn.backward(&grad_h, &cache.attn);
        grad_h.add_assign(&rms_norm_backward(&grad_n1, &cache.norm1));
        grad_h
    }

    /// `Wq, Wk, Wv, Wo, Wff1, Wff2`
    pub fn params(&self) -> Vec<&Param> {
        let mut out = self.attn.params();
        out.extend(self.ffn.params());
        out
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut out = self.attn.params_mut();
        out.extend(self.ffn.params_mut());
        out
    }
}
