//! Causal Multi-Head Attention with ALiBi
//!
//! ```text
//! Q_h, K_h, V_h = x @ Wq_h, x @ Wk_h, x @ Wv_h
//! score(i, j)   = Q_h[i]·K_h[j] / √d_head − m_h × (i − j)      (j ≤ i)
//! p(i, ·)       = softmax(score(i, ·))
//! A_h[i]        = Σ_{j ≤ i} p(i, j) V_h[j]
//! output        = concat_h(A_h) @ Wo
//! ```
//!
//! Positions `j > i` are never scored, so row `i` of the output depends only on
//! input rows `0..=i`. Instead of a positional embedding each head adds a linear
//! distance penalty with slope `m_h = 2^(−8(h+1)/n_head)`.
//!
//! Per-head projection weights live in one parameter of shape
//! `[n_head, d_model, d_head]`, one contiguous `d_model × d_head` block per head.
//!
//! ## Backward Pass
//!
//! ```text
//! dV[j]   = Σ_{i ≥ j} p(i, j) dA[i]
//! dP(i,j) = dA[i]·V[j]
//! dS(i,j) = p(i,j) (dP(i,j) − Σ_k p(i,k) dP(i,k))
//! dQ[i]   = scale Σ_j dS(i,j) K[j]
//! dK[j]   = scale Σ_i dS(i,j) Q[i]
//! ```
//!
//! Heads run in parallel in both directions. Each head returns its own weight
//! and input gradients, which are summed in head order afterwards so the result
//! does not depend on scheduling.

use super::linear::Linear;
use crate::tensor::{Param, Tensor};
use rand::Rng;
use rayon::prelude::*;

/// Added to every softmax denominator
pub const SOFTMAX_EPS: f64 = 1e-10;

/// ALiBi slope for head `h` of `n_head`
pub fn alibi_slope(h: usize, n_head: usize) -> f64 {
    2f64.powf(-8.0 * (h as f64 + 1.0) / n_head as f64)
}

/// Causal softmax over ALiBi-biased scores
///
/// Returns a `[seq, seq]` matrix whose entries above the diagonal are zero.
pub fn causal_alibi_softmax(q: &Tensor, k: &Tensor, scale: f64, slope: f64) -> Tensor {
    let seq = q.rows();
    let mut p = vec![0.0; seq * seq];

    for i in 0..seq {
        let row = &mut p[i * seq..i * seq + i + 1];
        let qi = q.row(i);
        for (j, s) in row.iter_mut().enumerate() {
            let dot: f64 = qi.iter().zip(k.row(j)).map(|(a, b)| a * b).sum();
            *s = dot * scale - slope * (i - j) as f64;
        }

        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0;
        for s in row.iter_mut() {
            *s = (*s - max).exp();
            sum += *s;
        }
        let denom = sum + SOFTMAX_EPS;
        for s in row.iter_mut() {
            *s /= denom;
        }
    }

    Tensor::new(p, vec![seq, seq])
}

/// Multi-head self-attention
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    pub wq: Param,
    pub wk: Param,
    pub wv: Param,
    pub wo: Linear,
    pub n_head: usize,
}

/// Per-head intermediates
#[derive(Clone, Debug)]
pub struct HeadCache {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Attention probabilities `[seq, seq]`
    pub p: Tensor,
}

#[derive(Clone, Debug)]
pub struct AttentionCache {
    pub x: Tensor,
    pub heads: Vec<HeadCache>,
    /// Concatenated head outputs, input to `Wo`
    pub concat: Tensor,
}

struct HeadGradients {
    wq: Tensor,
    wk: Tensor,
    wv: Tensor,
    x: Tensor,
}

impl MultiHeadAttention {
    /// # Panics
    ///
    /// Panics if `d_model` is not divisible by `n_head`
    pub fn new<R: Rng + ?Sized>(d_model: usize, n_head: usize, scale: f64, rng: &mut R) -> Self {
        assert!(
            n_head > 0 && d_model % n_head == 0,
            "d_model ({d_model}) must be a multiple of n_head ({n_head})"
        );
        let d_head = d_model / n_head;
        Self {
            wq: Param::randn(vec![n_head, d_model, d_head], scale, rng),
            wk: Param::randn(vec![n_head, d_model, d_head], scale, rng),
            wv: Param::randn(vec![n_head, d_model, d_head], scale, rng),
            wo: Linear::new(d_model, d_model, scale, false, rng),
            n_head,
        }
    }

    pub fn d_model(&self) -> usize {
        self.wq.value.shape[1]
    }

    pub fn d_head(&self) -> usize {
        self.wq.value.shape[2]
    }

    fn block_len(&self) -> usize {
        self.d_model() * self.d_head()
    }

    /// Head `h`'s `d_model × d_head` block of a per-head weight
    fn head_block(&self, w: &Param, h: usize) -> Tensor {
        let len = self.block_len();
        Tensor::new(
            w.value.data[h * len..(h + 1) * len].to_vec(),
            vec![self.d_model(), self.d_head()],
        )
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, AttentionCache) {
        let seq = x.rows();
        let d_head = self.d_head();
        let scale = 1.0 / (d_head as f64).sqrt();

        let heads: Vec<HeadCache> = (0..self.n_head)
            .into_par_iter()
            .map(|h| {
                let q = x.matmul(&self.head_block(&self.wq, h));
                let k = x.matmul(&self.head_block(&self.wk, h));
                let v = x.matmul(&self.head_block(&self.wv, h));
                let p = causal_alibi_softmax(&q, &k, scale, alibi_slope(h, self.n_head));
                HeadCache { q, k, v, p }
            })
            .collect();

        let mut concat = Tensor::zeros(vec![seq, self.d_model()]);
        for (h, head) in heads.iter().enumerate() {
            let mut a = Tensor::zeros(vec![seq, d_head]);
            for i in 0..seq {
                let p_row = head.p.row(i);
                let out = a.row_mut(i);
                for j in 0..=i {
                    let pij = p_row[j];
                    for (o, vj) in out.iter_mut().zip(head.v.row(j)) {
                        *o += pij * vj;
                    }
                }
            }
            concat.set_columns(h * d_head, &a);
        }

        let y = self.wo.forward(&concat);
        let cache = AttentionCache {
            x: x.clone(),
            heads,
            concat,
        };
        (y, cache)
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &AttentionCache) -> Tensor {
        let grad_concat = self.wo.backward(grad_out, &cache.concat);

        let seq = cache.x.rows();
        let d_head = self.d_head();
        let scale = 1.0 / (d_head as f64).sqrt();
        let xt = cache.x.transpose();

        let this = &*self;
        let per_head: Vec<HeadGradients> = cache
            .heads
            .par_iter()
            .enumerate()
            .map(|(h, hc)| {
                let da = grad_concat.columns(h * d_head, d_head);
                let mut dq = Tensor::zeros(vec![seq, d_head]);
                let mut dk = Tensor::zeros(vec![seq, d_head]);
                let mut dv = Tensor::zeros(vec![seq, d_head]);

                for i in 0..seq {
                    let p_row = hc.p.row(i);
                    let da_i = da.row(i);

                    let dp: Vec<f64> = (0..=i)
                        .map(|j| da_i.iter().zip(hc.v.row(j)).map(|(a, b)| a * b).sum())
                        .collect();
                    let weighted: f64 = dp.iter().zip(p_row).map(|(d, p)| d * p).sum();

                    for j in 0..=i {
                        let pij = p_row[j];
                        for (o, a) in dv.row_mut(j).iter_mut().zip(da_i) {
                            *o += pij * a;
                        }

                        let ds = pij * (dp[j] - weighted) * scale;
                        for (o, kj) in dq.row_mut(i).iter_mut().zip(hc.k.row(j)) {
                            *o += ds * kj;
                        }
                        for (o, qi) in dk.row_mut(j).iter_mut().zip(hc.q.row(i)) {
                            *o += ds * qi;
                        }
                    }
                }

                let wq = this.head_block(&this.wq, h);
                let wk = this.head_block(&this.wk, h);
                let wv = this.head_block(&this.wv, h);

                let mut x = dq.matmul(&wq.transpose());
                x.add_assign(&dk.matmul(&wk.transpose()));
                x.add_assign(&dv.matmul(&wv.transpose()));

                HeadGradients {
                    wq: xt.matmul(&dq),
                    wk: xt.matmul(&dk),
                    wv: xt.matmul(&dv),
                    x,
                }
            })
            .collect();

        let len = self.block_len();
        let mut grad_x = Tensor::zeros(cache.x.shape.clone());
        for (h, g) in per_head.iter().enumerate() {
            self.wq.accumulate_at(h * len, &g.wq.data);
            self.wk.accumulate_at(h * len, &g.wk.data);
            self.wv.accumulate_at(h * len, &g.wv.data);
            grad_x.add_assign(&g.x);
        }
        grad_x
    }

    /// `Wq, Wk, Wv, Wo`
    pub fn params(&self) -> Vec<&Param> {
        vec![&self.wq, &self.wk, &self.wv, &self.wo.weight]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.wq, &mut self.wk, &mut self.wv, &mut self.wo.weight]
    }
}
