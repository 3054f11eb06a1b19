//! Neural Network Layers
//!
//! Building blocks of the flight transformer and the policy network. Each layer
//! has a forward and a hand-derived backward pass.
//!
//! ## Layers
//!
//! - **activation**: GELU (forward and backward)
//! - **linear**: Fully connected layer, optional bias
//! - **embedding**: Sequence and condition feature projection
//! - **rms_norm**: Parameter-free RMS normalization
//! - **feed_forward**: `W1 → GELU → W2`
//! - **attention**: Causal multi-head attention with ALiBi
//! - **block**: Pre-norm transformer block
//!
//! ## Design Pattern
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor) -> (Tensor, Cache) { }
//!     pub fn backward(&mut self, grad: &Tensor, cache: &Cache) -> Tensor { }
//! }
//! ```
//!
//! `forward` is pure and returns a cache of the intermediates the backward pass
//! needs. `backward` adds parameter gradients into each [`Param`]'s `grad`
//! buffer and returns the gradient with respect to the layer input.
//!
//! [`Param`]: crate::tensor::Param

pub mod activation;
pub mod attention;
pub mod block;
pub mod embedding;
pub mod feed_forward;
pub mod linear;
pub mod rms_norm;

pub use activation::{gelu, gelu_backward, gelu_derivative, gelu_forward};
pub use attention::{alibi_slope, causal_alibi_softmax, AttentionCache, MultiHeadAttention};
pub use block::{BlockCache, TransformerBlock};
pub use embedding::{Embedding, EmbeddingCache};
pub use feed_forward::{FeedForward, FeedForwardCache};
pub use linear::Linear;
pub use rms_norm::{rms_norm_backward, rms_norm_forward, RmsNormCache};
