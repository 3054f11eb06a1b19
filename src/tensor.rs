//! Tensors and Trainable Parameters
//!
//! A minimal row-major tensor type for the fixed architectures in this crate,
//! plus [`Param`], which pairs a tensor with the gradient and Adam moment
//! buffers it needs while training.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f64>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[seq_len, d_model]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! Activations are plain [`Tensor`]s. Only parameters carry `grad`, `m` and
//! `v`, and those three buffers always have the same length as the data they
//! belong to.
//!
//! ## Example
//!
//! ```rust
//! use flightnet::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Performance
//!
//! Matrix multiplication switches to a cache-blocked algorithm that splits the
//! output into row blocks and hands them to Rayon once the work is large
//! enough. Each output row is still accumulated in the same order regardless
//! of how rows are distributed, so results do not depend on the thread count.

use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

/// A multi-dimensional array of `f64` values in row-major layout
///
/// For shape `[2, 3]`, data is stored as
/// `[row0_col0, row0_col1, row0_col2, row1_col0, row1_col1, row1_col2]`
/// with strides `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f64>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor of `N(0, 1) * scale` samples
    ///
    /// Weight matrices in this crate use `scale = sqrt(2 / d_model)`.
    pub fn randn<R: Rng + ?Sized>(shape: Vec<usize>, scale: f64, rng: &mut R) -> Self {
        let size: usize = shape.iter().product();
        let data = (0..size)
            .map(|_| rng.sample::<f64, _>(StandardNormal) * scale)
            .collect();
        Self::new(data, shape)
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of rows when viewed as a matrix `[rows, last_dim]`
    pub fn rows(&self) -> usize {
        if self.shape.is_empty() {
            return 0;
        }
        self.data.len() / self.cols()
    }

    /// Size of the last dimension
    pub fn cols(&self) -> usize {
        *self.shape.last().unwrap_or(&0)
    }

    /// Borrow row `i` of the matrix view
    pub fn row(&self, i: usize) -> &[f64] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Mutably borrow row `i` of the matrix view
    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        let cols = self.cols();
        &mut self.data[i * cols..(i + 1) * cols]
    }

    /// Copy out a contiguous band of columns `[start, start + width)`
    pub fn columns(&self, start: usize, width: usize) -> Tensor {
        let rows = self.rows();
        let cols = self.cols();
        assert!(start + width <= cols, "Column band out of range");
        let mut data = Vec::with_capacity(rows * width);
        for r in 0..rows {
            data.extend_from_slice(&self.data[r * cols + start..r * cols + start + width]);
        }
        Tensor::new(data, vec![rows, width])
    }

    /// Write `band` into columns `[start, start + band.cols())`
    pub fn set_columns(&mut self, start: usize, band: &Tensor) {
        let rows = self.rows();
        let cols = self.cols();
        let width = band.cols();
        assert_eq!(band.rows(), rows, "Row count mismatch for column band");
        assert!(start + width <= cols, "Column band out of range");
        for r in 0..rows {
            self.data[r * cols + start..r * cols + start + width]
                .copy_from_slice(&band.data[r * width..(r + 1) * width]);
        }
    }

    /// Inner loop for matrix multiplication
    /// Computes: result[j] += a_val * b[j] for all j
    #[inline(always)]
    fn matmul_inner(a_val: f64, b: &[f64], result: &mut [f64]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// 2D matrix multiplication
    ///
    /// For `A @ B` where `A` is `[m, k]` and `B` is `[k, n]` the result is `[m, n]`.
    ///
    /// Row `i` of the result depends only on row `i` of `A`. Causal masking
    /// upstream relies on this.
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or the inner dimensions differ
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let n = other.shape[1];
        let k = self.shape[1];

        // Parallel overhead only pays off past a few thousand multiply-adds
        if m * n * k >= 4_096 {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            let out_row = &mut result[i * n..(i + 1) * n];
            for l in 0..k {
                Self::matmul_inner(self.data[i * k + l], &other.data[l * n..(l + 1) * n], out_row);
            }
        }

        Tensor::new(result, vec![m, n])
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Output rows are split into blocks of `BLOCK_SIZE` rows, one Rayon task
    /// per block; inside a block the `k` loop runs in ascending order so every
    /// row accumulates identically to the sequential path.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for i in i_start..i_end {
                    let row_offset = (i - i_start) * n;
                    let out_row = &mut result_block[row_offset..row_offset + n];
                    for k_idx in 0..k {
                        Self::matmul_inner(
                            self.data[i * k + k_idx],
                            &other.data[k_idx * n..(k_idx + 1) * n],
                            out_row,
                        );
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Transpose a 2D matrix
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "transpose expects a 2D tensor");
        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut result = vec![0.0; rows * cols];

        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }

        Tensor::new(result, vec![cols, rows])
    }

    /// Element-wise addition of same-shaped tensors
    pub fn add(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape, other.shape, "Shapes must match for addition");
        let result = self
            .data
            .par_iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// In-place element-wise addition (residual connections)
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "Shapes must match for addition");
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f64) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }
}

/// A trainable tensor with its gradient and Adam moment buffers
///
/// `grad` accumulates across backward calls until the optimizer consumes it.
/// `m` and `v` persist across steps and are only reset by constructing a new
/// parameter.
#[derive(Clone, Debug)]
pub struct Param {
    pub value: Tensor,
    pub grad: Vec<f64>,
    pub m: Vec<f64>,
    pub v: Vec<f64>,
}

impl Param {
    pub fn new(value: Tensor) -> Self {
        let n = value.len();
        Self {
            value,
            grad: vec![0.0; n],
            m: vec![0.0; n],
            v: vec![0.0; n],
        }
    }

    /// Weight matrix initialised as `N(0, 1) * scale`
    pub fn randn<R: Rng + ?Sized>(shape: Vec<usize>, scale: f64, rng: &mut R) -> Self {
        Self::new(Tensor::randn(shape, scale, rng))
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::new(Tensor::zeros(shape))
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Add `delta` into the accumulated gradient
    pub fn accumulate(&mut self, delta: &Tensor) {
        assert_eq!(
            delta.len(),
            self.grad.len(),
            "Gradient size mismatch for parameter of shape {:?}",
            self.value.shape
        );
        for (g, d) in self.grad.iter_mut().zip(&delta.data) {
            *g += d;
        }
    }

    /// Add `delta` into a contiguous sub-range of the gradient
    pub fn accumulate_at(&mut self, offset: usize, delta: &[f64]) {
        for (g, d) in self.grad[offset..offset + delta.len()].iter_mut().zip(delta) {
            *g += d;
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Anything that owns an ordered list of trainable parameters
///
/// The order returned here is the serialization order of the weight file and
/// the iteration order of the optimizer, so implementations must keep it fixed.
pub trait Parameters {
    fn parameters(&self) -> Vec<&Param>;
    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    /// Total number of scalar parameters
    fn num_scalars(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// Mutable access to a scalar by its flat index across all parameters
    fn scalar_mut(&mut self, mut index: usize) -> Option<&mut f64> {
        for p in self.parameters_mut() {
            if index < p.len() {
                return Some(&mut p.value.data[index]);
            }
            index -= p.len();
        }
        None
    }

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    /// Flattened copy of every gradient in parameter order
    fn flat_grad(&self) -> Vec<f64> {
        self.parameters()
            .iter()
            .flat_map(|p| p.grad.iter().copied())
            .collect()
    }
}
