//! Square-root form Gaussian factors.

use nalgebra::{DMatrix, DVector};

/// A linear factor `‖A₁x₁ + … + Aₖxₖ − b‖²` stored as one block per variable.
///
/// Rows are already whitened: nonlinear factors fold their noise model into
/// the blocks at linearization time, so the implicit noise here is the unit
/// Gaussian.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianFactor {
    keys: Vec<usize>,
    blocks: Vec<DMatrix<f64>>,
    b: DVector<f64>,
}

impl JacobianFactor {
    /// Create from per-variable blocks and the right-hand side.
    ///
    /// All blocks must share the row count of `b`.
    pub fn new(keys: Vec<usize>, blocks: Vec<DMatrix<f64>>, b: DVector<f64>) -> Self {
        debug_assert_eq!(keys.len(), blocks.len());
        debug_assert!(blocks.iter().all(|block| block.nrows() == b.len()));
        JacobianFactor { keys, blocks, b }
    }

    /// Variable indices in block order.
    pub fn keys(&self) -> &[usize] {
        &self.keys
    }

    /// Number of rows (residual dimension).
    pub fn rows(&self) -> usize {
        self.b.len()
    }

    /// Block for the i-th key.
    pub fn block(&self, i: usize) -> &DMatrix<f64> {
        &self.blocks[i]
    }

    /// Right-hand side.
    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }

    /// Column dimension of the block for `key`, if present.
    pub fn dim_of(&self, key: usize) -> Option<usize> {
        self.keys
            .iter()
            .position(|&k| k == key)
            .map(|i| self.blocks[i].ncols())
    }

    /// Rewrite every variable label through `perm`: label k becomes perm[k].
    pub fn relabel(&mut self, perm: &[usize]) {
        for key in self.keys.iter_mut() {
            *key = perm[*key];
        }
    }

    /// Gradient of `½‖A·x − b‖²` at `x = 0`, per variable: `−Aᵢᵀ b`.
    pub fn gradient_at_zero(&self) -> Vec<(usize, DVector<f64>)> {
        self.keys
            .iter()
            .zip(self.blocks.iter())
            .map(|(&key, block)| (key, -(block.transpose() * &self.b)))
            .collect()
    }

    /// Linear error `½‖A·x − b‖²` for per-variable values supplied by `x`.
    pub fn error<F>(&self, x: F) -> f64
    where
        F: Fn(usize) -> DVector<f64>,
    {
        let mut residual = -self.b.clone();
        for (key, block) in self.keys.iter().zip(self.blocks.iter()) {
            residual += block * x(*key);
        }
        0.5 * residual.norm_squared()
    }
}
