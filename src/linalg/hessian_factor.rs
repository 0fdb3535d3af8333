//! Information form Gaussian factors.

use nalgebra::DMatrix;

use crate::linalg::JacobianFactor;

/// A Gaussian factor in augmented information form.
///
/// Stores the symmetric matrix
///
/// ```text
///   [ G   g ]        G = AᵀA,  g = Aᵀb,  c = bᵀb
///   [ gᵀ  c ]
/// ```
///
/// representing the quadratic `xᵀGx − 2gᵀx + c = ‖A·x − b‖²`. This is the
/// form used for the cached separator marginal at each clique boundary:
/// the Schur complement of an elimination lands here directly, without a
/// square-root refactorization.
#[derive(Debug, Clone, PartialEq)]
pub struct HessianFactor {
    keys: Vec<usize>,
    dims: Vec<usize>,
    info: DMatrix<f64>,
}

impl HessianFactor {
    /// Create from keys, per-key dimensions and the augmented information
    /// matrix (one extra row/column for the linear and constant terms).
    pub fn new(keys: Vec<usize>, dims: Vec<usize>, info: DMatrix<f64>) -> Self {
        debug_assert_eq!(keys.len(), dims.len());
        let total: usize = dims.iter().sum();
        debug_assert_eq!(info.nrows(), total + 1);
        debug_assert_eq!(info.ncols(), total + 1);
        HessianFactor { keys, dims, info }
    }

    /// Convert a square-root factor into information form.
    pub fn from_jacobian(factor: &JacobianFactor) -> Self {
        let dims: Vec<usize> = (0..factor.keys().len())
            .map(|i| factor.block(i).ncols())
            .collect();
        let total: usize = dims.iter().sum();
        let rows = factor.rows();

        // Stack [A | b] and square it
        let mut ab = DMatrix::zeros(rows, total + 1);
        let mut offset = 0;
        for i in 0..factor.keys().len() {
            ab.view_mut((0, offset), (rows, dims[i]))
                .copy_from(factor.block(i));
            offset += dims[i];
        }
        ab.view_mut((0, total), (rows, 1)).copy_from(factor.b());

        let info = ab.transpose() * &ab;
        HessianFactor {
            keys: factor.keys().to_vec(),
            dims,
            info,
        }
    }

    /// Variable indices in block order.
    pub fn keys(&self) -> &[usize] {
        &self.keys
    }

    /// Per-key block dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// The augmented information matrix.
    pub fn info(&self) -> &DMatrix<f64> {
        &self.info
    }

    /// Column dimension of the block for `key`, if present.
    pub fn dim_of(&self, key: usize) -> Option<usize> {
        self.keys
            .iter()
            .position(|&k| k == key)
            .map(|i| self.dims[i])
    }

    /// Rewrite every variable label through `perm`: label k becomes perm[k].
    pub fn relabel(&mut self, perm: &[usize]) {
        for key in self.keys.iter_mut() {
            *key = perm[*key];
        }
    }
}
