//! Diagonal Gaussian noise models.
//!
//! A measurement with residual `r` and diagonal noise `Σ = diag(σ)²`
//! contributes `½‖Σ^(-1/2) r‖²` to the objective. Factors whiten their
//! residual and Jacobian blocks at linearization time so the linear layer
//! only ever sees unit-noise systems.

use nalgebra::{DMatrix, DVector};

/// Diagonal noise model defined by per-row standard deviations.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagonalNoise {
    sigmas: DVector<f64>,
    inv_sigmas: DVector<f64>,
}

impl DiagonalNoise {
    /// Create from per-row standard deviations. Sigmas must be positive.
    pub fn from_sigmas(sigmas: &[f64]) -> Self {
        debug_assert!(sigmas.iter().all(|&s| s > 0.0));
        let sigmas = DVector::from_column_slice(sigmas);
        let inv_sigmas = sigmas.map(|s| 1.0 / s);
        DiagonalNoise { sigmas, inv_sigmas }
    }

    /// Unit noise of the given dimension.
    pub fn unit(dim: usize) -> Self {
        DiagonalNoise {
            sigmas: DVector::from_element(dim, 1.0),
            inv_sigmas: DVector::from_element(dim, 1.0),
        }
    }

    /// Residual dimension.
    pub fn dim(&self) -> usize {
        self.sigmas.len()
    }

    /// Per-row standard deviations.
    pub fn sigmas(&self) -> &DVector<f64> {
        &self.sigmas
    }

    /// Scale a residual by `Σ^(-1/2)`.
    pub fn whiten(&self, residual: &DVector<f64>) -> DVector<f64> {
        residual.component_mul(&self.inv_sigmas)
    }

    /// Scale the rows of a Jacobian block by `Σ^(-1/2)` in place.
    pub fn whiten_jacobian_in_place(&self, jacobian: &mut DMatrix<f64>) {
        for i in 0..jacobian.nrows() {
            let w = self.inv_sigmas[i];
            for j in 0..jacobian.ncols() {
                jacobian[(i, j)] *= w;
            }
        }
    }

    /// Half squared whitened norm of a residual.
    pub fn error(&self, residual: &DVector<f64>) -> f64 {
        let whitened = self.whiten(residual);
        0.5 * whitened.dot(&whitened)
    }
}
