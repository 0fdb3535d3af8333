//! Gaussian factors, conditionals and the dense elimination kernel.
//!
//! Everything in this module works in index space: variables are dense
//! elimination indices assigned by the [`Ordering`](crate::core::ordering::Ordering),
//! and all matrices are small dense blocks. The engine never forms a global
//! sparse system — each eliminated variable factors the handful of blocks
//! that touch it.

pub mod conditional;
pub mod elimination;
pub mod hessian_factor;
pub mod jacobian_factor;

use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;

pub use conditional::{GaussianBayesNet, GaussianConditional};
pub use elimination::{EliminationResult, eliminate_sequential};
pub use hessian_factor::HessianFactor;
pub use jacobian_factor::JacobianFactor;

/// Factorization method used when eliminating a variable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Factorization {
    /// Form the information matrix and factor it in place. Fast, but squares
    /// the condition number; fails with `IndefiniteSystem` on a non-positive
    /// pivot.
    #[default]
    Cholesky,
    /// Householder QR of the stacked block rows.
    QR,
}

impl Display for Factorization {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Factorization::Cholesky => write!(f, "Cholesky"),
            Factorization::QR => write!(f, "QR"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// A Cholesky pivot was not positive
    #[error("Indefinite system: pivot {pivot:.6e} at column {column}")]
    IndefiniteSystem { pivot: f64, column: usize },

    /// Matrix factorization failed (rank deficiency, empty system, ...)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| LinAlgError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error for debugging context
    ///
    /// # Arguments
    /// * `source_error` - The original error (must implement Debug)
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// A linear (Gaussian) factor in either square-root or information form.
#[derive(Debug, Clone, PartialEq)]
pub enum GaussianFactor {
    /// Square-root form `‖A·x − b‖²`
    Jacobian(JacobianFactor),
    /// Information form `xᵀGx − 2gᵀx + c`
    Hessian(HessianFactor),
}

impl GaussianFactor {
    /// Variable indices this factor touches.
    pub fn keys(&self) -> &[usize] {
        match self {
            GaussianFactor::Jacobian(f) => f.keys(),
            GaussianFactor::Hessian(f) => f.keys(),
        }
    }

    /// Dimension of the block for a given key, if the key is present.
    pub fn dim_of(&self, key: usize) -> Option<usize> {
        match self {
            GaussianFactor::Jacobian(f) => f.dim_of(key),
            GaussianFactor::Hessian(f) => f.dim_of(key),
        }
    }

    /// Rewrite every variable label through `perm`: label k becomes perm[k].
    pub fn relabel(&mut self, perm: &[usize]) {
        match self {
            GaussianFactor::Jacobian(f) => f.relabel(perm),
            GaussianFactor::Hessian(f) => f.relabel(perm),
        }
    }
}
