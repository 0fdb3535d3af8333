//! Nonlinear factor implementations for the planar smoothing engine.
//!
//! Factors represent measurements or constraints between variables in the
//! factor graph. Each factor computes a residual (error) vector and its
//! Jacobian with respect to the connected variables, then whitens both by its
//! noise model, producing a unit-noise [`JacobianFactor`] in index space.
//!
//! ```text
//! minimize Σ_i ‖Σ_i^(-1/2) r_i(x)‖²
//! ```
//!
//! # Factor Types
//!
//! - [`PriorFactor`]: unary constraint anchoring a single variable
//! - [`BetweenFactor`]: relative pose constraint between two poses
//! - [`BearingRangeFactor`]: bearing + range observation of a landmark
//!
//! Factors are a tagged variant rather than a trait object so the engine's
//! deep copy and structural equality stay derivable; this mirrors how the
//! estimate handles mixed variable kinds.

use nalgebra::{DMatrix, DVector};

use crate::core::key::Key;
use crate::core::ordering::Ordering;
use crate::core::values::Values;
use crate::core::{CoreError, CoreResult};
use crate::linalg::JacobianFactor;

pub mod bearing_range_factor;
pub mod between_factor;
pub mod prior_factor;

pub use bearing_range_factor::BearingRangeFactor;
pub use between_factor::BetweenFactor;
pub use prior_factor::PriorFactor;

/// A nonlinear residual over an ordered tuple of keys.
///
/// Factors are immutable once inserted into the engine and are identified by
/// the slot index assigned at insertion time.
#[derive(Debug, Clone, PartialEq)]
pub enum Factor {
    /// Unary prior
    Prior(PriorFactor),
    /// Relative pose constraint
    Between(BetweenFactor),
    /// Bearing/range landmark observation
    BearingRange(BearingRangeFactor),
}

impl Factor {
    /// Keys of the connected variables, in argument order.
    pub fn keys(&self) -> &[Key] {
        match self {
            Factor::Prior(f) => f.keys(),
            Factor::Between(f) => f.keys(),
            Factor::BearingRange(f) => f.keys(),
        }
    }

    /// Residual dimension.
    pub fn dim(&self) -> usize {
        match self {
            Factor::Prior(f) => f.dim(),
            Factor::Between(f) => f.dim(),
            Factor::BearingRange(f) => f.dim(),
        }
    }

    /// Half squared whitened residual norm at the given estimate.
    pub fn error(&self, values: &Values) -> CoreResult<f64> {
        match self {
            Factor::Prior(f) => f.error(values),
            Factor::Between(f) => f.error(values),
            Factor::BearingRange(f) => f.error(values),
        }
    }

    /// Linearize at the given estimate into a whitened linear factor over
    /// elimination indices.
    pub fn linearize(&self, values: &Values, ordering: &Ordering) -> CoreResult<JacobianFactor> {
        let (residual, jacobians) = match self {
            Factor::Prior(f) => f.residual_and_jacobians(values)?,
            Factor::Between(f) => f.residual_and_jacobians(values)?,
            Factor::BearingRange(f) => f.residual_and_jacobians(values)?,
        };
        let noise = match self {
            Factor::Prior(f) => f.noise(),
            Factor::Between(f) => f.noise(),
            Factor::BearingRange(f) => f.noise(),
        };

        if residual.len() != self.dim() || noise.dim() != self.dim() {
            return Err(CoreError::InconsistentDims(format!(
                "factor of dim {} produced a {}-dim residual under a {}-dim noise model",
                self.dim(),
                residual.len(),
                noise.dim()
            ))
            .log());
        }

        let mut keys = Vec::with_capacity(self.keys().len());
        let mut blocks = Vec::with_capacity(self.keys().len());
        for (key, mut jacobian) in self.keys().iter().zip(jacobians) {
            let expected = values.get(*key)?.dim();
            if jacobian.ncols() != expected || jacobian.nrows() != self.dim() {
                return Err(CoreError::InconsistentDims(format!(
                    "jacobian block {}x{} for variable {} of dim {}",
                    jacobian.nrows(),
                    jacobian.ncols(),
                    key,
                    expected
                ))
                .log());
            }
            noise.whiten_jacobian_in_place(&mut jacobian);
            keys.push(ordering.at(*key)?);
            blocks.push(jacobian);
        }

        let b = -noise.whiten(&residual);
        Ok(JacobianFactor::new(keys, blocks, b))
    }
}

/// Residual plus one Jacobian block per connected variable.
pub(crate) type Linearization = (DVector<f64>, Vec<DMatrix<f64>>);
