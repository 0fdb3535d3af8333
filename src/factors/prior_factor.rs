//! Unary prior factors.

use nalgebra::{DMatrix, DVector};

use crate::core::key::Key;
use crate::core::noise::DiagonalNoise;
use crate::core::values::{Value, Values};
use crate::core::CoreResult;
use crate::factors::Linearization;
use crate::manifold::SE2;

/// Anchors a single variable to a fixed value.
///
/// The residual is the tangent vector from the prior to the current value,
/// `r = prior ⊟ x`; for a pose that is `Log(prior⁻¹ · x)` with the log
/// right-Jacobian inverse as the (exact) Jacobian, for a point it is plain
/// subtraction with an identity Jacobian.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorFactor {
    keys: [Key; 1],
    prior: Value,
    noise: DiagonalNoise,
}

impl PriorFactor {
    /// Create a prior on `key`.
    pub fn new(key: Key, prior: Value, noise: DiagonalNoise) -> Self {
        debug_assert_eq!(noise.dim(), prior.dim());
        PriorFactor {
            keys: [key],
            prior,
            noise,
        }
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn dim(&self) -> usize {
        self.prior.dim()
    }

    pub fn noise(&self) -> &DiagonalNoise {
        &self.noise
    }

    /// The anchored value.
    pub fn prior(&self) -> &Value {
        &self.prior
    }

    pub fn error(&self, values: &Values) -> CoreResult<f64> {
        let (residual, _) = self.residual_and_jacobians(values)?;
        Ok(self.noise.error(&residual))
    }

    pub(crate) fn residual_and_jacobians(&self, values: &Values) -> CoreResult<Linearization> {
        let x = values.get(self.keys[0])?;
        match (&self.prior, x) {
            (Value::Pose2(prior), Value::Pose2(pose)) => {
                let diff = prior.between(pose, None, None);
                let residual = diff.log(None);
                let jacobian = SE2::right_jacobian_inv(&residual);
                Ok((
                    DVector::from_column_slice(residual.as_slice()),
                    vec![DMatrix::from_column_slice(3, 3, jacobian.as_slice())],
                ))
            }
            _ => {
                let residual = self.prior.local_coordinates(x)?;
                let dim = residual.len();
                Ok((residual, vec![DMatrix::identity(dim, dim)]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    #[test]
    fn test_zero_error_at_prior() {
        let prior = Value::Pose2(SE2::from_xy_angle(1.0, 2.0, 0.3));
        let factor = PriorFactor::new(0, prior.clone(), DiagonalNoise::unit(3));
        let mut values = Values::new();
        values.insert(0, prior).unwrap();
        assert!(factor.error(&values).unwrap() < 1e-15);
    }

    #[test]
    fn test_point_prior_residual() {
        let factor = PriorFactor::new(
            100,
            Value::Point2(Vector2::new(1.0, 1.0)),
            DiagonalNoise::unit(2),
        );
        let mut values = Values::new();
        values.insert(100, Value::Point2(Vector2::new(2.0, 1.0))).unwrap();
        let (residual, jacobians) = factor.residual_and_jacobians(&values).unwrap();
        assert!((residual[0] - 1.0).abs() < 1e-12);
        assert!(residual[1].abs() < 1e-12);
        assert_eq!(jacobians[0], DMatrix::identity(2, 2));
    }
}
