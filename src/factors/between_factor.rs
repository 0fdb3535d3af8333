//! Relative pose constraints.

use nalgebra::{DMatrix, DVector, Matrix3};

use crate::core::key::Key;
use crate::core::noise::DiagonalNoise;
use crate::core::values::Values;
use crate::core::CoreResult;
use crate::factors::Linearization;
use crate::manifold::SE2;

/// A relative pose measurement between two poses.
///
/// Given poses `x₁`, `x₂` and a measured relative transform `m`, the residual
/// is
///
/// ```text
/// r = Log(m⁻¹ ∘ (x₁⁻¹ ∘ x₂))
/// ```
///
/// which vanishes when `x₂ = x₁ ∘ m`. Jacobians are analytic, chained through
/// the between and logarithm maps:
///
/// ```text
/// h  = x₁⁻¹ ∘ x₂          ∂h/∂x₁ = −Ad(h⁻¹),  ∂h/∂x₂ = I
/// r  = Log(m⁻¹ ∘ h)       ∂r/∂h  = Jr⁻¹(r)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BetweenFactor {
    keys: [Key; 2],
    measured: SE2,
    noise: DiagonalNoise,
}

impl BetweenFactor {
    /// Create a between factor measuring `x₁⁻¹ ∘ x₂`.
    pub fn new(key1: Key, key2: Key, measured: SE2, noise: DiagonalNoise) -> Self {
        debug_assert_eq!(noise.dim(), 3);
        BetweenFactor {
            keys: [key1, key2],
            measured,
            noise,
        }
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn dim(&self) -> usize {
        3
    }

    pub fn noise(&self) -> &DiagonalNoise {
        &self.noise
    }

    /// The measured relative transform.
    pub fn measured(&self) -> &SE2 {
        &self.measured
    }

    pub fn error(&self, values: &Values) -> CoreResult<f64> {
        let (residual, _) = self.residual_and_jacobians(values)?;
        Ok(self.noise.error(&residual))
    }

    pub(crate) fn residual_and_jacobians(&self, values: &Values) -> CoreResult<Linearization> {
        let x1 = values.get(self.keys[0])?.as_pose2()?;
        let x2 = values.get(self.keys[1])?.as_pose2()?;

        let mut j_h_x1 = Matrix3::zeros();
        let mut j_h_x2 = Matrix3::zeros();
        let h = x1.between(x2, Some(&mut j_h_x1), Some(&mut j_h_x2));

        let mut j_log = Matrix3::zeros();
        let residual = self
            .measured
            .between(&h, None, None)
            .log(Some(&mut j_log));

        let j1 = j_log * j_h_x1;
        let j2 = j_log * j_h_x2;

        Ok((
            DVector::from_column_slice(residual.as_slice()),
            vec![
                DMatrix::from_column_slice(3, 3, j1.as_slice()),
                DMatrix::from_column_slice(3, 3, j2.as_slice()),
            ],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::values::Value;

    fn values_for(x1: SE2, x2: SE2) -> Values {
        let mut values = Values::new();
        values.insert(0, Value::Pose2(x1)).unwrap();
        values.insert(1, Value::Pose2(x2)).unwrap();
        values
    }

    #[test]
    fn test_zero_error_at_measurement() {
        let x1 = SE2::from_xy_angle(1.0, 0.5, 0.3);
        let measured = SE2::from_xy_angle(1.0, 0.0, 0.1);
        let x2 = x1.compose(&measured, None, None);

        let factor = BetweenFactor::new(0, 1, measured, DiagonalNoise::unit(3));
        assert!(factor.error(&values_for(x1, x2)).unwrap() < 1e-15);
    }

    #[test]
    fn test_jacobians_numeric() {
        let x1 = SE2::from_xy_angle(0.2, -0.4, 0.5);
        let x2 = SE2::from_xy_angle(1.3, 0.1, 0.9);
        let measured = SE2::from_xy_angle(1.0, 0.3, 0.2);
        let factor = BetweenFactor::new(0, 1, measured, DiagonalNoise::unit(3));

        let (base, jacobians) = factor
            .residual_and_jacobians(&values_for(x1, x2))
            .unwrap();

        let eps = 1e-7;
        for var in 0..2 {
            for k in 0..3 {
                let mut xi = nalgebra::Vector3::zeros();
                xi[k] = eps;
                let (p1, p2) = if var == 0 {
                    (x1.retract(&xi), x2)
                } else {
                    (x1, x2.retract(&xi))
                };
                let (perturbed, _) = factor
                    .residual_and_jacobians(&values_for(p1, p2))
                    .unwrap();
                let numeric = (perturbed - &base) / eps;
                for row in 0..3 {
                    assert!(
                        (numeric[row] - jacobians[var][(row, k)]).abs() < 1e-5,
                        "var {} col {} row {}",
                        var,
                        k,
                        row
                    );
                }
            }
        }
    }
}
