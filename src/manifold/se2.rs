//! SE(2) rigid transformations in the plane.
//!
//! Internally represented as a translation plus a unit complex rotation.
//! Tangent vectors are `[x, y, theta]` and follow the right perturbation
//! convention: `X ⊞ ξ = X · Exp(ξ)`.

use nalgebra::{Matrix2, Matrix3, Point2, UnitComplex, Vector2, Vector3};
use std::fmt;

/// A rigid transformation in 2D.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE2 {
    /// Translation component (x, y)
    pub translation: Vector2<f64>,
    /// Rotation component as a unit complex number
    pub rotation: UnitComplex<f64>,
}

impl fmt::Display for SE2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SE2(x: {:.4}, y: {:.4}, theta: {:.4})",
            self.x(),
            self.y(),
            self.angle()
        )
    }
}

/// Coefficients `a = sin(θ)/θ`, `b = (1 - cos(θ))/θ` with Taylor fallback.
fn sinc_coefficients(theta: f64) -> (f64, f64) {
    let theta_sq = theta * theta;
    if theta_sq < f64::EPSILON {
        // Taylor approximation
        let a = 1.0 - theta_sq / 6.0;
        let b = 0.5 * theta - theta * theta_sq / 24.0;
        (a, b)
    } else {
        let a = theta.sin() / theta;
        let b = (1.0 - theta.cos()) / theta;
        (a, b)
    }
}

/// Derivatives `da/dθ`, `db/dθ` of the sinc coefficients, with the matching
/// small-angle fallback.
fn sinc_derivatives(theta: f64) -> (f64, f64) {
    let theta_sq = theta * theta;
    if theta_sq < f64::EPSILON {
        (-theta / 3.0, 0.5 - theta_sq / 8.0)
    } else {
        (
            (theta * theta.cos() - theta.sin()) / theta_sq,
            (theta * theta.sin() + theta.cos() - 1.0) / theta_sq,
        )
    }
}

/// Inverse of the exponential's translation factor `V = [[a, −b], [b, a]]`.
fn v_inverse(a: f64, b: f64) -> Matrix2<f64> {
    Matrix2::new(a, b, -b, a) / (a * a + b * b)
}

impl SE2 {
    /// The identity transformation.
    pub fn identity() -> Self {
        SE2 {
            translation: Vector2::zeros(),
            rotation: UnitComplex::identity(),
        }
    }

    /// Create from translation components and a rotation angle.
    pub fn from_xy_angle(x: f64, y: f64, theta: f64) -> Self {
        SE2 {
            translation: Vector2::new(x, y),
            rotation: UnitComplex::from_angle(theta),
        }
    }

    /// Translation x component.
    pub fn x(&self) -> f64 {
        self.translation.x
    }

    /// Translation y component.
    pub fn y(&self) -> f64 {
        self.translation.y
    }

    /// Rotation angle in (-π, π].
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Rotation as a 2×2 matrix.
    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Adjoint matrix Ad(g).
    ///
    /// Maps right tangent vectors at the identity through the group element:
    /// `g · Exp(ξ) · g⁻¹ = Exp(Ad(g) ξ)`.
    pub fn adjoint(&self) -> Matrix3<f64> {
        let mut adjoint_matrix = Matrix3::identity();
        adjoint_matrix
            .fixed_view_mut::<2, 2>(0, 0)
            .copy_from(&self.rotation_matrix());
        adjoint_matrix[(0, 2)] = self.y();
        adjoint_matrix[(1, 2)] = -self.x();
        adjoint_matrix
    }

    /// Get the inverse.
    ///
    /// # Arguments
    /// * `jacobian` - Optional Jacobian of the inverse wrt this element.
    ///
    /// For SE(2): `g⁻¹ = [Rᵀ, -Rᵀt; 0, 1]`.
    pub fn inverse(&self, jacobian: Option<&mut Matrix3<f64>>) -> Self {
        let rot_inv = self.rotation.inverse();
        let trans_inv = -(rot_inv * self.translation);

        if let Some(jac) = jacobian {
            *jac = -self.adjoint();
        }

        SE2 {
            translation: trans_inv,
            rotation: rot_inv,
        }
    }

    /// Composition of this and another element.
    ///
    /// # Arguments
    /// * `other` - The right operand
    /// * `jacobian_self` - Optional Jacobian wrt this element
    /// * `jacobian_other` - Optional Jacobian wrt `other`
    pub fn compose(
        &self,
        other: &SE2,
        jacobian_self: Option<&mut Matrix3<f64>>,
        jacobian_other: Option<&mut Matrix3<f64>>,
    ) -> Self {
        let composed_rotation = self.rotation * other.rotation;
        let composed_translation = self
            .rotation
            .transform_point(&Point2::from(other.translation))
            .coords
            + self.translation;

        if let Some(jac_self) = jacobian_self {
            *jac_self = other.inverse(None).adjoint();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = Matrix3::identity();
        }

        SE2 {
            translation: composed_translation,
            rotation: composed_rotation,
        }
    }

    /// Relative transformation `g₁⁻¹ ∘ g₂`.
    ///
    /// # Arguments
    /// * `other` - The target element g₂
    /// * `jacobian_self` - Optional Jacobian wrt g₁
    /// * `jacobian_other` - Optional Jacobian wrt g₂
    pub fn between(
        &self,
        other: &SE2,
        jacobian_self: Option<&mut Matrix3<f64>>,
        jacobian_other: Option<&mut Matrix3<f64>>,
    ) -> Self {
        let result = self.inverse(None).compose(other, None, None);

        if let Some(jac_self) = jacobian_self {
            *jac_self = -result.inverse(None).adjoint();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = Matrix3::identity();
        }

        result
    }

    /// Logarithmic map to the tangent space, `[x, y, theta]`.
    ///
    /// The exponential's translation is `t = V(θ)·ρ`, so the tangent
    /// translation is recovered as `ρ = V⁻¹·t`.
    ///
    /// # Arguments
    /// * `jacobian` - Optional Jacobian of the log wrt this element
    pub fn log(&self, jacobian: Option<&mut Matrix3<f64>>) -> Vector3<f64> {
        let theta = self.angle();
        let (a, b) = sinc_coefficients(theta);
        let rho = v_inverse(a, b) * self.translation;
        let result = Vector3::new(rho.x, rho.y, theta);

        if let Some(jac) = jacobian {
            *jac = SE2::right_jacobian_inv(&result);
        }

        result
    }

    /// Exponential map from the tangent space.
    pub fn exp(tangent: &Vector3<f64>) -> Self {
        let theta = tangent.z;
        let (a, b) = sinc_coefficients(theta);

        let translation = Vector2::new(
            a * tangent.x - b * tangent.y,
            b * tangent.x + a * tangent.y,
        );

        SE2 {
            translation,
            rotation: UnitComplex::from_angle(theta),
        }
    }

    /// Inverse of the right Jacobian Jr⁻¹ of the exponential at `tangent`.
    ///
    /// Satisfies `Log(Exp(ξ) · Exp(δ)) ≈ ξ + Jr⁻¹(ξ) δ` for small δ.
    ///
    /// Differentiating `Exp(ξ + δ) = Exp(ξ) ∘ Exp(Jr δ)` through the
    /// translation factorization `t = V(θ)·ρ` gives the right Jacobian the
    /// block form
    ///
    /// ```text
    ///   Jr = [ RᵀV   RᵀV′ρ ]          Jr⁻¹ = [ V⁻¹R   −V⁻¹V′ρ ]
    ///        [  0      1   ]                 [  0        1    ]
    /// ```
    ///
    /// so both blocks invert in closed form.
    pub fn right_jacobian_inv(tangent: &Vector3<f64>) -> Matrix3<f64> {
        let rho = Vector2::new(tangent.x, tangent.y);
        let theta = tangent.z;

        let (a, b) = sinc_coefficients(theta);
        let (da, db) = sinc_derivatives(theta);
        let v_inv = v_inverse(a, b);
        let rotation = UnitComplex::from_angle(theta)
            .to_rotation_matrix()
            .into_inner();
        // V′·ρ with V′ = [[da, −db], [db, da]]
        let v_prime_rho = Vector2::new(da * rho.x - db * rho.y, db * rho.x + da * rho.y);

        let translational = v_inv * rotation;
        let cross = -(v_inv * v_prime_rho);

        let mut jac_inv = Matrix3::identity();
        jac_inv
            .fixed_view_mut::<2, 2>(0, 0)
            .copy_from(&translational);
        jac_inv[(0, 2)] = cross.x;
        jac_inv[(1, 2)] = cross.y;
        jac_inv
    }

    /// Right plus: `self · Exp(ξ)`.
    pub fn retract(&self, tangent: &Vector3<f64>) -> Self {
        self.compose(&SE2::exp(tangent), None, None)
    }

    /// Right minus: `Log(self⁻¹ · other)`.
    pub fn local_coordinates(&self, other: &SE2) -> Vector3<f64> {
        self.between(other, None, None).log(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn assert_close(a: &SE2, b: &SE2, tol: f64) {
        assert!(
            a.local_coordinates(b).norm() < tol,
            "{} vs {}",
            a,
            b
        );
    }

    #[test]
    fn test_exp_log_roundtrip() {
        let xi = Vector3::new(0.3, -0.2, 0.7);
        let g = SE2::exp(&xi);
        let back = g.log(None);
        assert!((xi - back).norm() < 1e-12);
    }

    #[test]
    fn test_exp_log_small_angle() {
        let xi = Vector3::new(0.5, 0.1, 1e-12);
        let back = SE2::exp(&xi).log(None);
        assert!((xi - back).norm() < 1e-9);
    }

    #[test]
    fn test_compose_inverse() {
        let g = SE2::from_xy_angle(1.0, 2.0, 0.5);
        let composed = g.compose(&g.inverse(None), None, None);
        assert_close(&composed, &SE2::identity(), 1e-12);
    }

    #[test]
    fn test_between_consistency() {
        let g1 = SE2::from_xy_angle(1.0, 0.0, 0.2);
        let delta = SE2::from_xy_angle(1.0, 0.0, 0.0);
        let g2 = g1.compose(&delta, None, None);
        assert_close(&g1.between(&g2, None, None), &delta, 1e-12);
    }

    #[test]
    fn test_retract_local_coordinates() {
        let g = SE2::from_xy_angle(0.4, -0.3, PI / 3.0);
        let xi = Vector3::new(0.05, -0.02, 0.1);
        let moved = g.retract(&xi);
        assert!((g.local_coordinates(&moved) - xi).norm() < 1e-12);
    }

    #[test]
    fn test_compose_jacobians_numeric() {
        let g1 = SE2::from_xy_angle(0.3, 0.8, 0.4);
        let g2 = SE2::from_xy_angle(-0.5, 0.2, -0.9);
        let mut j1 = Matrix3::zeros();
        let mut j2 = Matrix3::zeros();
        let base = g1.compose(&g2, Some(&mut j1), Some(&mut j2));

        let eps = 1e-7;
        for k in 0..3 {
            let mut xi = Vector3::zeros();
            xi[k] = eps;
            let perturbed = g1.retract(&xi).compose(&g2, None, None);
            let numeric = base.local_coordinates(&perturbed) / eps;
            let analytic = j1.column(k);
            assert!((numeric - analytic).norm() < 1e-5, "column {} of J1", k);

            let perturbed = g1.compose(&g2.retract(&xi), None, None);
            let numeric = base.local_coordinates(&perturbed) / eps;
            let analytic = j2.column(k);
            assert!((numeric - analytic).norm() < 1e-5, "column {} of J2", k);
        }
    }

    #[test]
    fn test_log_jacobian_numeric() {
        let g = SE2::from_xy_angle(0.7, -0.4, 0.6);
        let mut jac = Matrix3::zeros();
        let base = g.log(Some(&mut jac));

        let eps = 1e-7;
        for k in 0..3 {
            let mut xi = Vector3::zeros();
            xi[k] = eps;
            let numeric = (g.retract(&xi).log(None) - base) / eps;
            assert!((numeric - jac.column(k)).norm() < 1e-5, "column {}", k);
        }
    }
}
