//! Bearing/range landmark observations.

use nalgebra::{DMatrix, DVector};

use crate::core::key::Key;
use crate::core::noise::DiagonalNoise;
use crate::core::values::Values;
use crate::core::CoreResult;
use crate::factors::Linearization;
use crate::manifold::wrap_angle;

/// A landmark observed from a pose as a bearing angle and a range.
///
/// With the landmark expressed in the pose frame, `p = Rᵀ(l − t)`, the
/// predicted measurement is `(atan2(p_y, p_x), ‖p‖)` and the residual is the
/// (angle-wrapped) difference to the measured pair.
#[derive(Debug, Clone, PartialEq)]
pub struct BearingRangeFactor {
    keys: [Key; 2],
    bearing: f64,
    range: f64,
    noise: DiagonalNoise,
}

impl BearingRangeFactor {
    /// Create an observation of landmark `landmark_key` from `pose_key`.
    pub fn new(
        pose_key: Key,
        landmark_key: Key,
        bearing: f64,
        range: f64,
        noise: DiagonalNoise,
    ) -> Self {
        debug_assert_eq!(noise.dim(), 2);
        debug_assert!(range > 0.0);
        BearingRangeFactor {
            keys: [pose_key, landmark_key],
            bearing,
            range,
            noise,
        }
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn dim(&self) -> usize {
        2
    }

    pub fn noise(&self) -> &DiagonalNoise {
        &self.noise
    }

    /// Measured bearing angle.
    pub fn bearing(&self) -> f64 {
        self.bearing
    }

    /// Measured range.
    pub fn range(&self) -> f64 {
        self.range
    }

    pub fn error(&self, values: &Values) -> CoreResult<f64> {
        let (residual, _) = self.residual_and_jacobians(values)?;
        Ok(self.noise.error(&residual))
    }

    pub(crate) fn residual_and_jacobians(&self, values: &Values) -> CoreResult<Linearization> {
        let pose = values.get(self.keys[0])?.as_pose2()?;
        let landmark = values.get(self.keys[1])?.as_point2()?;

        // Landmark in the pose frame
        let rotation_t = pose.rotation_matrix().transpose();
        let p = rotation_t * (landmark - pose.translation);
        let (px, py) = (p.x, p.y);
        let range_sq = px * px + py * py;
        let range = range_sq.sqrt();

        let residual = DVector::from_vec(vec![
            wrap_angle(py.atan2(px) - self.bearing),
            range - self.range,
        ]);

        // ∂p/∂pose = [−I₂ | (p_y, −p_x)], ∂p/∂l = Rᵀ, chained through the
        // bearing and range row gradients
        let d_bearing = [-py / range_sq, px / range_sq];
        let d_range = [px / range, py / range];

        let mut j_pose = DMatrix::zeros(2, 3);
        j_pose[(0, 0)] = -d_bearing[0];
        j_pose[(0, 1)] = -d_bearing[1];
        j_pose[(0, 2)] = d_bearing[0] * py - d_bearing[1] * px;
        j_pose[(1, 0)] = -d_range[0];
        j_pose[(1, 1)] = -d_range[1];
        j_pose[(1, 2)] = d_range[0] * py - d_range[1] * px;

        let mut j_landmark = DMatrix::zeros(2, 2);
        for col in 0..2 {
            j_landmark[(0, col)] =
                d_bearing[0] * rotation_t[(0, col)] + d_bearing[1] * rotation_t[(1, col)];
            j_landmark[(1, col)] =
                d_range[0] * rotation_t[(0, col)] + d_range[1] * rotation_t[(1, col)];
        }

        Ok((residual, vec![j_pose, j_landmark]))
    }
}
