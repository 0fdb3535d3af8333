//! Powell's dogleg trust region step.
//!
//! The dogleg path travels from the origin toward the Cauchy point (the
//! optimal steepest-descent step), then bends toward the Gauss-Newton point,
//! clipped to a spherical trust region of radius Δ:
//!
//! ```text
//! ‖δ_gn‖ ≤ Δ            →  δ = δ_gn
//! ‖δ_sd‖ ≥ Δ            →  δ = (Δ / ‖δ_sd‖) · δ_sd
//! otherwise             →  δ = δ_sd + β (δ_gn − δ_sd)  with ‖δ‖ = Δ
//! ```
//!
//! The interpolation parameter β solves `‖δ_sd + β·v‖² = Δ²`; two
//! algebraically equivalent formulas are used to avoid catastrophic
//! cancellation:
//!
//! ```text
//! b ≤ 0:  β = (−b + √(b² − a·c)) / a
//! b > 0:  β = −c / (b + √(b² − a·c))
//! ```
//!
//! The radius adapts on the gain ratio ρ = actual / predicted reduction:
//! shrink (×¼) when ρ < ¼, grow (×2, capped) when ρ > ¾ and the step hit the
//! boundary, and reject the retraction entirely when ρ ≤ 0, keeping the
//! previous step.

use tracing::debug;

use crate::core::vector_values::VectorValues;
use crate::error::TrellisResult;
use crate::optimizer::{DoglegAdaptationMode, DoglegParams};
use crate::tree::BayesTree;

/// Growth cap relative to the initial trust radius.
const RADIUS_GROWTH_CAP: f64 = 1e3;

/// Smallest radius worth retrying at.
const MIN_RADIUS: f64 = 1e-10;

/// Bound on trust-region iterations within one update.
const MAX_SEARCH_ITERATIONS: usize = 16;

/// Result of one dogleg trust-region pass.
#[derive(Debug, Clone)]
pub struct DoglegOutcome {
    /// The accepted step, or `None` if every candidate increased the error
    /// and the previous step is kept.
    pub step: Option<VectorValues>,
    /// The trust radius to carry into the next update.
    pub radius: f64,
}

/// Compute and adapt a dogleg step.
///
/// `delta_gn` and `delta_sd` are the Gauss-Newton and steepest-descent legs
/// in logical row order; `base_error` is the nonlinear error at the
/// linearization point and `nonlinear_error` evaluates candidates. The
/// quadratic model is read off the tree's conditionals.
pub fn dogleg_step<F>(
    params: &DoglegParams,
    radius: f64,
    tree: &BayesTree,
    delta_gn: &VectorValues,
    delta_sd: &VectorValues,
    base_error: f64,
    nonlinear_error: F,
) -> TrellisResult<DoglegOutcome>
where
    F: Fn(&VectorValues) -> TrellisResult<f64>,
{
    let radius_cap = params.initial_trust_radius * RADIUS_GROWTH_CAP;
    let model_at_zero = linear_error(tree, &delta_gn.zeros_like());

    let mut radius = radius;
    let mut fallback: Option<(VectorValues, f64)> = None;

    for iteration in 0..MAX_SEARCH_ITERATIONS {
        let (candidate, hit_boundary) = blend(delta_gn, delta_sd, radius);
        let predicted = model_at_zero - linear_error(tree, &candidate);
        let actual = base_error - nonlinear_error(&candidate)?;
        let rho = if predicted.abs() > 1e-15 {
            actual / predicted
        } else if actual >= 0.0 {
            1.0
        } else {
            -1.0
        };

        if params.verbose {
            debug!(
                "dogleg iter {}: radius {:.3e}, |step| {:.3e}, predicted {:.3e}, actual {:.3e}, rho {:.3}",
                iteration,
                radius,
                candidate.norm(),
                predicted,
                actual,
                rho
            );
        }

        if rho <= 0.0 {
            // The candidate made things worse; fall back to an earlier
            // acceptable step if the search produced one.
            if let Some((step, fallback_radius)) = fallback.take() {
                return Ok(DoglegOutcome {
                    step: Some(step),
                    radius: fallback_radius,
                });
            }
            radius *= 0.25;
            if params.adaptation_mode == DoglegAdaptationMode::OneStepPerIteration
                || radius < MIN_RADIUS
            {
                return Ok(DoglegOutcome { step: None, radius });
            }
            continue;
        }

        if rho > 0.75 {
            if hit_boundary
                && radius < radius_cap
                && params.adaptation_mode == DoglegAdaptationMode::SearchEachIteration
            {
                // A good boundary step: remember it and probe a larger radius.
                fallback = Some((candidate, radius));
                radius = (radius * 2.0).min(radius_cap);
                continue;
            }
            let next_radius = if hit_boundary {
                (radius * 2.0).min(radius_cap)
            } else {
                radius
            };
            return Ok(DoglegOutcome {
                step: Some(candidate),
                radius: next_radius,
            });
        }

        if rho < 0.25 {
            radius *= 0.25;
            if params.adaptation_mode != DoglegAdaptationMode::OneStepPerIteration
                && radius >= MIN_RADIUS
            {
                fallback = Some((candidate, radius));
                continue;
            }
            return Ok(DoglegOutcome {
                step: Some(candidate),
                radius,
            });
        }

        // Moderate gain: take the step, keep the radius.
        return Ok(DoglegOutcome {
            step: Some(candidate),
            radius,
        });
    }

    let step = fallback.map(|(step, _)| step);
    Ok(DoglegOutcome { step, radius })
}

/// The dogleg blend for a given radius; the flag reports whether the step
/// was clipped to the trust region boundary.
pub fn blend(
    delta_gn: &VectorValues,
    delta_sd: &VectorValues,
    radius: f64,
) -> (VectorValues, bool) {
    let gn_norm = delta_gn.norm();
    if gn_norm <= radius {
        return (delta_gn.clone(), false);
    }

    let sd_norm = delta_sd.norm();
    if sd_norm >= radius {
        return (delta_sd.scale(radius / sd_norm), true);
    }

    // On the segment δ_sd → δ_gn, solve ‖δ_sd + β·v‖² = Δ²
    let v = delta_gn.blend(1.0, delta_sd, -1.0);
    let a = v.dot(&v);
    let b = delta_sd.dot(&v);
    let c = sd_norm * sd_norm - radius * radius;
    let discriminant = (b * b - a * c).max(0.0).sqrt();
    let beta = if b <= 0.0 {
        (-b + discriminant) / a
    } else {
        -c / (b + discriminant)
    };

    (delta_sd.blend(1.0, &v, beta), true)
}

/// Total linear error `½‖R·δ − d‖²` of the tree at a logically ordered step.
pub fn linear_error(tree: &BayesTree, step: &VectorValues) -> f64 {
    tree.cliques()
        .iter()
        .map(|clique| {
            clique
                .borrow()
                .conditional()
                .error(|key| step.row(key).clone())
        })
        .sum()
}
