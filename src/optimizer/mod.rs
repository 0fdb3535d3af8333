//! Nonlinear step controllers.
//!
//! After each incremental re-elimination the engine computes a step in the
//! tangent space of the current linearization point and retracts the estimate
//! along it. Two strategies are available, fixed at engine construction:
//!
//! - **Gauss-Newton**: back-substitution through the Bayes tree, skipping
//!   cliques whose solution cannot have changed ([`gauss_newton`]).
//! - **Powell's dogleg**: a trust-region blend of the Gauss-Newton step and
//!   the steepest-descent (Cauchy) step ([`dog_leg`]).

use std::fmt;
use std::fmt::{Display, Formatter};

pub mod dog_leg;
pub mod gauss_newton;

pub use dog_leg::{DoglegOutcome, dogleg_step};
pub use gauss_newton::optimize_wildfire;

/// Trust region adaptation strategy for the dogleg controller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DoglegAdaptationMode {
    /// Re-blend after every radius change until the gain ratio is acceptable
    #[default]
    SearchEachIteration,
    /// Retry only on shrink; growth takes effect next update
    SearchReduceOnly,
    /// Adjust the radius once per update without retrying
    OneStepPerIteration,
}

impl Display for DoglegAdaptationMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DoglegAdaptationMode::SearchEachIteration => write!(f, "search each iteration"),
            DoglegAdaptationMode::SearchReduceOnly => write!(f, "search reduce only"),
            DoglegAdaptationMode::OneStepPerIteration => write!(f, "one step per iteration"),
        }
    }
}

/// Gauss-Newton controller parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussNewtonParams {
    /// Back-substitution stops descending into a subtree once the delta
    /// change stays below this threshold.
    pub wildfire_threshold: f64,
}

impl GaussNewtonParams {
    pub fn new(wildfire_threshold: f64) -> Self {
        debug_assert!(wildfire_threshold >= 0.0);
        GaussNewtonParams { wildfire_threshold }
    }
}

impl Default for GaussNewtonParams {
    fn default() -> Self {
        GaussNewtonParams {
            wildfire_threshold: 0.001,
        }
    }
}

/// Dogleg controller parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoglegParams {
    /// Initial trust region radius. Growth is capped at 10³ times this.
    pub initial_trust_radius: f64,
    /// How the radius adapts within one update.
    pub adaptation_mode: DoglegAdaptationMode,
    /// Emit a debug line per trust-region iteration.
    pub verbose: bool,
}

impl DoglegParams {
    pub fn new(initial_trust_radius: f64) -> Self {
        debug_assert!(initial_trust_radius > 0.0);
        DoglegParams {
            initial_trust_radius,
            ..Default::default()
        }
    }
}

impl Default for DoglegParams {
    fn default() -> Self {
        DoglegParams {
            initial_trust_radius: 1.0,
            adaptation_mode: DoglegAdaptationMode::default(),
            verbose: false,
        }
    }
}

/// Step strategy, fixed for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizationParams {
    /// Gauss-Newton with wildfire back-substitution
    GaussNewton(GaussNewtonParams),
    /// Powell's dogleg trust region method
    Dogleg(DoglegParams),
}

impl Default for OptimizationParams {
    fn default() -> Self {
        OptimizationParams::GaussNewton(GaussNewtonParams::default())
    }
}
