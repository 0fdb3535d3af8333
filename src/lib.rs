//! # Trellis iSAM
//!
//! An incremental smoothing and mapping engine for nonlinear factor graphs,
//! designed for online SLAM and estimation workloads where measurements
//! arrive continuously and re-solving from scratch is too expensive.
//!
//! ## Features
//!
//! - **Incremental inference**: a Bayes tree of Gaussian conditionals is
//!   updated in place; each update re-eliminates only the sub-tree affected
//!   by new information
//! - **Two step controllers**: Gauss-Newton with partial ("wildfire")
//!   back-substitution, or Powell's dogleg trust region method
//! - **Two factorization kernels**: dense partial Cholesky (fast) or
//!   Householder QR (robust for ill-conditioned systems)
//! - **Fluid relinearization**: variables whose accumulated delta exceeds a
//!   threshold are relinearized on the fly
//! - **Factor removal**: measurements can be retired or swapped after the
//!   fact, with the estimate recomputed consistently
//!
//! ## Usage
//!
//! Build factors over keyed variables, feed them to [`Isam::update`] batch
//! by batch, and read the estimate back with [`Isam::calculate_estimate`]:
//!
//! ```
//! use trellis_isam::{
//!     BetweenFactor, DiagonalNoise, Factor, Isam, PriorFactor, SE2, Value,
//!     Values,
//! };
//!
//! let mut isam = Isam::default();
//! let noise = DiagonalNoise::from_sigmas(&[0.1, 0.1, 0.01]);
//!
//! // Anchor the first pose
//! let mut init = Values::new();
//! init.insert(0, Value::Pose2(SE2::from_xy_angle(0.01, 0.01, 0.0))).unwrap();
//! let prior = Factor::Prior(PriorFactor::new(
//!     0,
//!     Value::Pose2(SE2::identity()),
//!     noise.clone(),
//! ));
//! isam.update(vec![prior], init).unwrap();
//!
//! // Drive forward one meter
//! let mut init = Values::new();
//! init.insert(1, Value::Pose2(SE2::from_xy_angle(1.1, -0.1, 0.0))).unwrap();
//! let odometry = Factor::Between(BetweenFactor::new(
//!     0,
//!     1,
//!     SE2::from_xy_angle(1.0, 0.0, 0.0),
//!     noise,
//! ));
//! isam.update(vec![odometry], init).unwrap();
//!
//! let estimate = isam.calculate_estimate().unwrap();
//! assert_eq!(estimate.len(), 2);
//! ```

pub mod core;
pub mod error;
pub mod factors;
pub mod isam;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod manifold;
pub mod optimizer;
pub mod tree;

// Re-export core types
pub use crate::core::factor_store::FactorStore;
pub use crate::core::key::{Key, KeyFormatter, default_key_formatter};
pub use crate::core::noise::DiagonalNoise;
pub use crate::core::ordering::{Ordering, Permutation};
pub use crate::core::values::{Value, Values};
pub use crate::core::vector_values::{PermutedVectorValues, VectorValues};
pub use error::{TrellisError, TrellisResult};

// Re-export factor types
pub use factors::{BearingRangeFactor, BetweenFactor, Factor, PriorFactor};

// Re-export the engine and its configuration
pub use isam::{Isam, IsamParams, UpdateResult};
pub use linalg::{
    Factorization, GaussianBayesNet, GaussianConditional, GaussianFactor,
    HessianFactor, JacobianFactor, eliminate_sequential,
};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::SE2;
pub use optimizer::{
    DoglegAdaptationMode, DoglegParams, GaussNewtonParams, OptimizationParams,
};
pub use tree::{BayesTree, Clique, SharedClique};
