//! Core components of the incremental smoothing engine
//!
//! This module contains the fundamental building blocks shared by the rest of
//! the crate:
//! - Variable keys and debug formatting
//! - Manifold-valued variables and the nonlinear estimate
//! - Diagonal measurement noise models
//! - The elimination ordering and its permutation machinery
//! - Per-variable tangent vectors and their permuted views
//! - The slot-indexed nonlinear factor store

pub mod factor_store;
pub mod key;
pub mod noise;
pub mod ordering;
pub mod values;
pub mod vector_values;

use thiserror::Error;
use tracing::error;

use crate::core::key::Key;

/// Core module error types for keys, values, slots and dimensions
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A key was inserted that already exists, or a constrained key is unknown
    #[error("Duplicate key: {key}")]
    DuplicateKey { key: Key },

    /// A key was looked up that does not exist
    #[error("Unknown key: {key}")]
    UnknownKey { key: Key },

    /// A factor slot is dead or out of range
    #[error("Unknown factor slot: {slot}")]
    UnknownSlot { slot: usize },

    /// A linearized factor block disagrees with a variable's dimension
    #[error("Inconsistent dimensions: {0}")]
    InconsistentDims(String),

    /// A variable's stored kind does not match what an operation expects
    #[error("Variable type mismatch: {0}")]
    TypeMismatch(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
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

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
