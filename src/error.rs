//! Error types for the trellis-isam library
//!
//! This module provides the main error and result types used throughout the
//! library. All errors use the `thiserror` crate for automatic trait
//! implementations.
//!
//! # Error Hierarchy
//!
//! The library uses a hierarchical error system where:
//! - **`TrellisError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`CoreError`, `LinAlgError`) are wrapped inside TrellisError
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Example error chain:
//! ```text
//! TrellisError::LinearAlgebra(
//!     LinAlgError::IndefiniteSystem { pivot: -3.1e-9, column: 14 }
//! )
//! ```

use crate::{core::CoreError, linalg::LinAlgError};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the trellis-isam library
pub type TrellisResult<T> = Result<T, TrellisError>;

/// Main error type for the trellis-isam library
///
/// This is the top-level error type exposed by public APIs. It wraps
/// module-specific errors while preserving the full error chain for debugging.
///
/// # Error Chain Access
///
/// You can access the full error chain using the `chain()` method:
///
/// ```rust,ignore
/// if let Err(e) = isam.update(new_factors, new_values) {
///     warn!("Update failed: {}", e.chain());
/// }
/// ```
#[derive(Debug, Clone, Error)]
pub enum TrellisError {
    /// Core module errors (keys, values, slots, dimensions)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Linear algebra errors (factorization, elimination)
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),
}

impl TrellisError {
    /// Get the full error chain as a string for logging and debugging.
    ///
    /// Traverses the error source chain and returns a formatted string showing
    /// the hierarchy of errors from the top-level TrellisError down to the
    /// root cause.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    ///
    /// Similar to `chain()` but formats as a single line with arrow separators.
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trellis_error_display() {
        let core_error = CoreError::DuplicateKey { key: 7 };
        let error = TrellisError::from(core_error);
        assert!(error.to_string().contains("7"));
    }

    #[test]
    fn test_trellis_error_chain_compact() {
        let linalg_error = LinAlgError::IndefiniteSystem {
            pivot: -1.0,
            column: 3,
        };
        let error = TrellisError::from(linalg_error);

        let chain_compact = error.chain_compact();
        assert!(chain_compact.contains("pivot"));
    }

    #[test]
    fn test_transparent_error_conversion() {
        let core_error = CoreError::UnknownSlot { slot: 42 };
        let trellis_error: TrellisError = core_error.into();
        match trellis_error {
            TrellisError::Core(_) => {}
            _ => panic!("Expected Core variant"),
        }
    }
}
