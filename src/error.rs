//! Unified error types for sparkan.
//!
//! This module provides [`KanConvError`], the error type surfaced by layer
//! construction and forward passes. It uses the `thiserror` crate for
//! ergonomic error handling.
//!
//! Recoverable numerical conditions (a degenerate adaptation batch, a
//! non-finite least-squares solution) are *not* errors: they resolve locally
//! by retaining prior state and are reported through
//! [`ForwardStats`](crate::ForwardStats) and the `log` facade.
//!
//! # Example
//!
//! ```rust
//! use sparkan::KanConvError;
//!
//! fn check_channels(expected: usize, got: usize) -> Result<(), KanConvError> {
//!     if expected != got {
//!         return Err(KanConvError::shape_mismatch(&[expected], &[got]));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::config::ConfigError;

/// Which bound an out-of-range indice pair violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSide {
    /// The pair's input row exceeds the input feature rows.
    Input,
    /// The pair's output row exceeds the allocated output rows.
    Output,
}

impl std::fmt::Display for PairSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairSide::Input => write!(f, "input"),
            PairSide::Output => write!(f, "output"),
        }
    }
}

/// Unified error type for sparse KAN convolution operations.
#[derive(Error, Debug)]
pub enum KanConvError {
    /// Configuration rejected at construction.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Shape mismatch between expected and actual tensor shapes.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected tensor shape.
        expected: Vec<usize>,
        /// Actual tensor shape received.
        got: Vec<usize>,
    },

    /// An indice pair references a feature row outside the allocated arrays.
    ///
    /// Raised by the defensive bounds check before any gather or scatter;
    /// out-of-range geometry is never clamped.
    #[error("Geometry mismatch at offset {offset}: {side} row {row} out of bounds (rows: {rows})")]
    GeometryMismatch {
        /// Kernel offset whose pair list is invalid.
        offset: usize,
        /// Which side of the pair violated its bound.
        side: PairSide,
        /// The offending feature row.
        row: usize,
        /// The number of allocated rows.
        rows: usize,
    },

    /// The geometry provider returned pair lists for the wrong offset count.
    #[error("Geometry provider returned {got} offset pair lists, layer has {expected}")]
    OffsetCountMismatch {
        /// Offset count the layer was built for.
        expected: usize,
        /// Offset count the provider returned.
        got: usize,
    },

    /// Geometry provider failure.
    #[error("Geometry provider error: {0}")]
    Geometry(String),
}

/// Result type alias for sparse KAN convolution operations.
pub type KanConvResult<T> = Result<T, KanConvError>;

impl KanConvError {
    /// Creates a shape mismatch error.
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        KanConvError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Creates a geometry mismatch error for an out-of-bounds pair.
    pub fn geometry_mismatch(offset: usize, side: PairSide, row: usize, rows: usize) -> Self {
        KanConvError::GeometryMismatch {
            offset,
            side,
            row,
            rows,
        }
    }

    /// Creates a geometry provider error.
    pub fn geometry<S: Into<String>>(msg: S) -> Self {
        KanConvError::Geometry(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = KanConvError::shape_mismatch(&[20, 3], &[20, 4]);
        let msg = err.to_string();
        assert!(msg.contains("Shape mismatch"));
        assert!(msg.contains("[20, 3]"));
        assert!(msg.contains("[20, 4]"));
    }

    #[test]
    fn test_geometry_mismatch_message() {
        let err = KanConvError::geometry_mismatch(13, PairSide::Output, 42, 40);
        let msg = err.to_string();
        assert!(msg.contains("offset 13"));
        assert!(msg.contains("output row 42"));
        assert!(msg.contains("40"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: KanConvError = ConfigError::InvalidGridSize(0).into();
        assert!(err.to_string().contains("Configuration error"));
    }
}
