//! # sparkan - Sparse Kolmogorov-Arnold Convolution
//!
//! A sparse N-dimensional convolution whose kernel applies, per offset and
//! per input channel, a learnable B-spline function (KAN-style) plus a
//! linear base branch. Knot grids adapt online to the data routed through
//! each kernel offset, with least-squares coefficient refitting so the
//! learned functions survive every grid change.
//!
//! ## Architecture
//! - Per-offset state array: grid + weights indexed by kernel offset, so
//!   offsets adapt and compute without shared mutable state
//! - Row-Major weight layout: `[Output, Input, Basis]`
//! - Private per-offset contribution buffers, reduced in offset order for
//!   reproducible accumulation
//! - Geometry (index pairs, output coordinates) supplied by an external
//!   engine behind [`IndicePairProvider`]
//!
//! ## Usage
//! ```rust,ignore
//! use sparkan::{KanConvConfig, SparseKanConv, SparseConvTensor};
//!
//! let config = KanConvConfig::builder()
//!     .ndim(3)
//!     .in_channels(3)
//!     .out_channels(5)
//!     .kernel_size(3)
//!     .build()?;
//! let mut layer = SparseKanConv::new(config)?;
//!
//! // `geometry` is your sparse-geometry engine (IndicePairProvider).
//! let output = layer.forward(&input, &geometry)?;
//! ```

pub mod config;
pub mod error;
pub mod grid;
pub mod layer;
pub mod lstsq;
pub mod sparse;
pub mod spline;

// Re-exports
pub use config::{
    BaseActivation, ConfigError, KanConvConfig, KanConvConfigBuilder, DEFAULT_GRID_EPS,
    DEFAULT_GRID_MARGIN, DEFAULT_GRID_SIZE, DEFAULT_SPLINE_ORDER, EPSILON,
};
pub use error::{KanConvError, KanConvResult, PairSide};
pub use grid::{GridUpdate, KnotGrid};
pub use layer::{ForwardStats, OffsetState, SparseKanConv};
pub use lstsq::{refit_spline_weight, LeastSquares, SvdSolver};
pub use sparse::{
    output_spatial_shape, transposed_output_spatial_shape, IndicePairProvider, IndicePairSet,
    SparseConvTensor,
};
pub use spline::{evaluate_basis, spline_output};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
