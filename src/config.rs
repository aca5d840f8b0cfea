//! Layer configuration and hyperparameters.
//!
//! This module provides [`KanConvConfig`] for configuring a sparse KAN
//! convolution layer: channel counts, N-dimensional kernel geometry, and the
//! B-spline grid parameters that control the per-offset spline functions.
//!
//! # Example
//!
//! ```rust
//! use sparkan::KanConvConfig;
//!
//! // 3D submanifold convolution, 3 -> 5 channels, cubic splines
//! let config = KanConvConfig::builder()
//!     .ndim(3)
//!     .in_channels(3)
//!     .out_channels(5)
//!     .kernel_size(3)
//!     .submanifold(true)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.num_offsets(), 27);
//! assert_eq!(config.basis_size(), 8); // grid_size 5 + order 3
//! ```
//!
//! # Spline Parameters
//!
//! | Parameter | Typical Values | Effect |
//! |-----------|---------------|--------|
//! | `grid_size` | 3-16 | More intervals = finer control, more params |
//! | `spline_order` | 0-5 | Higher = smoother functions, more compute |
//! | `grid_eps` | 0.0-1.0 | 1.0 = uniform knots, 0.0 = pure quantile knots |
//!
//! **Recommended**: `grid_size=5`, `spline_order=3` (cubic).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Minimum denominator magnitude in spline and normalization arithmetic.
pub const EPSILON: f32 = 1e-6;

/// Default grid size (number of spline intervals).
pub const DEFAULT_GRID_SIZE: usize = 5;

/// Default spline order (cubic).
pub const DEFAULT_SPLINE_ORDER: usize = 3;

/// Default blend factor between uniform and quantile knot placement.
pub const DEFAULT_GRID_EPS: f32 = 0.02;

/// Default margin added around the observed value range during adaptation.
pub const DEFAULT_GRID_MARGIN: f32 = 0.01;

/// Computes the number of basis functions for given spline parameters.
///
/// For `grid_size` intervals and polynomial `order`, a B-spline basis has
/// `grid_size + order` functions.
///
/// ```rust
/// use sparkan::config::basis_size;
/// assert_eq!(basis_size(5, 3), 8);
/// ```
#[inline]
pub const fn basis_size(grid_size: usize, spline_order: usize) -> usize {
    grid_size + spline_order
}

/// Computes the knot count per channel: interior breakpoints plus
/// `spline_order` padding knots on each side.
///
/// ```rust
/// use sparkan::config::knots_per_channel;
/// assert_eq!(knots_per_channel(5, 3), 12);
/// ```
#[inline]
pub const fn knots_per_channel(grid_size: usize, spline_order: usize) -> usize {
    grid_size + 2 * spline_order + 1
}

/// Expands a scalar convolution parameter to one value per spatial dimension.
#[inline]
pub fn expand_nd(ndim: usize, value: usize) -> Vec<usize> {
    vec![value; ndim]
}

/// Elementwise nonlinearity applied to the base (linear) branch input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BaseActivation {
    /// Smooth gated linear unit `x * sigmoid(x)` (default).
    #[default]
    Silu,
    /// Rectified linear unit.
    Relu,
    /// Gaussian error linear unit (tanh approximation).
    Gelu,
    /// Hyperbolic tangent.
    Tanh,
    /// Pass-through.
    Identity,
}

impl BaseActivation {
    /// Applies the activation to a single value.
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            BaseActivation::Silu => x / (1.0 + (-x).exp()),
            BaseActivation::Relu => x.max(0.0),
            BaseActivation::Gelu => {
                let inner = 0.797_884_6 * (x + 0.044_715 * x * x * x);
                0.5 * x * (1.0 + inner.tanh())
            }
            BaseActivation::Tanh => x.tanh(),
            BaseActivation::Identity => x,
        }
    }
}

/// Sparse KAN convolution configuration.
///
/// All N-dimensional parameters (`kernel_size`, `stride`, ...) hold one value
/// per spatial dimension; the [builder](Self::builder) accepts scalars and
/// expands them. Always [`validate`](Self::validate) before constructing a
/// layer; [`SparseKanConv::new`](crate::SparseKanConv::new) does so for you.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KanConvConfig {
    /// Number of spatial dimensions.
    pub ndim: usize,

    /// Input feature channels.
    pub in_channels: usize,

    /// Output feature channels.
    pub out_channels: usize,

    /// Kernel extent per spatial dimension.
    pub kernel_size: Vec<usize>,

    /// Stride per spatial dimension.
    pub stride: Vec<usize>,

    /// Zero-padding per spatial dimension.
    pub padding: Vec<usize>,

    /// Dilation per spatial dimension.
    pub dilation: Vec<usize>,

    /// Output padding per spatial dimension (transposed mode only).
    pub output_padding: Vec<usize>,

    /// Submanifold mode: the output active set equals the input active set.
    pub submanifold: bool,

    /// Transposed (deconvolution) mode.
    pub transposed: bool,

    /// Learnable per-output-channel bias added after accumulation.
    pub bias: bool,

    /// Number of spline grid intervals.
    pub grid_size: usize,

    /// Spline order (3 = cubic). Order 0 gives piecewise-constant splines.
    pub spline_order: usize,

    /// Initial knot range `(min, max)`.
    pub grid_range: (f32, f32),

    /// Blend factor between uniform (1.0) and quantile (0.0) knot placement
    /// during adaptation.
    pub grid_eps: f32,

    /// Margin added below/above the observed range during adaptation.
    pub grid_margin: f32,

    /// Whether forward passes adapt the knot grid to the observed data and
    /// refit the spline coefficients. Default `true`, matching the reference
    /// behavior of adapting on every call; set to `false` to freeze the layer
    /// for pure inference.
    pub adapt_grid: bool,

    /// Nonlinearity for the base branch.
    pub base_activation: BaseActivation,

    /// Minimum total matched-pair count before kernel offsets are processed
    /// in parallel.
    pub parallel_threshold: usize,

    /// Optional seed for deterministic weight initialization (None => fixed
    /// internal seed).
    pub init_seed: Option<u64>,
}

impl Default for KanConvConfig {
    fn default() -> Self {
        Self {
            ndim: 3,
            in_channels: 3,
            out_channels: 5,
            kernel_size: vec![3; 3],
            stride: vec![1; 3],
            padding: vec![0; 3],
            dilation: vec![1; 3],
            output_padding: vec![0; 3],
            submanifold: false,
            transposed: false,
            bias: false,
            grid_size: DEFAULT_GRID_SIZE,
            spline_order: DEFAULT_SPLINE_ORDER,
            grid_range: (-1.0, 1.0),
            grid_eps: DEFAULT_GRID_EPS,
            grid_margin: DEFAULT_GRID_MARGIN,
            adapt_grid: true,
            base_activation: BaseActivation::Silu,
            parallel_threshold: 4096,
            init_seed: None,
        }
    }
}

impl KanConvConfig {
    /// Returns a builder seeded with the default configuration.
    pub fn builder() -> KanConvConfigBuilder {
        KanConvConfigBuilder {
            config: Self::default(),
            scalar_kernel: None,
            scalar_stride: None,
            scalar_padding: None,
            scalar_dilation: None,
            scalar_output_padding: None,
        }
    }

    /// Number of kernel offsets: the product of the kernel extents.
    ///
    /// Derived from the configured kernel for any dimensionality
    /// (`3^3 = 27` for the common cubic 3D kernel).
    #[inline]
    pub fn num_offsets(&self) -> usize {
        self.kernel_size.iter().product()
    }

    /// Number of basis functions per channel: `grid_size + spline_order`.
    #[inline]
    pub fn basis_size(&self) -> usize {
        basis_size(self.grid_size, self.spline_order)
    }

    /// Knot count per channel: `grid_size + 2*spline_order + 1`.
    #[inline]
    pub fn knots_per_channel(&self) -> usize {
        knots_per_channel(self.grid_size, self.spline_order)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `ndim` or a channel count is zero
    /// - any `kernel_size`/`stride`/`dilation` entry is zero
    /// - an N-D parameter length does not match `ndim`
    /// - `grid_size` is zero
    /// - `grid_range.0 >= grid_range.1`
    /// - `grid_eps` is outside `[0, 1]` or `grid_margin` is negative
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ndim == 0 {
            return Err(ConfigError::InvalidDimension("ndim must be > 0"));
        }
        if self.in_channels == 0 {
            return Err(ConfigError::InvalidDimension("in_channels must be > 0"));
        }
        if self.out_channels == 0 {
            return Err(ConfigError::InvalidDimension("out_channels must be > 0"));
        }
        for (name, param) in [
            ("kernel_size", &self.kernel_size),
            ("stride", &self.stride),
            ("padding", &self.padding),
            ("dilation", &self.dilation),
            ("output_padding", &self.output_padding),
        ] {
            if param.len() != self.ndim {
                return Err(ConfigError::MismatchedNdParam {
                    param: name,
                    expected: self.ndim,
                    got: param.len(),
                });
            }
        }
        if self.kernel_size.iter().any(|&k| k == 0) {
            return Err(ConfigError::InvalidKernel(self.kernel_size.clone()));
        }
        if self.stride.iter().any(|&s| s == 0) {
            return Err(ConfigError::InvalidDimension("stride entries must be > 0"));
        }
        if self.dilation.iter().any(|&d| d == 0) {
            return Err(ConfigError::InvalidDimension(
                "dilation entries must be > 0",
            ));
        }
        if self.grid_size == 0 {
            return Err(ConfigError::InvalidGridSize(self.grid_size));
        }
        if !self.grid_range.0.is_finite()
            || !self.grid_range.1.is_finite()
            || self.grid_range.0 >= self.grid_range.1
        {
            return Err(ConfigError::InvalidGridRange);
        }
        if !(0.0..=1.0).contains(&self.grid_eps) {
            return Err(ConfigError::InvalidGridEps(self.grid_eps));
        }
        if !self.grid_margin.is_finite() || self.grid_margin < 0.0 {
            return Err(ConfigError::InvalidGridMargin(self.grid_margin));
        }
        Ok(())
    }
}

/// Builder for [`KanConvConfig`].
///
/// Scalar N-D parameters are expanded to `ndim` entries at
/// [`build`](Self::build) time, so `ndim` may be set in any order.
#[derive(Debug, Clone)]
pub struct KanConvConfigBuilder {
    config: KanConvConfig,
    scalar_kernel: Option<usize>,
    scalar_stride: Option<usize>,
    scalar_padding: Option<usize>,
    scalar_dilation: Option<usize>,
    scalar_output_padding: Option<usize>,
}

impl KanConvConfigBuilder {
    /// Number of spatial dimensions.
    pub fn ndim(mut self, ndim: usize) -> Self {
        self.config.ndim = ndim;
        self
    }

    /// Input channels.
    pub fn in_channels(mut self, c: usize) -> Self {
        self.config.in_channels = c;
        self
    }

    /// Output channels.
    pub fn out_channels(mut self, c: usize) -> Self {
        self.config.out_channels = c;
        self
    }

    /// Uniform kernel extent for every spatial dimension.
    pub fn kernel_size(mut self, k: usize) -> Self {
        self.scalar_kernel = Some(k);
        self
    }

    /// Per-dimension kernel extents.
    pub fn kernel_size_nd(mut self, k: Vec<usize>) -> Self {
        self.scalar_kernel = None;
        self.config.kernel_size = k;
        self
    }

    /// Uniform stride.
    pub fn stride(mut self, s: usize) -> Self {
        self.scalar_stride = Some(s);
        self
    }

    /// Per-dimension strides.
    pub fn stride_nd(mut self, s: Vec<usize>) -> Self {
        self.scalar_stride = None;
        self.config.stride = s;
        self
    }

    /// Uniform padding.
    pub fn padding(mut self, p: usize) -> Self {
        self.scalar_padding = Some(p);
        self
    }

    /// Per-dimension padding.
    pub fn padding_nd(mut self, p: Vec<usize>) -> Self {
        self.scalar_padding = None;
        self.config.padding = p;
        self
    }

    /// Uniform dilation.
    pub fn dilation(mut self, d: usize) -> Self {
        self.scalar_dilation = Some(d);
        self
    }

    /// Per-dimension dilation.
    pub fn dilation_nd(mut self, d: Vec<usize>) -> Self {
        self.scalar_dilation = None;
        self.config.dilation = d;
        self
    }

    /// Uniform output padding (transposed mode).
    pub fn output_padding(mut self, p: usize) -> Self {
        self.scalar_output_padding = Some(p);
        self
    }

    /// Submanifold mode.
    pub fn submanifold(mut self, on: bool) -> Self {
        self.config.submanifold = on;
        self
    }

    /// Transposed mode.
    pub fn transposed(mut self, on: bool) -> Self {
        self.config.transposed = on;
        self
    }

    /// Per-output-channel bias.
    pub fn bias(mut self, on: bool) -> Self {
        self.config.bias = on;
        self
    }

    /// Spline grid intervals.
    pub fn grid_size(mut self, g: usize) -> Self {
        self.config.grid_size = g;
        self
    }

    /// Spline order.
    pub fn spline_order(mut self, k: usize) -> Self {
        self.config.spline_order = k;
        self
    }

    /// Initial knot range.
    pub fn grid_range(mut self, min: f32, max: f32) -> Self {
        self.config.grid_range = (min, max);
        self
    }

    /// Uniform/quantile blend factor for grid adaptation.
    pub fn grid_eps(mut self, eps: f32) -> Self {
        self.config.grid_eps = eps;
        self
    }

    /// Margin around the observed range during adaptation.
    pub fn grid_margin(mut self, margin: f32) -> Self {
        self.config.grid_margin = margin;
        self
    }

    /// Enable or freeze grid adaptation.
    pub fn adapt_grid(mut self, on: bool) -> Self {
        self.config.adapt_grid = on;
        self
    }

    /// Base-branch activation.
    pub fn base_activation(mut self, act: BaseActivation) -> Self {
        self.config.base_activation = act;
        self
    }

    /// Pair-count threshold for parallel offset processing.
    pub fn parallel_threshold(mut self, t: usize) -> Self {
        self.config.parallel_threshold = t;
        self
    }

    /// Seed for deterministic weight initialization.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.init_seed = Some(seed);
        self
    }

    /// Expands scalar N-D parameters, validates, and returns the config.
    pub fn build(mut self) -> Result<KanConvConfig, ConfigError> {
        let ndim = self.config.ndim;
        if let Some(k) = self.scalar_kernel {
            self.config.kernel_size = expand_nd(ndim, k);
        }
        if let Some(s) = self.scalar_stride {
            self.config.stride = expand_nd(ndim, s);
        }
        if let Some(p) = self.scalar_padding {
            self.config.padding = expand_nd(ndim, p);
        }
        if let Some(d) = self.scalar_dilation {
            self.config.dilation = expand_nd(ndim, d);
        }
        if let Some(p) = self.scalar_output_padding {
            self.config.output_padding = expand_nd(ndim, p);
        }
        // Defaulted uniform vectors track an ndim change; explicit
        // per-dimension settings of the wrong length still fail validation.
        for param in [
            &mut self.config.kernel_size,
            &mut self.config.stride,
            &mut self.config.padding,
            &mut self.config.dilation,
            &mut self.config.output_padding,
        ] {
            if param.len() != ndim && param.windows(2).all(|w| w[0] == w[1]) {
                let v = param.first().copied().unwrap_or(0);
                *param = expand_nd(ndim, v);
            }
        }
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Errors returned by [`KanConvConfig::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A dimension parameter is invalid (zero or mismatched).
    #[error("Invalid dimension: {0}")]
    InvalidDimension(&'static str),

    /// Grid size must be at least 1.
    #[error("Grid size must be >= 1, got {0}")]
    InvalidGridSize(usize),

    /// A kernel extent is zero.
    #[error("Invalid kernel size {0:?}: extents must be >= 1")]
    InvalidKernel(Vec<usize>),

    /// Grid range is invalid (min >= max or non-finite).
    #[error("Invalid grid range")]
    InvalidGridRange,

    /// Grid blend factor outside `[0, 1]`.
    #[error("grid_eps must be in [0, 1], got {0}")]
    InvalidGridEps(f32),

    /// Negative or non-finite adaptation margin.
    #[error("grid_margin must be finite and >= 0, got {0}")]
    InvalidGridMargin(f32),

    /// An N-D parameter does not have one entry per spatial dimension.
    #[error("{param} must have {expected} entries, got {got}")]
    MismatchedNdParam {
        /// Parameter name.
        param: &'static str,
        /// Expected entry count (`ndim`).
        expected: usize,
        /// Actual entry count.
        got: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KanConvConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_offsets(), 27);
        assert_eq!(config.basis_size(), 8);
        assert_eq!(config.knots_per_channel(), 12);
    }

    #[test]
    fn test_builder_scalar_expansion() {
        let config = KanConvConfig::builder()
            .ndim(2)
            .kernel_size(5)
            .stride(2)
            .build()
            .unwrap();
        assert_eq!(config.kernel_size, vec![5, 5]);
        assert_eq!(config.stride, vec![2, 2]);
        assert_eq!(config.num_offsets(), 25);
    }

    #[test]
    fn test_builder_ndim_change_resizes_defaults() {
        // ndim=4 with default (3-entry) vectors must still build.
        let config = KanConvConfig::builder().ndim(4).build().unwrap();
        assert_eq!(config.kernel_size.len(), 4);
        assert_eq!(config.num_offsets(), 81);
    }

    #[test]
    fn test_anisotropic_kernel() {
        let config = KanConvConfig::builder()
            .ndim(3)
            .kernel_size_nd(vec![3, 1, 3])
            .build()
            .unwrap();
        assert_eq!(config.num_offsets(), 9);
    }

    #[test]
    fn test_invalid_grid_size() {
        let mut config = KanConvConfig::default();
        config.grid_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGridSize(0))
        ));
    }

    #[test]
    fn test_invalid_grid_range() {
        let mut config = KanConvConfig::default();
        config.grid_range = (1.0, -1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_grid_eps() {
        let mut config = KanConvConfig::default();
        config.grid_eps = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mismatched_nd_param() {
        let mut config = KanConvConfig::default();
        config.kernel_size = vec![3, 3];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("kernel_size"));
    }

    #[test]
    fn test_order_zero_is_valid() {
        let config = KanConvConfig::builder().spline_order(0).build().unwrap();
        assert_eq!(config.basis_size(), config.grid_size);
        assert_eq!(config.knots_per_channel(), config.grid_size + 1);
    }

    #[test]
    fn test_activations_finite() {
        for act in [
            BaseActivation::Silu,
            BaseActivation::Relu,
            BaseActivation::Gelu,
            BaseActivation::Tanh,
            BaseActivation::Identity,
        ] {
            for x in [-10.0f32, -1.0, 0.0, 1.0, 10.0] {
                assert!(act.apply(x).is_finite());
            }
        }
    }

    #[test]
    fn test_silu_matches_definition() {
        let x = 0.7f32;
        let expected = x * (1.0 / (1.0 + (-x).exp()));
        assert!((BaseActivation::Silu.apply(x) - expected).abs() < 1e-6);
    }
}
