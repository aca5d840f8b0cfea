//! Sparse KAN convolution layer.
//!
//! # Mathematical Foundation
//!
//! For each kernel offset `k` with matched input/output site pairs, the
//! layer computes per pair:
//!
//! `y = flatten(B(x)) · Wsᵀ + act(x) · Wbᵀ`
//!
//! where:
//! - `x` is the gathered input feature row
//! - `B(x)` is the B-spline basis tensor on offset `k`'s adaptive grid
//! - `Ws` is offset `k`'s spline coefficient matrix, `Wb` its base matrix
//! - `act` is the configurable base activation (SiLU by default)
//!
//! and scatter-accumulates `y` into the output rows with sum semantics.
//!
//! # Weight Layout (Critical!)
//!
//! Row-Major `[Output, Input, Basis]`, flat:
//! - `spline_weight[(o * in_channels + c) * num_basis + j]`
//! - `base_weight[o * in_channels + c]`
//!
//! # State & Adaptation
//!
//! Grid and weights live in one [`OffsetState`] per kernel offset, so the
//! per-offset stage (gather, grid adapt, refit, branches) touches no shared
//! state and parallelizes without synchronization. Each offset writes its
//! contribution into a private buffer; buffers are reduced into the output
//! in ascending offset order, making accumulation order (and floating-point
//! rounding) reproducible across serial and parallel runs.
//!
//! When `adapt_grid` is enabled (the default), every forward call adapts
//! each matched offset's knot grid to the gathered data and refits the
//! spline coefficients by least squares so the learned functions survive the
//! knot move. Degenerate batches skip adaptation; failed refits keep the
//! previous coefficients. Both fallbacks are counted in [`ForwardStats`].

use log::{debug, warn};
use rayon::prelude::*;
use wide::f32x8;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::KanConvConfig;
use crate::error::{KanConvError, KanConvResult, PairSide};
use crate::grid::KnotGrid;
use crate::lstsq::{refit_spline_weight, LeastSquares, SvdSolver};
use crate::sparse::{
    output_spatial_shape, transposed_output_spatial_shape, IndicePairProvider, IndicePairSet,
    SparseConvTensor,
};
use crate::spline::{evaluate_basis, spline_output};

/// Grid and weights for one kernel offset.
///
/// Offsets never share mutable state: the layer holds one `OffsetState` per
/// offset, indexed by offset id.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OffsetState {
    grid: KnotGrid,
    /// Spline coefficients, flat `[out_channels][in_channels][num_basis]`.
    spline_weight: Vec<f32>,
    /// Base branch weights, flat `[out_channels][in_channels]`.
    base_weight: Vec<f32>,
}

impl OffsetState {
    /// This offset's knot grid.
    #[inline]
    pub fn grid(&self) -> &KnotGrid {
        &self.grid
    }

    /// Spline coefficients, flat `[out_channels][in_channels][num_basis]`.
    #[inline]
    pub fn spline_weight(&self) -> &[f32] {
        &self.spline_weight
    }

    /// Mutable spline coefficients (for an external optimizer).
    #[inline]
    pub fn spline_weight_mut(&mut self) -> &mut [f32] {
        &mut self.spline_weight
    }

    /// Base weights, flat `[out_channels][in_channels]`.
    #[inline]
    pub fn base_weight(&self) -> &[f32] {
        &self.base_weight
    }

    /// Mutable base weights (for an external optimizer).
    #[inline]
    pub fn base_weight_mut(&mut self) -> &mut [f32] {
        &mut self.base_weight
    }
}

/// Counters describing what the last forward call did.
///
/// Recoverable fallbacks (skipped grid updates, rejected refits) are
/// resolved locally and surface here rather than as errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Total matched pairs across all offsets.
    pub pairs_total: usize,
    /// Offsets with zero matched pairs (no-ops).
    pub empty_offsets: usize,
    /// Offsets whose grid was adapted.
    pub grid_updates_applied: usize,
    /// Offsets whose grid update was skipped (degenerate batch).
    pub grid_updates_skipped: usize,
    /// Offsets whose coefficients were refit after a grid change.
    pub refits_applied: usize,
    /// Offsets whose refit produced non-finite values and was discarded.
    pub refits_rejected: usize,
}

impl ForwardStats {
    fn merge(&mut self, other: &ForwardStats) {
        self.pairs_total += other.pairs_total;
        self.empty_offsets += other.empty_offsets;
        self.grid_updates_applied += other.grid_updates_applied;
        self.grid_updates_skipped += other.grid_updates_skipped;
        self.refits_applied += other.refits_applied;
        self.refits_rejected += other.refits_rejected;
    }
}

#[cfg(feature = "serde")]
fn default_solver() -> Box<dyn LeastSquares> {
    Box::new(SvdSolver::default())
}

/// Sparse N-D convolution with per-offset KAN spline functions.
#[derive(Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SparseKanConv {
    /// Layer configuration (immutable after construction).
    pub config: KanConvConfig,
    offsets: Vec<OffsetState>,
    bias: Vec<f32>,
    #[cfg_attr(feature = "serde", serde(skip, default = "default_solver"))]
    solver: Box<dyn LeastSquares>,
    #[cfg_attr(feature = "serde", serde(skip))]
    stats: ForwardStats,
}

impl SparseKanConv {
    /// Creates a layer with the default SVD least-squares backend.
    ///
    /// # Errors
    ///
    /// Returns [`KanConvError::Config`] when the configuration is invalid.
    pub fn new(config: KanConvConfig) -> KanConvResult<Self> {
        Self::with_solver(config, Box::new(SvdSolver::default()))
    }

    /// Creates a layer with a custom least-squares backend.
    pub fn with_solver(
        config: KanConvConfig,
        solver: Box<dyn LeastSquares>,
    ) -> KanConvResult<Self> {
        config.validate()?;

        let num_offsets = config.num_offsets();
        let in_ch = config.in_channels;
        let out_ch = config.out_channels;
        let num_basis = config.basis_size();
        let seed = config.init_seed.unwrap_or(0xB5ED_C0DE);

        let mut offsets = Vec::with_capacity(num_offsets);
        for k in 0..num_offsets {
            let salt = seed ^ (k as u64).wrapping_mul(0xD6E8_FEB8_6659_FD93);
            offsets.push(OffsetState {
                grid: KnotGrid::new(
                    config.grid_size,
                    config.spline_order,
                    config.grid_range,
                    in_ch,
                ),
                spline_weight: init_weights(
                    out_ch * in_ch * num_basis,
                    in_ch * num_basis,
                    out_ch,
                    salt,
                ),
                base_weight: init_weights(out_ch * in_ch, in_ch, out_ch, salt.rotate_left(17)),
            });
        }

        let bias = if config.bias {
            vec![0.0f32; out_ch]
        } else {
            Vec::new()
        };

        Ok(Self {
            config,
            offsets,
            bias,
            solver,
            stats: ForwardStats::default(),
        })
    }

    /// Number of kernel offsets (`∏ kernel_size[d]`).
    #[inline]
    pub fn num_offsets(&self) -> usize {
        self.offsets.len()
    }

    /// One offset's grid and weights.
    #[inline]
    pub fn offset(&self, k: usize) -> &OffsetState {
        &self.offsets[k]
    }

    /// Mutable access to one offset's state (for an external optimizer).
    #[inline]
    pub fn offset_mut(&mut self, k: usize) -> &mut OffsetState {
        &mut self.offsets[k]
    }

    /// Grid shape as `(num_offsets, in_channels, knots_per_channel)`.
    pub fn grid_shape(&self) -> (usize, usize, usize) {
        (
            self.offsets.len(),
            self.config.in_channels,
            self.config.knots_per_channel(),
        )
    }

    /// Spline weight shape as
    /// `(num_offsets, out_channels, in_channels * num_basis)`.
    pub fn spline_weight_shape(&self) -> (usize, usize, usize) {
        (
            self.offsets.len(),
            self.config.out_channels,
            self.config.in_channels * self.config.basis_size(),
        )
    }

    /// Base weight shape as `(num_offsets, out_channels, in_channels)`.
    pub fn base_weight_shape(&self) -> (usize, usize, usize) {
        (
            self.offsets.len(),
            self.config.out_channels,
            self.config.in_channels,
        )
    }

    /// Per-output-channel bias (empty when bias is disabled).
    #[inline]
    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// Mutable bias (for an external optimizer).
    #[inline]
    pub fn bias_mut(&mut self) -> &mut [f32] {
        &mut self.bias
    }

    /// Total trainable parameter count.
    pub fn param_count(&self) -> usize {
        self.offsets
            .iter()
            .map(|s| s.spline_weight.len() + s.base_weight.len())
            .sum::<usize>()
            + self.bias.len()
    }

    /// Counters from the most recent [`forward`](Self::forward) call.
    #[inline]
    pub fn last_forward_stats(&self) -> ForwardStats {
        self.stats
    }

    /// Runs one forward pass.
    ///
    /// Geometry (output coordinates, per-offset index pairs) comes from the
    /// external `geometry` oracle. The call is a single synchronous unit of
    /// work: it either returns the complete output tensor or a typed error
    /// before any output exists. Offsets with no matched pairs contribute
    /// nothing and leave their grid/weights untouched.
    ///
    /// # Errors
    ///
    /// - [`KanConvError::ShapeMismatch`] when the input tensor does not
    ///   match the configured channels/dimensions.
    /// - [`KanConvError::GeometryMismatch`] when a pair references a feature
    ///   row out of bounds (checked before any state is touched).
    /// - [`KanConvError::OffsetCountMismatch`] when the provider disagrees
    ///   with the configured kernel.
    pub fn forward(
        &mut self,
        input: &SparseConvTensor,
        geometry: &dyn IndicePairProvider,
    ) -> KanConvResult<SparseConvTensor> {
        let cfg = &self.config;
        if input.channels != cfg.in_channels {
            return Err(KanConvError::shape_mismatch(
                &[cfg.in_channels],
                &[input.channels],
            ));
        }
        if input.spatial_shape.len() != cfg.ndim {
            return Err(KanConvError::shape_mismatch(
                &[cfg.ndim],
                &[input.spatial_shape.len()],
            ));
        }

        let pair_set = geometry.compute_indice_pairs(
            &input.indices,
            input.batch_size,
            &input.spatial_shape,
            cfg,
        )?;
        if pair_set.num_offsets() != self.offsets.len() {
            return Err(KanConvError::OffsetCountMismatch {
                expected: self.offsets.len(),
                got: pair_set.num_offsets(),
            });
        }

        let num_in = input.num_active();
        let num_out = pair_set.num_out_active;
        validate_pairs(&pair_set, num_in, num_out)?;

        self.stats = ForwardStats {
            pairs_total: pair_set.total_pairs(),
            ..ForwardStats::default()
        };

        // Per-offset stage: no shared mutable state, so it fans out freely.
        let features = &input.features;
        let solver = self.solver.as_ref();
        let parallel = self.stats.pairs_total >= cfg.parallel_threshold;
        let results: Vec<(Option<Vec<f32>>, ForwardStats)> = if parallel {
            self.offsets
                .par_iter_mut()
                .enumerate()
                .map(|(k, state)| apply_offset(k, state, pair_set.pairs(k), features, cfg, solver))
                .collect()
        } else {
            self.offsets
                .iter_mut()
                .enumerate()
                .map(|(k, state)| apply_offset(k, state, pair_set.pairs(k), features, cfg, solver))
                .collect()
        };

        // Reduction: scatter each offset's private buffer in ascending
        // offset order. Pairs from different offsets hitting the same output
        // row accumulate; nothing overwrites.
        let out_ch = cfg.out_channels;
        let mut out_features = vec![0.0f32; num_out * out_ch];
        for (k, (contribution, delta)) in results.into_iter().enumerate() {
            self.stats.merge(&delta);
            if let Some(values) = contribution {
                for (p, &(_, out_row)) in pair_set.pairs(k).iter().enumerate() {
                    let dst = out_row as usize * out_ch;
                    for c in 0..out_ch {
                        out_features[dst + c] += values[p * out_ch + c];
                    }
                }
            }
        }

        if cfg.bias {
            for row in 0..num_out {
                for c in 0..out_ch {
                    out_features[row * out_ch + c] += self.bias[c];
                }
            }
        }

        let spatial_shape = if cfg.submanifold {
            input.spatial_shape.clone()
        } else if cfg.transposed {
            transposed_output_spatial_shape(
                &input.spatial_shape,
                &cfg.kernel_size,
                &cfg.stride,
                &cfg.padding,
                &cfg.dilation,
                &cfg.output_padding,
            )
        } else {
            output_spatial_shape(
                &input.spatial_shape,
                &cfg.kernel_size,
                &cfg.stride,
                &cfg.padding,
                &cfg.dilation,
            )
        };

        SparseConvTensor::new(
            out_features,
            out_ch,
            pair_set.out_indices,
            input.batch_size,
            spatial_shape,
        )
    }
}

/// Defensive bounds check of every pair against the feature arrays, before
/// any gather, adaptation, or scatter happens.
fn validate_pairs(pair_set: &IndicePairSet, num_in: usize, num_out: usize) -> KanConvResult<()> {
    for k in 0..pair_set.num_offsets() {
        for &(in_row, out_row) in pair_set.pairs(k) {
            if in_row as usize >= num_in {
                return Err(KanConvError::geometry_mismatch(
                    k,
                    PairSide::Input,
                    in_row as usize,
                    num_in,
                ));
            }
            if out_row as usize >= num_out {
                return Err(KanConvError::geometry_mismatch(
                    k,
                    PairSide::Output,
                    out_row as usize,
                    num_out,
                ));
            }
        }
    }
    Ok(())
}

/// One offset's gather → adapt → refit → compute step.
///
/// Returns the offset's private contribution buffer (`pairs.len() ×
/// out_channels`, in pair order) and the stat deltas. Zero pairs: no side
/// effects at all.
fn apply_offset(
    k: usize,
    state: &mut OffsetState,
    pairs: &[(u32, u32)],
    features: &[f32],
    cfg: &KanConvConfig,
    solver: &dyn LeastSquares,
) -> (Option<Vec<f32>>, ForwardStats) {
    let mut delta = ForwardStats::default();
    let n = pairs.len();
    if n == 0 {
        delta.empty_offsets = 1;
        return (None, delta);
    }

    let in_ch = cfg.in_channels;
    let out_ch = cfg.out_channels;
    let num_basis = cfg.basis_size();

    // Gather the matched input rows.
    let mut gathered = vec![0.0f32; n * in_ch];
    for (p, &(in_row, _)) in pairs.iter().enumerate() {
        let src = in_row as usize * in_ch;
        gathered[p * in_ch..(p + 1) * in_ch].copy_from_slice(&features[src..src + in_ch]);
    }

    let mut basis = None;
    if cfg.adapt_grid {
        if n >= cfg.grid_size + 1 {
            // The refit target is the old spline's output, evaluated before
            // the knot swap.
            let old_basis = evaluate_basis(&gathered, n, &state.grid);
            let update = state
                .grid
                .adapt(&gathered, n, cfg.grid_margin, cfg.grid_eps);
            if update.changed {
                delta.grid_updates_applied = 1;
                let y_old = spline_output(
                    &old_basis,
                    &state.spline_weight,
                    n,
                    in_ch,
                    num_basis,
                    out_ch,
                );
                let new_basis = evaluate_basis(&gathered, n, &state.grid);
                match refit_spline_weight(
                    &new_basis, &y_old, n, in_ch, num_basis, out_ch, solver,
                ) {
                    Some(weights) => {
                        state.spline_weight = weights;
                        delta.refits_applied = 1;
                    }
                    None => {
                        warn!(
                            "offset {}: refit produced non-finite coefficients, keeping previous",
                            k
                        );
                        delta.refits_rejected = 1;
                    }
                }
                basis = Some(new_basis);
            } else {
                delta.grid_updates_skipped = 1;
                basis = Some(old_basis);
            }
        } else {
            debug!(
                "offset {}: grid adapt skipped, batch {} < {}",
                k,
                n,
                cfg.grid_size + 1
            );
            delta.grid_updates_skipped = 1;
        }
    }
    let basis = basis.unwrap_or_else(|| evaluate_basis(&gathered, n, &state.grid));

    // Both branches per pair: spline over the flattened basis, base over the
    // activated raw inputs.
    let mut activated = vec![0.0f32; n * in_ch];
    for (a, &x) in activated.iter_mut().zip(gathered.iter()) {
        *a = cfg.base_activation.apply(x);
    }

    let flat = in_ch * num_basis;
    let mut contribution = vec![0.0f32; n * out_ch];
    for p in 0..n {
        let basis_row = &basis[p * flat..(p + 1) * flat];
        let act_row = &activated[p * in_ch..(p + 1) * in_ch];
        let dst = &mut contribution[p * out_ch..(p + 1) * out_ch];
        for (o, out) in dst.iter_mut().enumerate() {
            *out = dot_simd8(basis_row, &state.spline_weight[o * flat..(o + 1) * flat])
                + dot_simd8(act_row, &state.base_weight[o * in_ch..(o + 1) * in_ch]);
        }
    }

    (Some(contribution), delta)
}

/// SIMD dot product: 8-wide lanes with a scalar tail.
#[inline]
fn dot_simd8(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let chunks = a.len() / 8;
    let mut acc = f32x8::splat(0.0);
    for i in 0..chunks {
        let mut av = [0.0f32; 8];
        let mut bv = [0.0f32; 8];
        av.copy_from_slice(&a[i * 8..i * 8 + 8]);
        bv.copy_from_slice(&b[i * 8..i * 8 + 8]);
        acc += f32x8::new(av) * f32x8::new(bv);
    }

    let arr: [f32; 8] = acc.into();
    let mut sum: f32 = arr.iter().sum();
    for i in chunks * 8..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// Deterministic Xavier-style initialization.
fn init_weights(len: usize, fan_in: usize, fan_out: usize, salt: u64) -> Vec<f32> {
    let scale = (2.0 / (fan_in + fan_out) as f32).sqrt() * 0.1;
    (0..len as u64)
        .map(|i| {
            let h = i
                .wrapping_add(salt.wrapping_mul(0x9E37_79B9_7F4A_7C15))
                .wrapping_mul(2_654_435_761);
            ((h % 1000) as f32 / 1000.0 - 0.5) * scale
        })
        .collect()
}
