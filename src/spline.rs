//! B-spline basis evaluation.
//!
//! This module evaluates, for one kernel offset's [`KnotGrid`], the full
//! basis tensor of a batch of inputs: `[batch × in_channels ×
//! (grid_size + spline_order)]`. The least-squares refit uses this tensor as
//! its design matrix, and the spline branch of the convolution contracts it
//! with the coefficient matrix.
//!
//! # Cox–de Boor, iteratively
//!
//! Order-0 bases are indicator functions of half-open knot intervals:
//!
//! $$B_{i,0}(x) = \begin{cases} 1 & t_i \leq x < t_{i+1} \\ 0 & \text{otherwise} \end{cases}$$
//!
//! Each higher order blends two lower-order bases weighted by position in the
//! relevant knot span:
//!
//! $$B_{i,k}(x) = \frac{x - t_i}{t_{i+k} - t_i} B_{i,k-1}(x) + \frac{t_{i+k+1} - x}{t_{i+k+1} - t_{i+1}} B_{i+1,k-1}(x)$$
//!
//! The recursion is run as a loop over the order with two rolling buffers
//! (previous order, current order), so the coincident-knot case (a zero-width
//! span, whose blend term must be exactly `0`, not `NaN`) is handled in a
//! single guarded division site, [`span_ratio`].
//!
//! # Partition of Unity
//!
//! Inside the grid's interior support the basis functions of each channel
//! sum to 1 for any order:
//!
//! ```rust
//! use sparkan::{KnotGrid, spline::evaluate_basis};
//!
//! let grid = KnotGrid::new(5, 3, (-1.0, 1.0), 1);
//! let basis = evaluate_basis(&[0.37], 1, &grid);
//! let sum: f32 = basis.iter().sum();
//! assert!((sum - 1.0).abs() < 1e-5);
//! ```

use crate::config::{basis_size, EPSILON};
use crate::grid::KnotGrid;

/// Guarded span ratio: `num / denom`, or exactly `0` when the span is
/// degenerate (coincident knots).
#[inline]
pub fn span_ratio(num: f32, denom: f32) -> f32 {
    if denom.abs() > EPSILON {
        num / denom
    } else {
        0.0
    }
}

/// Evaluates the basis tensor for a batch against one offset's grid.
///
/// `x` is `[batch × in_channels]` row-major; the result is
/// `[batch × in_channels × (grid_size + spline_order)]` row-major. Inputs
/// outside the knot support produce all-zero rows rather than an error; the
/// output never contains non-finite values.
pub fn evaluate_basis(x: &[f32], batch: usize, grid: &KnotGrid) -> Vec<f32> {
    let in_channels = grid.in_channels();
    debug_assert_eq!(x.len(), batch * in_channels);

    let order = grid.spline_order();
    let num_basis = basis_size(grid.grid_size(), order);
    let intervals = grid.knots_per_channel() - 1;

    let mut out = vec![0.0f32; batch * in_channels * num_basis];
    let mut prev = vec![0.0f32; intervals];
    let mut curr = vec![0.0f32; intervals];

    for b in 0..batch {
        for c in 0..in_channels {
            let t = grid.channel(c);
            let xv = x[b * in_channels + c];

            // Order 0: one indicator per knot interval.
            for i in 0..intervals {
                prev[i] = if t[i] <= xv && xv < t[i + 1] { 1.0 } else { 0.0 };
            }

            // Raise the order one blending pass at a time; the basis count
            // shrinks by one per pass, ending at grid_size + order.
            for k in 1..=order {
                let active = intervals - k;
                for i in 0..active {
                    let left = span_ratio(xv - t[i], t[i + k] - t[i]) * prev[i];
                    let right = span_ratio(t[i + k + 1] - xv, t[i + k + 1] - t[i + 1]) * prev[i + 1];
                    curr[i] = left + right;
                }
                std::mem::swap(&mut prev, &mut curr);
            }

            let dst = (b * in_channels + c) * num_basis;
            out[dst..dst + num_basis].copy_from_slice(&prev[..num_basis]);
        }
    }

    out
}

/// Per-channel spline outputs: contracts a basis tensor with a coefficient
/// matrix without reducing over channels.
///
/// `basis` is `[batch × in_channels × num_basis]`, `weights` is the flat
/// `[out_channels][in_channels][num_basis]` coefficient layout; the result is
/// `[batch × in_channels × out_channels]`:
///
/// `y[b, c, o] = Σ_j basis[b, c, j] · weights[o, c, j]`
///
/// This is the target the coefficient refit preserves across a grid change.
pub fn spline_output(
    basis: &[f32],
    weights: &[f32],
    batch: usize,
    in_channels: usize,
    num_basis: usize,
    out_channels: usize,
) -> Vec<f32> {
    debug_assert_eq!(basis.len(), batch * in_channels * num_basis);
    debug_assert_eq!(weights.len(), out_channels * in_channels * num_basis);

    let mut out = vec![0.0f32; batch * in_channels * out_channels];
    for b in 0..batch {
        for c in 0..in_channels {
            let basis_row = &basis[(b * in_channels + c) * num_basis..][..num_basis];
            let dst = (b * in_channels + c) * out_channels;
            for o in 0..out_channels {
                let w = &weights[(o * in_channels + c) * num_basis..][..num_basis];
                let mut sum = 0.0f32;
                for j in 0..num_basis {
                    sum += basis_row[j] * w[j];
                }
                out[dst + o] = sum;
            }
        }
    }
    out
}
