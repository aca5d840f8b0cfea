//! Adaptive knot grids for per-offset spline functions.
//!
//! A [`KnotGrid`] holds one knot vector per input channel for a single
//! kernel offset. Grids start uniform over the configured range and are
//! adapted online to the empirical distribution of the values routed through
//! their offset: interior knots move toward the observed quantiles, blended
//! with a uniform layout by `grid_eps`, and the boundary knots are re-extended
//! with the uniform step.
//!
//! The layer stores one `KnotGrid` per kernel offset, so offsets can adapt
//! concurrently without aliasing. Replacement of the knot storage is a single
//! `Vec` swap: no reader of a grid can observe a half-updated knot vector.
//!
//! # Example
//!
//! ```rust
//! use sparkan::KnotGrid;
//!
//! let grid = KnotGrid::new(5, 3, (-1.0, 1.0), 3);
//! assert_eq!(grid.knots_per_channel(), 12); // 5 + 2*3 + 1
//! assert_eq!(grid.channel(0).len(), 12);
//! ```

use log::debug;

use crate::config::knots_per_channel;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Outcome of one adaptive grid update.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridUpdate {
    /// Whether any channel's knots changed (a swap happened).
    pub changed: bool,
    /// Channels that kept their previous knots because the batch was
    /// constant in that channel.
    pub degenerate_channels: usize,
}

/// Per-channel knot vectors for one kernel offset.
///
/// Knots are stored flat, row-major by channel:
/// `knots[channel * knots_per_channel + i]`. Each channel's sequence is
/// non-decreasing; `grid_size + 1` interior breakpoints are padded by
/// `spline_order` knots on each side so every basis function has full
/// support.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KnotGrid {
    in_channels: usize,
    grid_size: usize,
    spline_order: usize,
    knots: Vec<f32>,
}

impl KnotGrid {
    /// Creates a uniform grid over `grid_range`, replicated per channel.
    ///
    /// Interior knots are `grid_size + 1` evenly spaced breakpoints; the
    /// boundary extension reuses the same step, giving
    /// `grid_size + 2*spline_order + 1` knots per channel.
    pub fn new(
        grid_size: usize,
        spline_order: usize,
        grid_range: (f32, f32),
        in_channels: usize,
    ) -> Self {
        let kpc = knots_per_channel(grid_size, spline_order);
        let h = (grid_range.1 - grid_range.0) / grid_size as f32;

        let mut knots = Vec::with_capacity(in_channels * kpc);
        for _ in 0..in_channels {
            for i in 0..kpc {
                knots.push(grid_range.0 + (i as f32 - spline_order as f32) * h);
            }
        }

        Self {
            in_channels,
            grid_size,
            spline_order,
            knots,
        }
    }

    /// Number of input channels.
    #[inline]
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Grid intervals.
    #[inline]
    pub fn grid_size(&self) -> usize {
        self.grid_size
    }

    /// Spline order.
    #[inline]
    pub fn spline_order(&self) -> usize {
        self.spline_order
    }

    /// Knot count per channel.
    #[inline]
    pub fn knots_per_channel(&self) -> usize {
        knots_per_channel(self.grid_size, self.spline_order)
    }

    /// One channel's knot sequence.
    #[inline]
    pub fn channel(&self, channel: usize) -> &[f32] {
        let kpc = self.knots_per_channel();
        &self.knots[channel * kpc..(channel + 1) * kpc]
    }

    /// The full flat knot storage, row-major by channel.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.knots
    }

    /// Adapts the grid to a batch of observed inputs.
    ///
    /// `x` is `[batch × in_channels]` row-major. Per channel, the new
    /// interior knots blend quantile placement (values at evenly spaced rank
    /// positions of the sorted batch) with a uniform layout over
    /// `[min - margin, max + margin]`; the blended knots are extended by
    /// `spline_order` knots on each side using the uniform step. The
    /// replacement is a whole-storage swap.
    ///
    /// Guards (the deliberate fallback, not a failure):
    /// - a batch smaller than `grid_size + 1` skips the update entirely;
    /// - a channel whose batch has fewer than 2 distinct values keeps its
    ///   previous knots inside the swapped storage.
    ///
    /// The returned [`GridUpdate`] reports whether anything changed so the
    /// caller can refit coefficients and count skips.
    pub fn adapt(&mut self, x: &[f32], batch: usize, margin: f32, grid_eps: f32) -> GridUpdate {
        debug_assert_eq!(x.len(), batch * self.in_channels);

        if batch < self.grid_size + 1 {
            debug!(
                "grid adapt skipped: batch {} < {} required intervals",
                batch,
                self.grid_size + 1
            );
            return GridUpdate {
                changed: false,
                degenerate_channels: 0,
            };
        }

        let kpc = self.knots_per_channel();
        let order = self.spline_order;
        let g = self.grid_size;

        let mut candidate = self.knots.clone();
        let mut column = vec![0.0f32; batch];
        let mut degenerate = 0usize;
        let mut updated = 0usize;

        for c in 0..self.in_channels {
            for b in 0..batch {
                column[b] = x[b * self.in_channels + c];
            }
            column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let lo = column[0];
            let hi = column[batch - 1];
            if hi <= lo {
                // Constant channel: uniform step degenerates, keep old knots.
                degenerate += 1;
                continue;
            }

            let uniform_step = (hi - lo + 2.0 * margin) / g as f32;
            let dst = &mut candidate[c * kpc..(c + 1) * kpc];

            // Blended interior knots land after the `order` left padding knots.
            for i in 0..=g {
                let adaptive = column[i * (batch - 1) / g];
                let uniform = lo - margin + i as f32 * uniform_step;
                dst[order + i] = grid_eps * uniform + (1.0 - grid_eps) * adaptive;
            }
            // Boundary extension with the uniform step keeps the sequence
            // non-decreasing.
            for j in 0..order {
                dst[order - 1 - j] = dst[order - j] - uniform_step;
                dst[order + g + 1 + j] = dst[order + g + j] + uniform_step;
            }
            updated += 1;
        }

        if updated == 0 {
            debug!(
                "grid adapt skipped: all {} channels constant",
                self.in_channels
            );
            return GridUpdate {
                changed: false,
                degenerate_channels: degenerate,
            };
        }

        // Whole-value swap: concurrent readers of other offsets never exist,
        // and within this offset no partially written vector is observable.
        self.knots = candidate;

        GridUpdate {
            changed: true,
            degenerate_channels: degenerate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_non_decreasing(knots: &[f32]) {
        for w in knots.windows(2) {
            assert!(
                w[0] <= w[1] + 1e-6,
                "knots must be non-decreasing: {} > {}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_uniform_construction() {
        let grid = KnotGrid::new(5, 3, (-1.0, 1.0), 3);
        assert_eq!(grid.knots_per_channel(), 12);

        for c in 0..3 {
            let knots = grid.channel(c);
            assert_eq!(knots.len(), 12);
            assert_non_decreasing(knots);
            // Interior breakpoints span the grid range.
            assert!((knots[3] - (-1.0)).abs() < 1e-5);
            assert!((knots[8] - 1.0).abs() < 1e-5);
            // Uniform step 2/5.
            assert!((knots[1] - knots[0] - 0.4).abs() < 1e-5);
        }
    }

    #[test]
    fn test_order_zero_construction() {
        let grid = KnotGrid::new(4, 0, (0.0, 1.0), 2);
        assert_eq!(grid.knots_per_channel(), 5);
        assert!((grid.channel(1)[0] - 0.0).abs() < 1e-6);
        assert!((grid.channel(1)[4] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_adapt_monotone_and_changed() {
        let mut grid = KnotGrid::new(5, 3, (-1.0, 1.0), 2);
        let batch = 32;
        // Skewed data: channel 0 clustered near 0.8, channel 1 spread out.
        let x: Vec<f32> = (0..batch)
            .flat_map(|b| {
                let t = b as f32 / (batch - 1) as f32;
                [0.6 + 0.3 * t * t, -1.0 + 2.0 * t]
            })
            .collect();

        let update = grid.adapt(&x, batch, 0.01, 0.02);
        assert!(update.changed);
        assert_eq!(update.degenerate_channels, 0);

        for c in 0..2 {
            assert_non_decreasing(grid.channel(c));
        }
        // Channel 0 interior knots now live inside the observed range.
        let knots = grid.channel(0);
        assert!(knots[3] >= 0.6 - 0.011 - 1e-4);
        assert!(knots[8] <= 0.9 + 0.011 + 1e-4);
    }

    #[test]
    fn test_adapt_quantile_placement() {
        // grid_eps = 0: pure quantile knots equal the rank-selected samples.
        let mut grid = KnotGrid::new(4, 1, (-1.0, 1.0), 1);
        let batch = 9;
        let x: Vec<f32> = (0..batch).map(|b| b as f32).collect();

        let update = grid.adapt(&x, batch, 0.0, 0.0);
        assert!(update.changed);

        let knots = grid.channel(0);
        // Interior knots at ranks 0, 2, 4, 6, 8 of 0..9.
        for (i, expected) in [0.0f32, 2.0, 4.0, 6.0, 8.0].iter().enumerate() {
            assert!(
                (knots[1 + i] - expected).abs() < 1e-5,
                "knot {} = {}, expected {}",
                i,
                knots[1 + i],
                expected
            );
        }
    }

    #[test]
    fn test_adapt_uniform_blend() {
        // grid_eps = 1: interior knots are exactly uniform over the padded range.
        let mut grid = KnotGrid::new(5, 2, (-1.0, 1.0), 1);
        let batch = 16;
        let x: Vec<f32> = (0..batch).map(|b| (b as f32 / 15.0).powi(3)).collect();

        grid.adapt(&x, batch, 0.5, 1.0);
        let knots = grid.channel(0);
        let step = knots[3] - knots[2];
        for w in knots[2..9].windows(2) {
            assert!((w[1] - w[0] - step).abs() < 1e-4);
        }
    }

    #[test]
    fn test_small_batch_skips() {
        let mut grid = KnotGrid::new(5, 3, (-1.0, 1.0), 2);
        let before = grid.as_slice().to_vec();

        // batch 1 < grid_size + 1
        let update = grid.adapt(&[0.3, -0.2], 1, 0.01, 0.02);
        assert!(!update.changed);
        assert_eq!(grid.as_slice(), &before[..]);
        assert!(grid.as_slice().iter().all(|k| k.is_finite()));
    }

    #[test]
    fn test_constant_batch_skips() {
        let mut grid = KnotGrid::new(5, 3, (-1.0, 1.0), 1);
        let before = grid.as_slice().to_vec();

        let x = vec![0.5f32; 10];
        let update = grid.adapt(&x, 10, 0.01, 0.02);
        assert!(!update.changed);
        assert_eq!(update.degenerate_channels, 1);
        assert_eq!(grid.as_slice(), &before[..]);
    }

    #[test]
    fn test_constant_channel_kept_inside_swap() {
        let mut grid = KnotGrid::new(5, 3, (-1.0, 1.0), 2);
        let before_c0 = grid.channel(0).to_vec();

        // Channel 0 constant, channel 1 varies.
        let batch = 12;
        let x: Vec<f32> = (0..batch)
            .flat_map(|b| [0.25f32, b as f32 / (batch - 1) as f32])
            .collect();

        let update = grid.adapt(&x, batch, 0.01, 0.02);
        assert!(update.changed);
        assert_eq!(update.degenerate_channels, 1);
        assert_eq!(grid.channel(0), &before_c0[..]);
        assert_ne!(grid.channel(1), &before_c0[..]);
        assert_non_decreasing(grid.channel(1));
    }
}
