//! Least-squares spline coefficient refitting.
//!
//! When a grid adapts, the spline function defined over the old knots must be
//! carried over to the new knots: for each input channel the new coefficients
//! `C` solve
//!
//! `minimize ‖ basis_new(x) · C − y_old ‖²`
//!
//! where `y_old` is the old spline's output on the observed batch. The design
//! matrix is `batch × num_basis` and is frequently rank-deficient (any batch
//! smaller than the basis count), so the solve goes through a rank-revealing
//! SVD rather than normal equations.
//!
//! The backend sits behind the [`LeastSquares`] trait so it can be swapped
//! (QR, randomized sketching, ...) without touching the refit path;
//! [`SvdSolver`] is the shipped default.

use nalgebra::{DMatrix, SVD};

/// A linear least-squares backend: solves `min ‖A·X − B‖²` for `X`.
pub trait LeastSquares: Send + Sync + std::fmt::Debug {
    /// Solves the least-squares problem, returning `None` when the backend
    /// fails or produces non-finite values.
    fn solve(&self, a: DMatrix<f32>, b: DMatrix<f32>) -> Option<DMatrix<f32>>;
}

/// Rank-revealing SVD least-squares backend (the default).
#[derive(Debug, Clone, Copy)]
pub struct SvdSolver {
    /// Singular values below this threshold are treated as zero.
    pub epsilon: f32,
}

impl Default for SvdSolver {
    fn default() -> Self {
        Self { epsilon: 1e-6 }
    }
}

impl LeastSquares for SvdSolver {
    fn solve(&self, a: DMatrix<f32>, b: DMatrix<f32>) -> Option<DMatrix<f32>> {
        let svd = SVD::new(a, true, true);
        let solution = svd.solve(&b, self.epsilon).ok()?;
        if solution.iter().all(|v| v.is_finite()) {
            Some(solution)
        } else {
            None
        }
    }
}

/// Refits a flat `[out_channels][in_channels][num_basis]` coefficient matrix
/// so the spline reproduces `target` on the observed batch.
///
/// `basis` is the new grid's basis tensor `[batch × in_channels ×
/// num_basis]`; `target` is the old spline's per-channel output
/// `[batch × in_channels × out_channels]` (see
/// [`spline_output`](crate::spline::spline_output)). One least-squares
/// problem is solved per input channel.
///
/// Returns `None` if any channel's solve fails or yields non-finite values;
/// the caller then retains its previous coefficients.
pub fn refit_spline_weight(
    basis: &[f32],
    target: &[f32],
    batch: usize,
    in_channels: usize,
    num_basis: usize,
    out_channels: usize,
    solver: &dyn LeastSquares,
) -> Option<Vec<f32>> {
    debug_assert_eq!(basis.len(), batch * in_channels * num_basis);
    debug_assert_eq!(target.len(), batch * in_channels * out_channels);

    let mut weights = vec![0.0f32; out_channels * in_channels * num_basis];

    for c in 0..in_channels {
        let a = DMatrix::from_fn(batch, num_basis, |r, j| {
            basis[(r * in_channels + c) * num_basis + j]
        });
        let b = DMatrix::from_fn(batch, out_channels, |r, o| {
            target[(r * in_channels + c) * out_channels + o]
        });

        let solution = solver.solve(a, b)?; // num_basis × out_channels
        if !solution.iter().all(|v| v.is_finite()) {
            return None;
        }

        for o in 0..out_channels {
            let dst = (o * in_channels + c) * num_basis;
            for j in 0..num_basis {
                weights[dst + j] = solution[(j, o)];
            }
        }
    }

    Some(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::KnotGrid;
    use crate::spline::{evaluate_basis, spline_output};

    #[test]
    fn test_svd_exact_solve() {
        // Overdetermined consistent system: exact recovery.
        let a = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0]);
        let x_true = DMatrix::from_row_slice(2, 1, &[3.0, -2.0]);
        let b = &a * &x_true;

        let solver = SvdSolver::default();
        let x = solver.solve(a, b).unwrap();
        assert!((x[(0, 0)] - 3.0).abs() < 1e-4);
        assert!((x[(1, 0)] + 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_svd_rank_deficient_is_finite() {
        // 2 rows, 5 columns: underdetermined, SVD picks the minimum-norm
        // solution instead of blowing up.
        let a = DMatrix::from_row_slice(2, 5, &[1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let b = DMatrix::from_row_slice(2, 1, &[2.0, 3.0]);

        let solver = SvdSolver::default();
        let x = solver.solve(a.clone(), b.clone()).unwrap();
        assert!(x.iter().all(|v| v.is_finite()));

        // The solution still satisfies the system.
        let r = &a * &x - &b;
        assert!(r.iter().all(|v| v.abs() < 1e-4));
    }

    #[test]
    fn test_refit_identity_grid_roundtrip() {
        // Refitting against the *same* grid must reproduce the function: the
        // old coefficients are one exact solution, and the residual at the
        // sample points must be ~0.
        let in_channels = 2;
        let out_channels = 3;
        let grid = KnotGrid::new(5, 3, (-1.0, 1.0), in_channels);
        let num_basis = 8;

        let weights: Vec<f32> = (0..out_channels * in_channels * num_basis)
            .map(|i| ((i as f32 * 0.37).sin()) * 0.5)
            .collect();

        let batch = 24;
        let x: Vec<f32> = (0..batch * in_channels)
            .map(|i| -0.9 + 1.8 * (i as f32 * 0.618_034).fract())
            .collect();

        let basis = evaluate_basis(&x, batch, &grid);
        let y = spline_output(&basis, &weights, batch, in_channels, num_basis, out_channels);

        let solver = SvdSolver::default();
        let refit = refit_spline_weight(
            &basis,
            &y,
            batch,
            in_channels,
            num_basis,
            out_channels,
            &solver,
        )
        .unwrap();

        let y_new = spline_output(&basis, &refit, batch, in_channels, num_basis, out_channels);
        for (a, b) in y.iter().zip(y_new.iter()) {
            assert!((a - b).abs() < 1e-3, "refit changed output: {} vs {}", a, b);
        }
    }

    #[test]
    fn test_refit_small_batch_finite() {
        // batch < num_basis: rank-deficient design matrix per channel.
        let in_channels = 1;
        let out_channels = 2;
        let grid = KnotGrid::new(5, 3, (-1.0, 1.0), in_channels);
        let num_basis = 8;

        let batch = 3;
        let x = [-0.5f32, 0.0, 0.5];
        let basis = evaluate_basis(&x, batch, &grid);
        let y = vec![0.25f32; batch * in_channels * out_channels];

        let solver = SvdSolver::default();
        let refit = refit_spline_weight(
            &basis,
            &y,
            batch,
            in_channels,
            num_basis,
            out_channels,
            &solver,
        )
        .unwrap();
        assert!(refit.iter().all(|v| v.is_finite()));
    }

    #[derive(Debug)]
    struct PoisonSolver;

    impl LeastSquares for PoisonSolver {
        fn solve(&self, a: DMatrix<f32>, b: DMatrix<f32>) -> Option<DMatrix<f32>> {
            Some(DMatrix::from_element(a.ncols(), b.ncols(), f32::NAN))
        }
    }

    #[test]
    fn test_non_finite_solution_rejected() {
        let grid = KnotGrid::new(5, 3, (-1.0, 1.0), 1);
        let batch = 10;
        let x: Vec<f32> = (0..batch).map(|i| -0.9 + 0.2 * i as f32).collect();
        let basis = evaluate_basis(&x, batch, &grid);
        let y = vec![1.0f32; batch * 2];

        // A backend returning NaN must not leak into coefficients.
        let refit = refit_spline_weight(&basis, &y, batch, 1, 8, 2, &PoisonSolver);
        assert!(refit.is_none());
    }
}
