//! Rank-revealing least squares.
//!
//! Every direct solve in the crate eventually reduces to
//!
//! ```text
//! minimize ||A x - b||²
//! ```
//!
//! for a dense A (the sensing matrix itself, its normal equations, a null-space
//! projection, or a support-restricted column subset).
//!
//! Implementation choices:
//! - We use SVD so that tall, square and wide systems are all handled, and so that
//!   rank deficiency yields the minimum-norm solution instead of a failure.
//! - Singular values below `rcond · σ_max` are treated as zero; the number kept is
//!   reported as the numerical rank.

use nalgebra::{DMatrix, DVector};

use crate::error::{FitError, FitResult};

/// Solution of a least-squares problem together with its numerical rank.
#[derive(Debug, Clone)]
pub struct LeastSquaresSolution {
    pub x: DVector<f64>,
    pub rank: usize,
    pub cols: usize,
}

impl LeastSquaresSolution {
    pub fn is_rank_deficient(&self) -> bool {
        self.rank < self.cols
    }
}

/// Solve a least squares problem using SVD.
///
/// Returns the minimum-norm solution when `rank(A) < cols`.
pub fn solve_least_squares(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    rcond: f64,
) -> FitResult<LeastSquaresSolution> {
    let (m, n) = a.shape();
    if b.len() != m {
        return Err(FitError::dimension(format!(
            "least squares: matrix has {m} rows but rhs has {} entries",
            b.len()
        )));
    }
    if n == 0 {
        return Ok(LeastSquaresSolution {
            x: DVector::zeros(0),
            rank: 0,
            cols: 0,
        });
    }
    if m == 0 {
        return Ok(LeastSquaresSolution {
            x: DVector::zeros(n),
            rank: 0,
            cols: n,
        });
    }
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err(FitError::numerical("least squares input contains non-finite values"));
    }

    let svd = a.clone().svd(true, true);
    let sigma_max = svd.singular_values.max();
    if sigma_max <= 0.0 {
        return Ok(LeastSquaresSolution {
            x: DVector::zeros(n),
            rank: 0,
            cols: n,
        });
    }

    let cutoff = rcond * sigma_max;
    let rank = svd.singular_values.iter().filter(|&&s| s > cutoff).count();
    let x = svd
        .solve(b, cutoff)
        .map_err(|e| FitError::numerical(format!("SVD solve failed: {e}")))?;

    if !x.iter().all(|v| v.is_finite()) {
        return Err(FitError::numerical("SVD solve produced non-finite coefficients"));
    }

    Ok(LeastSquaresSolution { x, rank, cols: n })
}

/// `||A x - b|| / norm`, or the absolute residual when `norm` is zero.
pub fn relative_residual(a: &DMatrix<f64>, x: &DVector<f64>, b: &DVector<f64>, norm: f64) -> f64 {
    let r = (a * x - b).norm();
    if norm > 0.0 { r / norm } else { r }
}
