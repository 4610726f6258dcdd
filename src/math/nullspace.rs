//! Orthonormal null-space bases from an SVD with the full right factor.
//!
//! nalgebra only returns `min(m, n)` right singular vectors, so a wide matrix is
//! padded with zero rows to `n × n` first. The padding adds zero singular values and
//! leaves the row space unchanged.

use nalgebra::DMatrix;

use crate::error::{FitError, FitResult};

#[derive(Debug, Clone)]
pub struct NullSpace {
    /// Number of singular values above `tol · σ_max`.
    pub rank: usize,
    /// `n × (n - rank)`, orthonormal columns spanning `{x : M x = 0}`.
    pub basis: DMatrix<f64>,
}

/// Trailing right singular vectors of `mat`, past its numerical rank.
pub fn null_space(mat: &DMatrix<f64>, tol: f64) -> FitResult<NullSpace> {
    let (m, n) = mat.shape();
    if m == 0 || n == 0 {
        return Ok(NullSpace {
            rank: 0,
            basis: DMatrix::identity(n, n),
        });
    }
    if mat.iter().any(|v| !v.is_finite()) {
        return Err(FitError::numerical("null space input contains non-finite values"));
    }

    let mut padded = DMatrix::zeros(m.max(n), n);
    padded.view_mut((0, 0), (m, n)).copy_from(mat);
    let svd = padded.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| FitError::numerical("SVD did not return right singular vectors"))?;

    let sigma_max = svd.singular_values.max();
    let rank = if sigma_max > 0.0 {
        svd.singular_values.iter().filter(|&&s| s > tol * sigma_max).count()
    } else {
        0
    };
    Ok(NullSpace {
        rank,
        basis: v_t.rows(rank, n - rank).transpose(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_orthonormal(z: &DMatrix<f64>) {
        let ztz = z.transpose() * z;
        assert!((ztz - DMatrix::<f64>::identity(z.ncols(), z.ncols())).amax() < 1e-12);
    }

    #[test]
    fn wide_matrix_gets_full_null_space() {
        let c = DMatrix::from_row_slice(2, 4, &[1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, -2.0]);
        let ns = null_space(&c, 1e-10).unwrap();
        assert_eq!(ns.rank, 2);
        assert_eq!(ns.basis.shape(), (4, 2));
        assert!((&c * &ns.basis).amax() < 1e-12);
        assert_orthonormal(&ns.basis);
    }

    #[test]
    fn dependent_rows_lower_the_rank() {
        // Third row = first + second.
        let c = DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 2.0]);
        let ns = null_space(&c, 1e-10).unwrap();
        assert_eq!(ns.rank, 2);
        assert_eq!(ns.basis.ncols(), 1);
        assert!((&c * &ns.basis).amax() < 1e-12);
        assert_eq!(null_space(&DMatrix::<f64>::identity(3, 3), 1e-10).unwrap().rank, 3);
    }

    #[test]
    fn zero_and_empty_matrices_keep_every_direction() {
        let zero = null_space(&DMatrix::<f64>::zeros(2, 2), 1e-10).unwrap();
        assert_eq!(zero.rank, 0);
        assert_orthonormal(&zero.basis);

        let empty = null_space(&DMatrix::<f64>::zeros(0, 3), 1e-10).unwrap();
        assert_eq!(empty.basis, DMatrix::<f64>::identity(3, 3));
    }
}
