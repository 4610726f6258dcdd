//! Assembled sensing matrices.

use nalgebra::{DMatrix, DVector};
use sprs::CsMat;
use sprs::prod::{mul_acc_mat_vec_csc, mul_acc_mat_vec_csr};

use crate::error::{FitError, FitResult};

/// Column storage of `A`.
#[derive(Debug, Clone)]
pub enum Design {
    Dense(DMatrix<f64>),
    Sparse(CsMat<f64>),
}

impl Design {
    pub fn nrows(&self) -> usize {
        match self {
            Design::Dense(a) => a.nrows(),
            Design::Sparse(a) => a.rows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Design::Dense(a) => a.ncols(),
            Design::Sparse(a) => a.cols(),
        }
    }

    /// `A x`.
    pub fn apply(&self, x: &DVector<f64>) -> DVector<f64> {
        match self {
            Design::Dense(a) => a * x,
            Design::Sparse(a) => {
                let mut y = DVector::zeros(a.rows());
                if a.is_csc() {
                    mul_acc_mat_vec_csc(a.view(), x.as_slice(), y.as_mut_slice());
                } else {
                    mul_acc_mat_vec_csr(a.view(), x.as_slice(), y.as_mut_slice());
                }
                y
            }
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            Design::Dense(a) => a.clone(),
            Design::Sparse(a) => {
                let mut out = DMatrix::zeros(a.rows(), a.cols());
                for (v, (i, j)) in a.iter() {
                    out[(i, j)] += *v;
                }
                out
            }
        }
    }

    pub fn nnz(&self) -> usize {
        match self {
            Design::Dense(a) => a.iter().filter(|v| **v != 0.0).count(),
            Design::Sparse(a) => a.nnz(),
        }
    }
}

/// `A`, `b` and the bookkeeping needed for relative errors and fold splits.
#[derive(Debug, Clone)]
pub struct SensingMatrix {
    pub design: Design,
    pub target: DVector<f64>,
    /// `||f||²` of each sample's raw force rows.
    pub sample_force_sq: Vec<f64>,
    pub rows_per_sample: usize,
}

/// Dense rows of a subset of samples.
#[derive(Debug, Clone)]
pub struct DenseRows {
    pub a: DMatrix<f64>,
    pub b: DVector<f64>,
    pub force_norm: f64,
}

impl DenseRows {
    pub fn relative_error(&self, x: &DVector<f64>) -> f64 {
        crate::math::relative_residual(&self.a, x, &self.b, self.force_norm)
    }
}

impl SensingMatrix {
    pub fn new(
        design: Design,
        target: DVector<f64>,
        sample_force_sq: Vec<f64>,
        rows_per_sample: usize,
    ) -> Self {
        Self {
            design,
            target,
            sample_force_sq,
            rows_per_sample,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.sample_force_sq.len()
    }

    /// `||f||` over every row, used to normalize residuals.
    pub fn force_norm(&self) -> f64 {
        self.sample_force_sq.iter().sum::<f64>().sqrt()
    }

    /// `||A x - b|| / ||f||`.
    pub fn relative_error(&self, x: &DVector<f64>) -> f64 {
        let r = (self.design.apply(x) - &self.target).norm();
        let norm = self.force_norm();
        if norm > 0.0 { r / norm } else { r }
    }

    /// Dense copy of the rows of `samples`, in the given order.
    pub fn select_samples(&self, samples: &[usize]) -> FitResult<DenseRows> {
        let Design::Dense(a) = &self.design else {
            return Err(FitError::dimension("sample selection needs a dense sensing matrix"));
        };
        let rps = self.rows_per_sample;
        if let Some(&bad) = samples.iter().find(|&&s| s >= self.n_samples()) {
            return Err(FitError::dimension(format!(
                "sample {bad} out of range ({} samples)",
                self.n_samples()
            )));
        }
        let rows: Vec<usize> = samples
            .iter()
            .flat_map(|&s| (s * rps)..((s + 1) * rps))
            .collect();
        let force_norm = samples
            .iter()
            .map(|&s| self.sample_force_sq[s])
            .sum::<f64>()
            .sqrt();
        Ok(DenseRows {
            a: a.select_rows(rows.iter()),
            b: self.target.select_rows(rows.iter()),
            force_norm,
        })
    }

    /// Dense copy of every row.
    pub fn dense_rows(&self) -> DenseRows {
        DenseRows {
            a: self.design.to_dense(),
            b: self.target.clone(),
            force_norm: self.force_norm(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprs::TriMat;

    fn small() -> SensingMatrix {
        let a = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 0.0, 2.0, 3.0, 0.0, 0.0, 4.0]);
        let b = DVector::from_row_slice(&[1.0, 2.0, 3.0, 4.0]);
        SensingMatrix::new(Design::Dense(a), b, vec![5.0, 25.0], 2)
    }

    #[test]
    fn selects_sample_rows_in_order() {
        let m = small();
        let rows = m.select_samples(&[1, 0]).unwrap();
        assert_eq!(rows.a[(0, 0)], 3.0);
        assert_eq!(rows.b[2], 1.0);
        assert!((rows.force_norm - 30.0_f64.sqrt()).abs() < 1e-12);
        assert!(m.select_samples(&[2]).is_err());
    }

    #[test]
    fn sparse_apply_matches_dense() {
        let mut tri = TriMat::new((3, 2));
        tri.add_triplet(0, 0, 1.0);
        tri.add_triplet(2, 1, -2.0);
        tri.add_triplet(1, 0, 0.5);
        let sparse = Design::Sparse(tri.to_csc());
        let dense = Design::Dense(sparse.to_dense());
        let x = DVector::from_row_slice(&[2.0, 3.0]);
        assert_eq!(sparse.apply(&x), dense.apply(&x));
        assert_eq!(sparse.nnz(), 3);
    }

    #[test]
    fn relative_error_is_zero_for_exact_fit() {
        let m = small();
        let x = DVector::from_row_slice(&[1.0, 1.0]);
        assert!(m.relative_error(&x) < 1e-15);
    }
}
