//! Solvers for the sparse normal equations `AᵀA x = Aᵀb`.

use nalgebra::DVector;
use sprs::prod::{mul_acc_mat_vec_csc, mul_acc_mat_vec_csr};
use sprs::{CsMat, FillInReduction, SymmetryCheck};
use sprs_ldl::Ldl;

use crate::error::{FitError, FitResult};

/// Sparse LDLᵀ with reverse Cuthill–McKee ordering.
///
/// All pivots of D must be positive and `min dᵢ > rcond·max dᵢ`; anything else
/// means `AᵀA` is not numerically positive definite and the caller falls back to a
/// rank-revealing solve.
pub fn ldlt_solve(ata: &CsMat<f64>, atb: &DVector<f64>, rcond: f64) -> FitResult<DVector<f64>> {
    let ldl = Ldl::new()
        .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
        .check_symmetry(SymmetryCheck::DontCheckSymmetry)
        .numeric(ata.view())
        .map_err(|e| FitError::numerical(format!("sparse LDLT factorization failed: {e}")))?;

    if let Some((i, &di)) = ldl.d().iter().enumerate().find(|(_, d)| !(**d > 0.0)) {
        return Err(FitError::numerical(format!(
            "sparse LDLT pivot {i} is {di:.3e} (matrix not positive definite)"
        )));
    }
    let (d_min, d_max) = ldl
        .d()
        .iter()
        .fold((f64::INFINITY, 0.0_f64), |(lo, hi), &d| (lo.min(d), hi.max(d)));
    if d_min <= rcond * d_max {
        return Err(FitError::numerical(format!(
            "sparse LDLT pivot ratio {:.3e} is below rcond {rcond:.1e} (matrix numerically singular)",
            d_min / d_max
        )));
    }

    let x = DVector::from_vec(ldl.solve(atb.as_slice()));
    if !x.iter().all(|v| v.is_finite()) {
        return Err(FitError::numerical("sparse LDLT produced non-finite coefficients"));
    }
    Ok(x)
}

fn sym_mul(a: &CsMat<f64>, x: &DVector<f64>) -> DVector<f64> {
    let mut y = DVector::zeros(a.rows());
    if a.is_csc() {
        mul_acc_mat_vec_csc(a.view(), x.as_slice(), y.as_mut_slice());
    } else {
        mul_acc_mat_vec_csr(a.view(), x.as_slice(), y.as_mut_slice());
    }
    y
}

/// Conjugate gradient from `x = 0`, stopping when `||r|| <= tolerance·||Aᵀb||`.
///
/// Returns the solution and the number of iterations used.
pub fn conjugate_gradient(
    ata: &CsMat<f64>,
    atb: &DVector<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> FitResult<(DVector<f64>, usize)> {
    let n = atb.len();
    let mut x = DVector::zeros(n);
    let rhs_norm = atb.norm();
    if rhs_norm == 0.0 {
        return Ok((x, 0));
    }

    let mut r = atb.clone();
    let mut p = r.clone();
    let mut rs_old = r.norm_squared();

    for it in 1..=max_iterations {
        let ap = sym_mul(ata, &p);
        let pap = p.dot(&ap);
        if !(pap > 0.0) {
            return Err(FitError::numerical(format!(
                "conjugate gradient breakdown at iteration {it} (pᵀAp = {pap:.3e})"
            )));
        }
        let step = rs_old / pap;
        x.axpy(step, &p, 1.0);
        r.axpy(-step, &ap, 1.0);
        let rs_new = r.norm_squared();
        if rs_new.sqrt() <= tolerance * rhs_norm {
            return Ok((x, it));
        }
        p = &r + (rs_new / rs_old) * &p;
        rs_old = rs_new;
    }

    Err(FitError::numerical(format!(
        "conjugate gradient did not converge in {max_iterations} iterations"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprs::TriMat;

    fn spd() -> CsMat<f64> {
        let mut tri = TriMat::new((3, 3));
        for (i, j, v) in [
            (0, 0, 4.0),
            (0, 1, 1.0),
            (1, 0, 1.0),
            (1, 1, 3.0),
            (1, 2, -1.0),
            (2, 1, -1.0),
            (2, 2, 2.0),
        ] {
            tri.add_triplet(i, j, v);
        }
        tri.to_csc()
    }

    #[test]
    fn ldlt_and_cg_agree_on_spd_system() {
        let a = spd();
        let b = DVector::from_row_slice(&[1.0, 2.0, 3.0]);
        let x1 = ldlt_solve(&a, &b, 1e-12).unwrap();
        let (x2, iters) = conjugate_gradient(&a, &b, 50, 1e-14).unwrap();
        assert!(iters <= 3 + 1);
        assert!((&x1 - &x2).amax() < 1e-10);
        assert!((sym_mul(&a, &x1) - b).amax() < 1e-12);
    }

    #[test]
    fn ldlt_rejects_singular_matrix() {
        let mut tri = TriMat::new((2, 2));
        tri.add_triplet(0, 0, 1.0);
        tri.add_triplet(0, 1, 1.0);
        tri.add_triplet(1, 0, 1.0);
        tri.add_triplet(1, 1, 1.0);
        let a = tri.to_csc();
        let b = DVector::from_row_slice(&[1.0, 1.0]);
        assert!(ldlt_solve(&a, &b, 1e-12).is_err());
    }

    #[test]
    fn ldlt_rejects_tiny_positive_pivot() {
        // Positive definite in exact arithmetic, singular at rcond 1e-12.
        let mut tri = TriMat::new((2, 2));
        tri.add_triplet(0, 0, 1.0);
        tri.add_triplet(0, 1, 1.0);
        tri.add_triplet(1, 0, 1.0);
        tri.add_triplet(1, 1, 1.0 + 1e-14);
        let a = tri.to_csc();
        let b = DVector::from_row_slice(&[1.0, 1.0]);
        let err = ldlt_solve(&a, &b, 1e-12).unwrap_err();
        assert!(err.to_string().contains("numerically singular"), "{err}");
        assert!(ldlt_solve(&a, &b, 1e-16).is_ok());
    }
}
