//! Elastic net by cyclic coordinate descent.
//!
//! We minimize
//!
//! ```text
//! (1/2M) ||A x - b||² + α (l1_ratio ||x||₁ + (1 - l1_ratio)/2 ||x||²)
//! ```
//!
//! on standardized columns. `Prod = AᵀA/M` and `Aᵀb/M` are computed once per design
//! and shared by every α of a path; the gradient `Aᵀb/M - Prod·x` is updated in place
//! after each coordinate move, so one sweep costs `O(N²)` regardless of M.

use nalgebra::{DMatrix, DVector};

use crate::domain::{FitStatus, OptimizerControl};
use crate::error::{FitError, FitResult};
use crate::math::{shrink, solve_least_squares};
use crate::sensing::DenseRows;

/// Column centering and scaling, and its inverse on coefficients.
#[derive(Debug, Clone)]
pub struct Standardizer {
    mean: DVector<f64>,
    scale: DVector<f64>,
    target_mean: f64,
}

impl Standardizer {
    /// Population mean and standard deviation of every column; constant columns
    /// keep scale 1 and become zero after centering.
    pub fn fit(a: &DMatrix<f64>, b: &DVector<f64>, enabled: bool) -> Self {
        let n = a.ncols();
        if !enabled || a.nrows() == 0 {
            return Self {
                mean: DVector::zeros(n),
                scale: DVector::from_element(n, 1.0),
                target_mean: 0.0,
            };
        }
        let m = a.nrows() as f64;
        let mean = DVector::from_fn(n, |j, _| a.column(j).sum() / m);
        let scale = DVector::from_fn(n, |j, _| {
            let mu = mean[j];
            let var = a.column(j).iter().map(|v| (v - mu) * (v - mu)).sum::<f64>() / m;
            let sd = var.sqrt();
            if sd > 0.0 { sd } else { 1.0 }
        });
        Self {
            mean,
            scale,
            target_mean: b.mean(),
        }
    }

    pub fn transform(&self, a: &DMatrix<f64>, b: &DVector<f64>) -> (DMatrix<f64>, DVector<f64>) {
        let mut a_std = a.clone();
        for (j, mut col) in a_std.column_iter_mut().enumerate() {
            let (mu, sd) = (self.mean[j], self.scale[j]);
            col.apply(|v| *v = (*v - mu) / sd);
        }
        let b_std = b.map(|v| v - self.target_mean);
        (a_std, b_std)
    }

    pub fn to_original(&self, x_std: &DVector<f64>) -> DVector<f64> {
        x_std.component_div(&self.scale)
    }

    pub fn to_standardized(&self, x: &DVector<f64>) -> DVector<f64> {
        x.component_mul(&self.scale)
    }
}

/// `AᵀA/M` and `Aᵀb/M` of the standardized design.
#[derive(Debug, Clone)]
pub struct GramCache {
    pub prod: DMatrix<f64>,
    pub correlation: DVector<f64>,
}

impl GramCache {
    pub fn new(a: &DMatrix<f64>, b: &DVector<f64>) -> Self {
        let m = a.nrows().max(1) as f64;
        Self {
            prod: a.tr_mul(a) / m,
            correlation: a.tr_mul(b) / m,
        }
    }
}

/// One point of the regularization path.
#[derive(Debug, Clone)]
pub struct ElasticNetPoint {
    pub alpha: f64,
    /// Coefficients in the scale of the raw design.
    pub x: DVector<f64>,
    /// Coefficients in standardized space, used as the next warm start.
    pub x_std: DVector<f64>,
    pub iterations: usize,
    pub status: FitStatus,
}

/// Cyclic coordinate descent on a cached Gram matrix.
///
/// Returns the standardized iterate, the number of sweeps and whether the relative
/// step fell below `tolerance`.
pub fn coordinate_descent(
    cache: &GramCache,
    alpha: f64,
    l1_ratio: f64,
    warm: Option<&DVector<f64>>,
    control: &OptimizerControl,
) -> FitResult<(DVector<f64>, usize, bool)> {
    let n = cache.prod.ncols();
    let mut x = match warm {
        Some(w) if w.len() == n => w.clone(),
        Some(w) => {
            return Err(FitError::dimension(format!(
                "warm start has {} coefficients, design has {n}",
                w.len()
            )));
        }
        None => DVector::zeros(n),
    };
    let mut grad = &cache.correlation - &cache.prod * &x;
    let l1 = alpha * l1_ratio;
    let l2 = alpha * (1.0 - l1_ratio);

    for sweep in 1..=control.max_iterations {
        let x_old = x.clone();
        for j in 0..n {
            let pjj = cache.prod[(j, j)];
            let new = if pjj > 0.0 {
                let scale = 1.0 / pjj;
                shrink(x[j] + grad[j] * scale, l1 * scale) * pjj / (pjj + l2)
            } else {
                0.0
            };
            let delta = new - x[j];
            if delta != 0.0 {
                x[j] = new;
                grad.axpy(-delta, &cache.prod.column(j), 1.0);
            }
        }

        if !x.iter().all(|v| v.is_finite()) {
            return Err(FitError::numerical(format!(
                "coordinate descent diverged at alpha = {alpha:.3e} (sweep {sweep})"
            )));
        }

        let dx = (&x - &x_old).norm();
        let xn = x.norm();
        let rel = if xn > 0.0 { dx / xn } else { dx };
        if control.output_frequency > 0 && sweep % control.output_frequency == 0 {
            log::debug!("alpha = {alpha:.3e}, sweep {sweep}: relative step {rel:.3e}");
        }
        if rel < control.tolerance_iteration {
            return Ok((x, sweep, true));
        }
    }
    Ok((x, control.max_iterations, false))
}

/// Elastic-net fits of one design over any number of α values.
#[derive(Debug, Clone)]
pub struct CompressiveSensingEngine<'a> {
    rows: DenseRows,
    standardizer: Standardizer,
    cache: GramCache,
    control: &'a OptimizerControl,
}

impl<'a> CompressiveSensingEngine<'a> {
    pub fn new(rows: DenseRows, control: &'a OptimizerControl) -> Self {
        let standardizer = Standardizer::fit(&rows.a, &rows.b, control.standardize);
        let (a_std, b_std) = standardizer.transform(&rows.a, &rows.b);
        let cache = GramCache::new(&a_std, &b_std);
        Self {
            rows,
            standardizer,
            cache,
            control,
        }
    }

    pub fn n_columns(&self) -> usize {
        self.rows.a.ncols()
    }

    pub fn rows(&self) -> &DenseRows {
        &self.rows
    }

    /// Smallest α at which every coefficient is zero (for the LASSO), with
    /// `l1_ratio` floored at 1e-3.
    pub fn estimate_alpha_max(&self) -> f64 {
        self.cache.correlation.amax() / self.control.l1_ratio.max(1e-3)
    }

    pub fn fit(&self, alpha: f64, warm: Option<&DVector<f64>>) -> FitResult<ElasticNetPoint> {
        if !(alpha.is_finite() && alpha >= 0.0) {
            return Err(FitError::control(format!("alpha must be finite and >= 0, got {alpha}")));
        }
        let (x_std, iterations, converged) =
            coordinate_descent(&self.cache, alpha, self.control.l1_ratio, warm, self.control)?;
        let status = if converged {
            FitStatus::Converged
        } else {
            log::warn!(
                "coordinate descent reached {iterations} sweeps without converging (alpha = {alpha:.3e})"
            );
            FitStatus::MaxIterationsReached
        };
        Ok(ElasticNetPoint {
            alpha,
            x: self.standardizer.to_original(&x_std),
            x_std,
            iterations,
            status,
        })
    }

    /// Refit the non-zero support by ordinary least squares on the raw design.
    pub fn debias(&self, x: &DVector<f64>) -> FitResult<DVector<f64>> {
        let support: Vec<usize> = (0..x.len())
            .filter(|&j| x[j].abs() > self.control.coef_zero_threshold)
            .collect();
        if support.is_empty() {
            return Ok(x.clone());
        }
        let sub = self.rows.a.select_columns(support.iter());
        let sol = solve_least_squares(&sub, &self.rows.b, self.control.svd_rcond)?;
        let mut out = DVector::zeros(x.len());
        for (k, &j) in support.iter().enumerate() {
            out[j] = sol.x[k];
        }
        log::debug!("debiased {} non-zero coefficients", support.len());
        Ok(out)
    }

    /// `||A x - b|| / ||f||` on this engine's rows.
    pub fn relative_error(&self, x: &DVector<f64>) -> f64 {
        self.rows.relative_error(x)
    }
}
