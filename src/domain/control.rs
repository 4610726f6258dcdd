//! Optimizer configuration.
//!
//! `OptimizerControl` is an immutable snapshot created before a fit and passed by
//! reference into every component. Defaults follow the conventional settings of
//! force-constant fitting codes (e.g. 10000 coordinate-descent sweeps, tolerance
//! 1e-8, 50 α values, early stop after 5 consecutive validation-error increases).

use serde::{Deserialize, Serialize};

use crate::error::{FitError, FitResult};

/// Which regression model to fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearModel {
    /// Ordinary (constrained) least squares.
    LeastSquares,
    /// Elastic net / LASSO by coordinate descent.
    ElasticNet,
}

/// How linear constraints are honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintMode {
    /// Ignore constraints.
    None,
    /// Eliminate dependent parameters before building the sensing matrix.
    Algebraic,
    /// Keep `C x = d` separate and solve an equality-constrained problem.
    Explicit,
}

/// Solver used for the sparse normal equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparseSolver {
    /// Sparse LDLᵀ with positive pivots (Cholesky-like).
    Ldlt,
    /// Conjugate gradient on `AᵀA`.
    ConjugateGradient,
}

/// Cross-validation mode for the elastic-net path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CvMode {
    /// Fit a single `l1_alpha`.
    Off,
    /// Use the explicitly supplied validation dataset.
    Manual,
    /// Split the training samples into `folds` parts.
    KFold { folds: usize },
}

/// How samples are assigned to folds in K-fold mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldAssignment {
    /// Contiguous blocks in sample order.
    Contiguous,
    /// Random permutation seeded by `cv_seed`.
    Shuffled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerControl {
    pub linear_model: LinearModel,
    pub constraint_mode: ConstraintMode,

    /// Build the sensing matrix in compressed-column form (least squares only).
    pub use_sparse_solver: bool,
    pub sparse_solver: SparseSolver,
    /// Solve the normal equations with Cholesky instead of a rank-revealing SVD.
    pub use_cholesky: bool,
    /// Samples per block when accumulating `AᵀA` without materializing A.
    pub chunk_size: usize,
    /// Append translated replicas of every configuration.
    pub data_multiplier: bool,
    /// Relative singular-value cutoff of the rank-revealing solves.
    pub svd_rcond: f64,

    pub max_iterations: usize,
    pub tolerance_iteration: f64,
    /// Log coordinate-descent progress every this many sweeps (0 = never).
    pub output_frequency: usize,

    pub standardize: bool,
    /// Displacements are divided by this factor during elastic-net fitting.
    pub displacement_normalization_factor: f64,
    /// Refit the non-zero support with OLS after the elastic net.
    pub debias_after_l1: bool,

    pub cross_validation: CvMode,
    pub fold_assignment: FoldAssignment,
    pub cv_seed: u64,
    /// α used when cross-validation is off.
    pub l1_alpha: f64,
    /// Lower end of the α grid (defaults to `1e-6 · α_max`).
    pub l1_alpha_min: Option<f64>,
    /// Upper end of the α grid (defaults to the analytic estimate).
    pub l1_alpha_max: Option<f64>,
    pub num_l1_alpha: usize,
    /// 1 = LASSO; `0 < l1_ratio < 1` = elastic net.
    pub l1_ratio: f64,
    pub save_solution_path: bool,
    /// Stop the α path after this many consecutive validation-error increases
    /// (0 = never).
    pub stop_criterion: usize,

    /// Tolerance used when checking `max|Cx - d|` and reducing constraints.
    pub tolerance_constraint: f64,
    /// Coefficients with `|x| <= coef_zero_threshold` count as zero.
    pub coef_zero_threshold: f64,
}

impl Default for OptimizerControl {
    fn default() -> Self {
        Self {
            linear_model: LinearModel::LeastSquares,
            constraint_mode: ConstraintMode::Algebraic,
            use_sparse_solver: false,
            sparse_solver: SparseSolver::Ldlt,
            use_cholesky: false,
            chunk_size: 100,
            data_multiplier: false,
            svd_rcond: 1e-12,
            max_iterations: 10_000,
            tolerance_iteration: 1e-8,
            output_frequency: 1000,
            standardize: true,
            displacement_normalization_factor: 1.0,
            debias_after_l1: false,
            cross_validation: CvMode::Off,
            fold_assignment: FoldAssignment::Contiguous,
            cv_seed: 0,
            l1_alpha: 0.0,
            l1_alpha_min: None,
            l1_alpha_max: None,
            num_l1_alpha: 50,
            l1_ratio: 1.0,
            save_solution_path: false,
            stop_criterion: 5,
            tolerance_constraint: 1e-6,
            coef_zero_threshold: 1e-12,
        }
    }
}

impl OptimizerControl {
    /// Parse and validate a JSON document; missing keys take their defaults.
    pub fn from_json_str(s: &str) -> FitResult<Self> {
        let control: OptimizerControl = serde_json::from_str(s)?;
        control.validate()?;
        Ok(control)
    }

    pub fn validate(&self) -> FitResult<()> {
        positive_finite("tolerance_iteration", self.tolerance_iteration)?;
        positive_finite("tolerance_constraint", self.tolerance_constraint)?;
        positive_finite("svd_rcond", self.svd_rcond)?;
        positive_finite(
            "displacement_normalization_factor",
            self.displacement_normalization_factor,
        )?;
        if !(self.coef_zero_threshold.is_finite() && self.coef_zero_threshold >= 0.0) {
            return Err(FitError::control("coef_zero_threshold must be finite and >= 0"));
        }
        if self.max_iterations == 0 {
            return Err(FitError::control("max_iterations must be > 0"));
        }
        if self.chunk_size == 0 {
            return Err(FitError::control("chunk_size must be > 0"));
        }
        if !(self.l1_ratio.is_finite() && self.l1_ratio > 0.0 && self.l1_ratio <= 1.0) {
            return Err(FitError::control(format!(
                "l1_ratio must lie in (0, 1], got {}",
                self.l1_ratio
            )));
        }
        if !(self.l1_alpha.is_finite() && self.l1_alpha >= 0.0) {
            return Err(FitError::control("l1_alpha must be finite and >= 0"));
        }
        for (name, value) in [("l1_alpha_min", self.l1_alpha_min), ("l1_alpha_max", self.l1_alpha_max)] {
            if let Some(v) = value {
                positive_finite(name, v)?;
            }
        }
        if let (Some(lo), Some(hi)) = (self.l1_alpha_min, self.l1_alpha_max) {
            if lo >= hi {
                return Err(FitError::control(format!(
                    "l1_alpha_min ({lo}) must be below l1_alpha_max ({hi})"
                )));
            }
        }

        if self.constraint_mode == ConstraintMode::Explicit {
            if self.use_sparse_solver {
                return Err(FitError::control(
                    "the sparse solver requires constraint_mode none or algebraic",
                ));
            }
            if self.use_cholesky {
                return Err(FitError::control(
                    "the Cholesky solver requires constraint_mode none or algebraic",
                ));
            }
            if self.linear_model == LinearModel::ElasticNet {
                return Err(FitError::control(
                    "the elastic net requires constraint_mode none or algebraic",
                ));
            }
        }

        if self.linear_model == LinearModel::ElasticNet {
            match self.cross_validation {
                CvMode::Off => {}
                CvMode::Manual | CvMode::KFold { .. } if self.num_l1_alpha < 2 => {
                    return Err(FitError::control("num_l1_alpha must be >= 2 for cross-validation"));
                }
                CvMode::KFold { folds } if folds < 2 => {
                    return Err(FitError::control("k-fold cross-validation needs at least 2 folds"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn is_cross_validation(&self) -> bool {
        self.linear_model == LinearModel::ElasticNet && self.cross_validation != CvMode::Off
    }
}

fn positive_finite(name: &str, value: f64) -> FitResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(FitError::control(format!("{name} must be finite and > 0, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(OptimizerControl::default().validate().is_ok());
    }

    #[test]
    fn json_fills_missing_keys_with_defaults() {
        let control = OptimizerControl::from_json_str(
            r#"{"linear_model": "elastic_net", "cross_validation": {"kind": "k_fold", "folds": 4}, "l1_ratio": 0.5}"#,
        )
        .unwrap();
        assert_eq!(control.linear_model, LinearModel::ElasticNet);
        assert_eq!(control.cross_validation, CvMode::KFold { folds: 4 });
        assert_eq!(control.num_l1_alpha, 50);
        assert_eq!(control.stop_criterion, 5);
    }

    #[test]
    fn rejects_incompatible_combinations() {
        let control = OptimizerControl {
            constraint_mode: ConstraintMode::Explicit,
            use_cholesky: true,
            ..OptimizerControl::default()
        };
        assert_eq!(control.validate().unwrap_err().exit_code(), 2);

        let control = OptimizerControl {
            l1_ratio: 0.0,
            ..OptimizerControl::default()
        };
        assert!(control.validate().is_err());

        let control = OptimizerControl {
            linear_model: LinearModel::ElasticNet,
            cross_validation: CvMode::KFold { folds: 1 },
            ..OptimizerControl::default()
        };
        assert!(control.validate().is_err());
    }
}
