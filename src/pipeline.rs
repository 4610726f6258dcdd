//! End-to-end fit: samples in, force constants and diagnostics out.
//!
//! The workflow is:
//! validate inputs -> build the sensing matrix -> least squares or elastic net
//! (with cross-validation) -> recover the full irreducible vector -> expand to
//! per-element force constants.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::constraint::{AffineMap, LinearConstraintSet};
use crate::domain::{
    ClusterTables, ConstraintMode, DisplacementDataset, FcValues, FitDiagnostics, FitStatus,
    FitWarning, LinearModel, OptimizerControl, RankInfo,
};
use crate::error::{FitError, FitResult};
use crate::fit::{
    CompressiveSensingEngine, ConstrainedSolver, CrossValidator, CvSummary, ParameterRecovery,
    collapse_to_classes, expand_to_elements,
};
use crate::sensing::{ColumnBasis, SensingMatrixBuilder, Storage};

/// Everything a fit returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOutcome {
    /// Full irreducible parameter vector, orders ascending.
    pub parameters: Vec<f64>,
    pub fc_values: FcValues,
    pub diagnostics: FitDiagnostics,
}

/// Fields shared by both models before recovery.
struct ModelFit {
    x_full: DVector<f64>,
    status: FitStatus,
    training_error: f64,
    validation_error: Option<f64>,
    rank: Option<RankInfo>,
    iterations: Option<usize>,
    warnings: Vec<FitWarning>,
    cv: Option<CvSummary>,
}

#[derive(Debug, Clone)]
pub struct ForceConstantFitter {
    tables: ClusterTables,
    constraints: LinearConstraintSet,
}

impl ForceConstantFitter {
    pub fn new(tables: ClusterTables, constraints: LinearConstraintSet) -> FitResult<Self> {
        tables.validate()?;
        let shapes_match = constraints.orders().len() == tables.orders.len()
            && constraints
                .orders()
                .iter()
                .zip(&tables.orders)
                .all(|(c, t)| c.order == t.order && c.width == t.classes.len());
        if !shapes_match {
            return Err(FitError::dimension(
                "constraint set was not built for these cluster tables",
            ));
        }
        Ok(Self {
            tables,
            constraints,
        })
    }

    pub fn tables(&self) -> &ClusterTables {
        &self.tables
    }

    pub fn constraints(&self) -> &LinearConstraintSet {
        &self.constraints
    }

    pub fn fit(
        &self,
        training: &DisplacementDataset,
        validation: Option<&DisplacementDataset>,
        control: &OptimizerControl,
    ) -> FitResult<FitOutcome> {
        control.validate()?;
        training.validate(self.tables.nat)?;
        if let Some(v) = validation {
            v.validate(self.tables.nat)?;
        }
        log::info!(
            "fitting {} irreducible parameters from {} samples ({:?}, constraints {:?})",
            self.tables.n_params(),
            training.len(),
            control.linear_model,
            control.constraint_mode
        );

        let builder = SensingMatrixBuilder::new(&self.tables)?.with_data_multiplier(control.data_multiplier);
        let fit = match control.linear_model {
            LinearModel::LeastSquares => self.fit_least_squares(&builder, training, validation, control)?,
            LinearModel::ElasticNet => self.fit_elastic_net(&builder, training, validation, control)?,
        };

        let constraint_violation = self.constraints.max_violation(&fit.x_full);
        if control.constraint_mode != ConstraintMode::None
            && !self.constraints.satisfies(&fit.x_full, control.tolerance_constraint)
        {
            log::warn!(
                "fitted parameters violate the constraints by {constraint_violation:.3e} (tolerance {:.1e})",
                control.tolerance_constraint
            );
        }

        let fc_values = expand_to_elements(&self.tables, &fit.x_full)?;
        log::info!(
            "fit finished: {:?}, training error {:.4e}{}",
            fit.status,
            fit.training_error,
            fit.validation_error
                .map(|v| format!(", validation error {v:.4e}"))
                .unwrap_or_default()
        );

        Ok(FitOutcome {
            parameters: fit.x_full.iter().copied().collect(),
            fc_values,
            diagnostics: FitDiagnostics {
                status: fit.status,
                training_error: fit.training_error,
                validation_error: fit.validation_error,
                rank: fit.rank,
                constraint_violation,
                iterations: fit.iterations,
                warnings: fit.warnings,
                cv: fit.cv,
            },
        })
    }

    fn validation_error(
        &self,
        builder: &SensingMatrixBuilder<'_>,
        validation: Option<&DisplacementDataset>,
        x_full: &DVector<f64>,
    ) -> FitResult<Option<f64>> {
        validation
            .map(|v| {
                builder
                    .build(v, ColumnBasis::Full, Storage::Dense)
                    .map(|m| m.relative_error(x_full))
            })
            .transpose()
    }

    fn fit_least_squares(
        &self,
        builder: &SensingMatrixBuilder<'_>,
        training: &DisplacementDataset,
        validation: Option<&DisplacementDataset>,
        control: &OptimizerControl,
    ) -> FitResult<ModelFit> {
        let fit = ConstrainedSolver::new(builder, &self.constraints, control).solve(training)?;
        let validation_error = self.validation_error(builder, validation, &fit.x)?;
        let status = if fit.iterations.is_some() {
            FitStatus::Converged
        } else {
            FitStatus::Solved
        };
        Ok(ModelFit {
            status,
            training_error: fit.training_error,
            validation_error,
            rank: fit.rank,
            iterations: fit.iterations,
            warnings: fit.warnings,
            cv: None,
            x_full: fit.x,
        })
    }

    /// Elastic net in normalized displacements `u / s`; parameters of order n are
    /// divided by `s^n` on the way out.
    fn fit_elastic_net(
        &self,
        builder: &SensingMatrixBuilder<'_>,
        training: &DisplacementDataset,
        validation: Option<&DisplacementDataset>,
        control: &OptimizerControl,
    ) -> FitResult<ModelFit> {
        let s = control.displacement_normalization_factor;
        let algebraic = control.constraint_mode == ConstraintMode::Algebraic;
        let map = if algebraic {
            self.constraints.scaled(s).algebraic(control.tolerance_constraint)?
        } else {
            AffineMap::identity(self.tables.n_params())
        };
        let recovery = ParameterRecovery::new(&self.tables, map, s)?;
        let basis = if algebraic {
            ColumnBasis::Compact(recovery.map())
        } else {
            ColumnBasis::Full
        };

        let train_m = builder.build(&training.with_scaled_displacements(s), basis, Storage::Dense)?;
        let engine = CompressiveSensingEngine::new(train_m.dense_rows(), control);
        let mut warnings = Vec::new();

        let (alpha, cv) = if control.is_cross_validation() {
            let val_m = validation
                .map(|v| builder.build(&v.with_scaled_displacements(s), basis, Storage::Dense))
                .transpose()?;
            let run = CrossValidator::new(control, &recovery).run(&engine, &train_m, val_m.as_ref())?;
            warnings.extend(run.warnings);
            (run.summary.selected_alpha, Some(run.summary))
        } else {
            (control.l1_alpha, None)
        };

        let point = engine.fit(alpha, None)?;
        if point.status == FitStatus::MaxIterationsReached {
            warnings.push(FitWarning::MaxIterationsReached {
                alpha,
                iterations: point.iterations,
            });
        }
        let x_fit = if control.debias_after_l1 {
            engine.debias(&point.x)?
        } else {
            point.x
        };

        let training_error = engine.relative_error(&x_fit);
        let x_full = recovery.to_full(&x_fit);
        let validation_error = self.validation_error(builder, validation, &x_full)?;
        log::info!(
            "elastic net at alpha = {alpha:.4e}: {:?} non-zero parameters per order",
            recovery.nonzeros_per_order(&x_full, control.coef_zero_threshold)
        );

        Ok(ModelFit {
            x_full,
            status: point.status,
            training_error,
            validation_error,
            rank: None,
            iterations: Some(point.iterations),
            warnings,
            cv,
        })
    }

    /// Full irreducible vector from either free parameters (algebraic elimination
    /// with the default tolerance) or an already full vector, which is returned as is.
    pub fn recover_full_vector(&self, x: &[f64]) -> FitResult<Vec<f64>> {
        let n = self.tables.n_params();
        if x.len() == n {
            return Ok(x.to_vec());
        }
        let map = self
            .constraints
            .algebraic(OptimizerControl::default().tolerance_constraint)?;
        if x.len() != map.n_free() {
            return Err(FitError::dimension(format!(
                "expected {} free or {n} irreducible parameters, got {}",
                map.n_free(),
                x.len()
            )));
        }
        let full = map.expand(&DVector::from_column_slice(x));
        Ok(full.iter().copied().collect())
    }

    /// Per-element force constants of a full irreducible vector.
    pub fn fc_values(&self, x_full: &[f64]) -> FitResult<FcValues> {
        expand_to_elements(&self.tables, &DVector::from_column_slice(x_full))
    }

    /// Class means of per-element values.
    pub fn collapse(&self, fc: &FcValues) -> FitResult<Vec<f64>> {
        Ok(collapse_to_classes(&self.tables, fc)?.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CvMode, FcClass, FcElement, OrderTable};

    fn chain() -> ClusterTables {
        let classes = vec![
            FcClass::new(vec![FcElement::new(vec![0, 0], 1.0), FcElement::new(vec![3, 3], 1.0)]),
            FcClass::new(vec![FcElement::new(vec![0, 3], 1.0), FcElement::new(vec![3, 0], 1.0)]),
        ];
        ClusterTables::new(2, vec![OrderTable { order: 1, classes }])
    }

    fn data(n: usize) -> DisplacementDataset {
        let k = 1.25;
        let u: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                let a = 0.01 * (i as f64 + 1.0);
                let b = -0.007 * (i as f64 % 3.0 + 0.5);
                vec![a, 0.0, 0.0, b, 0.0, 0.0]
            })
            .collect();
        let f = u
            .iter()
            .map(|ui| vec![-k * (ui[0] - ui[3]), 0.0, 0.0, -k * (ui[3] - ui[0]), 0.0, 0.0])
            .collect();
        DisplacementDataset::new(u, f)
    }

    #[test]
    fn rejects_mismatched_constraint_shapes() {
        let other = ClusterTables::new(2, vec![OrderTable {
            order: 1,
            classes: vec![FcClass::new(vec![FcElement::new(vec![0, 0], 1.0)])],
        }]);
        let constraints = LinearConstraintSet::unconstrained(&other);
        assert!(ForceConstantFitter::new(chain(), constraints).is_err());
    }

    #[test]
    fn least_squares_recovers_spring_constant() {
        let tables = chain();
        let constraints = LinearConstraintSet::with_translational_invariance(&tables).unwrap();
        let fitter = ForceConstantFitter::new(tables, constraints).unwrap();
        let outcome = fitter.fit(&data(8), Some(&data(3)), &OptimizerControl::default()).unwrap();
        assert!((outcome.parameters[0] - 1.25).abs() < 1e-10);
        assert!((outcome.parameters[1] + 1.25).abs() < 1e-10);
        assert_eq!(outcome.diagnostics.status, FitStatus::Solved);
        assert!(outcome.diagnostics.validation_error.unwrap() < 1e-10);
        assert_eq!(outcome.fc_values.orders[0].values.len(), 4);
    }

    #[test]
    fn elastic_net_with_normalization_reports_physical_units() {
        let tables = chain();
        let constraints = LinearConstraintSet::with_translational_invariance(&tables).unwrap();
        let fitter = ForceConstantFitter::new(tables, constraints).unwrap();
        let control = OptimizerControl {
            linear_model: LinearModel::ElasticNet,
            l1_alpha: 1e-10,
            displacement_normalization_factor: 0.01,
            tolerance_iteration: 1e-12,
            ..OptimizerControl::default()
        };
        let outcome = fitter.fit(&data(8), None, &control).unwrap();
        assert!((outcome.parameters[0] - 1.25).abs() < 1e-4);
        assert!(outcome.diagnostics.constraint_violation < 1e-6);
        assert!(outcome.diagnostics.iterations.is_some());
    }

    #[test]
    fn cross_validation_summary_is_attached() {
        let tables = chain();
        let constraints = LinearConstraintSet::with_translational_invariance(&tables).unwrap();
        let fitter = ForceConstantFitter::new(tables, constraints).unwrap();
        let control = OptimizerControl {
            linear_model: LinearModel::ElasticNet,
            cross_validation: CvMode::KFold { folds: 3 },
            num_l1_alpha: 10,
            ..OptimizerControl::default()
        };
        let outcome = fitter.fit(&data(9), None, &control).unwrap();
        let cv = outcome.diagnostics.cv.unwrap();
        assert_eq!(cv.alphas.len(), 10);
        assert!(cv.selected_index < 10);
    }

    #[test]
    fn recover_full_vector_accepts_free_and_full_vectors() {
        let tables = chain();
        let constraints = LinearConstraintSet::with_translational_invariance(&tables).unwrap();
        let fitter = ForceConstantFitter::new(tables, constraints).unwrap();
        let full = fitter.recover_full_vector(&[0.5]).unwrap();
        assert_eq!(full.len(), 2);
        assert!((full[0] + full[1]).abs() < 1e-12);
        assert_eq!(fitter.recover_full_vector(&full).unwrap(), full);
        assert!(fitter.recover_full_vector(&[1.0, 2.0, 3.0]).is_err());

        let fc = fitter.fc_values(&full).unwrap();
        assert_eq!(fitter.collapse(&fc).unwrap(), full);
    }
}
