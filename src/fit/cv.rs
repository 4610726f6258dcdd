//! Cross-validated selection of the elastic-net α.
//!
//! Stages: `Idle → BuildingFolds → PerAlphaFit → Aggregating → Selected`.
//!
//! - Folds are either the explicit validation set (manual mode) or K partitions of
//!   the training samples. Each fold gets its own engine over a private copy of its
//!   training rows; the shared sensing matrix is only read.
//! - Every fold walks the α grid from the largest value down, warm starting each fit
//!   from the previous iterate, and stops early after `stop_criterion` consecutive
//!   increases of its validation error.
//! - A numerical failure at one (fold, α) is recorded and excluded from the mean;
//!   the fold continues from its last good iterate.
//! - The selected α is the first (largest) one achieving the minimum mean
//!   validation error.

use nalgebra::DVector;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::{CvMode, FitStatus, FitWarning, FoldAssignment, OptimizerControl};
use crate::error::{FitError, FitResult};
use crate::fit::alpha_grid::alpha_path;
use crate::fit::lasso::CompressiveSensingEngine;
use crate::fit::recover::ParameterRecovery;
use crate::sensing::{DenseRows, SensingMatrix};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CvStage {
    Idle,
    BuildingFolds,
    PerAlphaFit,
    Aggregating,
    Selected,
}

/// One successful fit of one fold at one α.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvPoint {
    pub training_error: f64,
    pub validation_error: f64,
    /// Non-zero irreducible parameters per order.
    pub nonzeros: Vec<usize>,
    pub iterations: usize,
    pub status: FitStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FoldEntry {
    Fitted(CvPoint),
    Failed { reason: String },
    /// Not evaluated because the path stopped early.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldPath {
    pub fold: usize,
    /// One entry per α of the grid.
    pub entries: Vec<FoldEntry>,
    /// Index of the last α evaluated when the path stopped early.
    pub stopped_at: Option<usize>,
    /// Full irreducible coefficients per α, when `save_solution_path` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_path: Option<Vec<Option<Vec<f64>>>>,
}

/// Fold-aggregated errors at one α.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvScore {
    pub alpha: f64,
    pub training_mean: f64,
    pub training_std: f64,
    pub validation_mean: f64,
    pub validation_std: f64,
    /// Folds that produced a valid point at this α.
    pub n_folds: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvSummary {
    pub alphas: Vec<f64>,
    pub folds: Vec<FoldPath>,
    /// `None` where no fold produced a valid point.
    pub scores: Vec<Option<CvScore>>,
    pub selected_index: usize,
    pub selected_alpha: f64,
}

impl CvSummary {
    pub fn selected_score(&self) -> Option<&CvScore> {
        self.scores.get(self.selected_index).and_then(|s| s.as_ref())
    }
}

/// Summary plus the non-fatal conditions met on the way.
#[derive(Debug, Clone)]
pub struct CvRun {
    pub summary: CvSummary,
    pub warnings: Vec<FitWarning>,
}

struct Fold<'c> {
    index: usize,
    engine: CompressiveSensingEngine<'c>,
    validation: DenseRows,
}

struct FoldOutcome {
    path: FoldPath,
    warnings: Vec<FitWarning>,
}

/// Partition `n_samples` into `k` folds of validation indices.
pub fn assign_folds(
    n_samples: usize,
    k: usize,
    assignment: FoldAssignment,
    seed: u64,
) -> FitResult<Vec<Vec<usize>>> {
    if k < 2 {
        return Err(FitError::control("k-fold cross-validation needs at least 2 folds"));
    }
    if k > n_samples {
        return Err(FitError::control(format!(
            "{k} folds requested but only {n_samples} training samples"
        )));
    }
    let mut order: Vec<usize> = (0..n_samples).collect();
    if assignment == FoldAssignment::Shuffled {
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }
    Ok((0..k)
        .map(|f| {
            let lo = f * n_samples / k;
            let hi = (f + 1) * n_samples / k;
            let mut fold = order[lo..hi].to_vec();
            fold.sort_unstable();
            fold
        })
        .collect())
}

pub struct CrossValidator<'a> {
    control: &'a OptimizerControl,
    recovery: &'a ParameterRecovery,
    stage: CvStage,
}

impl<'a> CrossValidator<'a> {
    pub fn new(control: &'a OptimizerControl, recovery: &'a ParameterRecovery) -> Self {
        Self {
            control,
            recovery,
            stage: CvStage::Idle,
        }
    }

    pub fn stage(&self) -> CvStage {
        self.stage
    }

    fn enter(&mut self, next: CvStage) {
        log::debug!("cross-validation: {:?} -> {:?}", self.stage, next);
        self.stage = next;
    }

    /// α grid from the configured bounds, defaulting to the estimate on `full`.
    pub fn alpha_grid(&self, full: &CompressiveSensingEngine<'_>) -> FitResult<Vec<f64>> {
        let alpha_max = match self.control.l1_alpha_max {
            Some(v) => v,
            None => {
                let estimate = full.estimate_alpha_max();
                if !(estimate > 0.0) {
                    return Err(FitError::numerical(
                        "alpha_max estimate is zero: the target is orthogonal to every column",
                    ));
                }
                estimate
            }
        };
        let alpha_min = self.control.l1_alpha_min.unwrap_or(alpha_max * 1e-6);
        alpha_path(alpha_max, alpha_min, self.control.num_l1_alpha)
    }

    fn build_folds(
        &self,
        training: &SensingMatrix,
        validation: Option<&SensingMatrix>,
    ) -> FitResult<Vec<Fold<'a>>> {
        match self.control.cross_validation {
            CvMode::Off => Err(FitError::control("cross-validation is disabled")),
            CvMode::Manual => {
                let validation = validation.ok_or_else(|| {
                    FitError::control("manual cross-validation requires a validation dataset")
                })?;
                Ok(vec![Fold {
                    index: 0,
                    engine: CompressiveSensingEngine::new(training.dense_rows(), self.control),
                    validation: validation.dense_rows(),
                }])
            }
            CvMode::KFold { folds } => {
                let parts = assign_folds(
                    training.n_samples(),
                    folds,
                    self.control.fold_assignment,
                    self.control.cv_seed,
                )?;
                parts
                    .par_iter()
                    .enumerate()
                    .map(|(index, held_out)| {
                        let mut is_held = vec![false; training.n_samples()];
                        for &s in held_out {
                            is_held[s] = true;
                        }
                        let train_idx: Vec<usize> =
                            (0..training.n_samples()).filter(|&s| !is_held[s]).collect();
                        Ok(Fold {
                            index,
                            engine: CompressiveSensingEngine::new(
                                training.select_samples(&train_idx)?,
                                self.control,
                            ),
                            validation: training.select_samples(held_out)?,
                        })
                    })
                    .collect()
            }
        }
    }

    fn run_fold(&self, fold: &Fold<'_>, alphas: &[f64]) -> FitResult<FoldOutcome> {
        let control = self.control;
        let mut entries = Vec::with_capacity(alphas.len());
        let mut path = control.save_solution_path.then(|| Vec::with_capacity(alphas.len()));
        let mut warnings = Vec::new();
        let mut warm: Option<DVector<f64>> = None;
        let mut prev_validation: Option<f64> = None;
        let mut increases = 0;
        let mut stopped_at = None;

        for (ia, &alpha) in alphas.iter().enumerate() {
            if stopped_at.is_some() {
                entries.push(FoldEntry::Skipped);
                if let Some(p) = path.as_mut() {
                    p.push(None);
                }
                continue;
            }

            let point = match fold.engine.fit(alpha, warm.as_ref()) {
                Ok(point) => point,
                Err(FitError::Numerical(reason)) => {
                    log::warn!("fold {} failed at alpha = {alpha:.3e}: {reason}", fold.index);
                    warnings.push(FitWarning::FoldFailed {
                        fold: fold.index,
                        alpha,
                        reason: reason.clone(),
                    });
                    entries.push(FoldEntry::Failed { reason });
                    if let Some(p) = path.as_mut() {
                        p.push(None);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if point.status == FitStatus::MaxIterationsReached {
                warnings.push(FitWarning::MaxIterationsReached {
                    alpha,
                    iterations: point.iterations,
                });
            }

            let training_error = fold.engine.relative_error(&point.x);
            let validation_error = fold.validation.relative_error(&point.x);
            let x_full = self.recovery.to_full(&point.x);
            let nonzeros = self
                .recovery
                .nonzeros_per_order(&x_full, control.coef_zero_threshold);
            log::debug!(
                "fold {} alpha[{ia}] = {alpha:.3e}: train {training_error:.4e}, validation {validation_error:.4e}, nonzeros {nonzeros:?}",
                fold.index
            );

            entries.push(FoldEntry::Fitted(CvPoint {
                training_error,
                validation_error,
                nonzeros,
                iterations: point.iterations,
                status: point.status,
            }));
            if let Some(p) = path.as_mut() {
                p.push(Some(x_full.iter().copied().collect()));
            }

            if let Some(prev) = prev_validation {
                if validation_error > prev {
                    increases += 1;
                } else {
                    increases = 0;
                }
            }
            prev_validation = Some(validation_error);
            warm = Some(point.x_std);

            if control.stop_criterion > 0 && increases >= control.stop_criterion {
                log::warn!(
                    "fold {}: validation error rose {increases} times in a row; stopping at alpha[{ia}]",
                    fold.index
                );
                warnings.push(FitWarning::PathStoppedEarly {
                    fold: fold.index,
                    alpha_index: ia,
                });
                stopped_at = Some(ia);
            }
        }

        Ok(FoldOutcome {
            path: FoldPath {
                fold: fold.index,
                entries,
                stopped_at,
                solution_path: path,
            },
            warnings,
        })
    }

    /// Build folds, walk the α grid in every fold, aggregate and select.
    pub fn run(
        &mut self,
        full: &CompressiveSensingEngine<'_>,
        training: &SensingMatrix,
        validation: Option<&SensingMatrix>,
    ) -> FitResult<CvRun> {
        self.enter(CvStage::BuildingFolds);
        let alphas = self.alpha_grid(full)?;
        let folds = self.build_folds(training, validation)?;
        log::info!(
            "cross-validation: {} fold(s), {} alpha values from {:.3e} to {:.3e}",
            folds.len(),
            alphas.len(),
            alphas[0],
            alphas[alphas.len() - 1]
        );

        self.enter(CvStage::PerAlphaFit);
        let this = &*self;
        let outcomes = folds
            .par_iter()
            .map(|fold| this.run_fold(fold, &alphas))
            .collect::<Vec<_>>()
            .into_iter()
            .collect::<FitResult<Vec<_>>>()?;

        self.enter(CvStage::Aggregating);
        let mut warnings = Vec::new();
        let mut paths = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            warnings.extend(outcome.warnings);
            paths.push(outcome.path);
        }
        let scores = aggregate(&alphas, &paths);
        let selected_index = select(&scores).ok_or_else(|| {
            FitError::numerical("cross-validation produced no valid point at any alpha")
        })?;

        self.enter(CvStage::Selected);
        let selected_alpha = alphas[selected_index];
        log::info!("cross-validation selected alpha[{selected_index}] = {selected_alpha:.4e}");
        Ok(CvRun {
            summary: CvSummary {
                alphas,
                folds: paths,
                scores,
                selected_index,
                selected_alpha,
            },
            warnings,
        })
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Mean and standard deviation over the folds with a valid point at each α.
pub fn aggregate(alphas: &[f64], paths: &[FoldPath]) -> Vec<Option<CvScore>> {
    alphas
        .iter()
        .enumerate()
        .map(|(ia, &alpha)| {
            let points: Vec<&CvPoint> = paths
                .iter()
                .filter_map(|p| match p.entries.get(ia) {
                    Some(FoldEntry::Fitted(point)) => Some(point),
                    _ => None,
                })
                .collect();
            if points.is_empty() {
                return None;
            }
            let train: Vec<f64> = points.iter().map(|p| p.training_error).collect();
            let valid: Vec<f64> = points.iter().map(|p| p.validation_error).collect();
            let (training_mean, training_std) = mean_std(&train);
            let (validation_mean, validation_std) = mean_std(&valid);
            Some(CvScore {
                alpha,
                training_mean,
                training_std,
                validation_mean,
                validation_std,
                n_folds: points.len(),
            })
        })
        .collect()
}

/// Index of the minimum mean validation error; ties keep the earliest index.
pub fn select(scores: &[Option<CvScore>]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, score) in scores.iter().enumerate() {
        let Some(score) = score else { continue };
        let better = match best {
            None => true,
            Some((_, v)) => score.validation_mean < v,
        };
        if better {
            best = Some((i, score.validation_mean));
        }
    }
    best.map(|(i, _)| i)
}
