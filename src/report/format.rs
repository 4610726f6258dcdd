//! Terminal-friendly renderings of fit diagnostics and CV tables.
//!
//! Formatting lives here so the numerical code never builds strings and output
//! changes stay local.

use chrono::{DateTime, Utc};

use crate::domain::FitWarning;
use crate::fit::CvSummary;
use crate::pipeline::FitOutcome;

/// CV error table: one row per α with fold mean/std, the selected row marked `*`.
pub fn format_cv_table(summary: &CvSummary, generated: DateTime<Utc>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# cross-validation scores, generated {}\n",
        generated.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out.push_str(&format!(
        "# {} alphas, {} folds, selected alpha = {:.6e}\n",
        summary.alphas.len(),
        summary.folds.len(),
        summary.selected_alpha
    ));
    out.push_str(
        format!(
            "  {:>5} {:>14} {:>14} {:>14} {:>14} {:>14} {:>6}\n",
            "index", "alpha", "train_mean", "train_std", "valid_mean", "valid_std", "folds"
        )
        .trim_end(),
    );
    out.push('\n');

    for (i, (alpha, score)) in summary.alphas.iter().zip(&summary.scores).enumerate() {
        let mark = if i == summary.selected_index { "*" } else { " " };
        let line = match score {
            Some(s) => format!(
                "{mark} {i:>5} {alpha:>14.6e} {:>14.6e} {:>14.6e} {:>14.6e} {:>14.6e} {:>6}",
                s.training_mean, s.training_std, s.validation_mean, s.validation_std, s.n_folds
            ),
            None => format!("{mark} {i:>5} {alpha:>14.6e} {:>14}", "-"),
        };
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Short run summary: status, errors, rank, constraint check and warnings.
pub fn format_fit_summary(outcome: &FitOutcome) -> String {
    let d = &outcome.diagnostics;
    let mut out = String::new();

    out.push_str("=== force-constant fit ===\n");
    out.push_str(&format!("Status: {:?}\n", d.status));
    out.push_str(&format!("Parameters: {}\n", outcome.parameters.len()));
    for order in &outcome.fc_values.orders {
        let nonzero = order.values.iter().filter(|v| **v != 0.0).count();
        out.push_str(&format!(
            "  order {}: {} classes, {} elements ({} non-zero)\n",
            order.order,
            order.nequiv.len(),
            order.values.len(),
            nonzero
        ));
    }
    out.push_str(&format!("Training error: {:.6e}\n", d.training_error));
    if let Some(v) = d.validation_error {
        out.push_str(&format!("Validation error: {v:.6e}\n"));
    }
    if let Some(r) = d.rank {
        out.push_str(&format!("Rank: {}/{}\n", r.rank, r.cols));
    }
    out.push_str(&format!("Constraint violation: {:.3e}\n", d.constraint_violation));
    if let Some(it) = d.iterations {
        out.push_str(&format!("Iterations: {it}\n"));
    }
    if let Some(cv) = &d.cv {
        out.push_str(&format!(
            "Selected alpha: {:.6e} (index {} of {})\n",
            cv.selected_alpha,
            cv.selected_index,
            cv.alphas.len()
        ));
    }

    if !d.warnings.is_empty() {
        out.push_str("\nWarnings:\n");
        for w in &d.warnings {
            out.push_str(&format!("- {}\n", describe_warning(w)));
        }
    }
    out
}

fn describe_warning(w: &FitWarning) -> String {
    match w {
        FitWarning::RankDeficient { rank, cols } => {
            format!("rank deficient design ({rank} of {cols} columns), minimum-norm solution")
        }
        FitWarning::MaxIterationsReached { alpha, iterations } => {
            format!("alpha {alpha:.3e}: no convergence after {iterations} sweeps")
        }
        FitWarning::CholeskyFallback { reason } => format!("Cholesky fallback: {reason}"),
        FitWarning::SparseSolverFallback { solver, reason } => {
            format!("sparse {solver:?} fallback: {reason}")
        }
        FitWarning::FoldFailed { fold, alpha, reason } => {
            format!("fold {fold} failed at alpha {alpha:.3e}: {reason}")
        }
        FitWarning::PathStoppedEarly { fold, alpha_index } => {
            format!("fold {fold} stopped early at alpha index {alpha_index}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::domain::{FcValues, FitDiagnostics, FitStatus, OrderValues, RankInfo, SparseSolver};
    use crate::fit::CvScore;

    fn score(alpha: f64, valid: f64) -> Option<CvScore> {
        Some(CvScore {
            alpha,
            training_mean: valid / 2.0,
            training_std: 0.0,
            validation_mean: valid,
            validation_std: 0.01,
            n_folds: 3,
        })
    }

    #[test]
    fn cv_table_marks_selected_row() {
        let summary = CvSummary {
            alphas: vec![1.0, 0.1, 0.01],
            folds: Vec::new(),
            scores: vec![score(1.0, 0.5), score(0.1, 0.2), None],
            selected_index: 1,
            selected_alpha: 0.1,
        };
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let text = format_cv_table(&summary, ts);
        assert!(text.contains("2024-03-01 12:00:00 UTC"));
        let rows: Vec<&str> = text.lines().skip(3).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[1].starts_with('*'));
        assert!(!rows[0].starts_with('*'));
        assert!(rows[2].ends_with('-'));
    }

    #[test]
    fn fit_summary_lists_warnings() {
        let outcome = FitOutcome {
            parameters: vec![1.0, -1.0],
            fc_values: FcValues {
                orders: vec![OrderValues {
                    order: 1,
                    values: vec![1.0, 1.0, -1.0, -1.0],
                    nequiv: vec![2, 2],
                }],
            },
            diagnostics: FitDiagnostics {
                status: FitStatus::Solved,
                training_error: 1e-3,
                validation_error: None,
                rank: Some(RankInfo { rank: 1, cols: 2 }),
                constraint_violation: 0.0,
                iterations: None,
                warnings: vec![
                    FitWarning::SparseSolverFallback {
                        solver: SparseSolver::Ldlt,
                        reason: "pivot ratio below rcond".to_string(),
                    },
                    FitWarning::RankDeficient { rank: 1, cols: 2 },
                ],
                cv: None,
            },
        };
        let text = format_fit_summary(&outcome);
        assert!(text.contains("Rank: 1/2"));
        assert!(text.contains("order 1: 2 classes, 4 elements (4 non-zero)"));
        assert!(text.contains("rank deficient design"));
        assert!(text.contains("sparse Ldlt fallback: pivot ratio below rcond"));
    }
}
