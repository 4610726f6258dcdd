//! Constrained least squares.
//!
//! The strategy is fixed by the configuration before any work starts:
//!
//! - constraint handling: none, algebraic elimination (solve for the free
//!   parameters, then expand) or explicit (null-space method on `C x = d`)
//! - backend: SVD on the sensing matrix, Cholesky on the chunked normal equations,
//!   or a sparse solver on compressed-column normal equations
//!
//! Cholesky and sparse failures are not fatal: they fall back to the rank-revealing
//! SVD and record a `CholeskyFallback` or `SparseSolverFallback` warning. A factor
//! whose pivot ratio is at or below `svd_rcond` counts as a failure.

use nalgebra::DVector;

use crate::constraint::LinearConstraintSet;
use crate::domain::{
    ConstraintMode, DisplacementDataset, FitWarning, OptimizerControl, RankInfo, SparseSolver,
};
use crate::error::{FitError, FitResult};
use crate::fit::sparse::{conjugate_gradient, ldlt_solve};
use crate::math::solve_least_squares;
use crate::sensing::{ColumnBasis, Design, SensingMatrixBuilder, Storage, sparse_normal_equations};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintHandling {
    Unconstrained,
    Algebraic,
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Svd,
    Cholesky,
    Sparse(SparseSolver),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolveStrategy {
    pub constraints: ConstraintHandling,
    pub backend: Backend,
}

impl SolveStrategy {
    pub fn from_control(control: &OptimizerControl) -> Self {
        let constraints = match control.constraint_mode {
            ConstraintMode::None => ConstraintHandling::Unconstrained,
            ConstraintMode::Algebraic => ConstraintHandling::Algebraic,
            ConstraintMode::Explicit => ConstraintHandling::Explicit,
        };
        let backend = if control.use_sparse_solver {
            Backend::Sparse(control.sparse_solver)
        } else if control.use_cholesky {
            Backend::Cholesky
        } else {
            Backend::Svd
        };
        Self { constraints, backend }
    }
}

/// Result of a least-squares fit in the full irreducible basis.
#[derive(Debug, Clone)]
pub struct LeastSquaresFit {
    pub x: DVector<f64>,
    pub rank: Option<RankInfo>,
    pub training_error: f64,
    pub iterations: Option<usize>,
    pub warnings: Vec<FitWarning>,
}

/// Solution in whatever basis the backend was handed.
struct BasisSolution {
    x: DVector<f64>,
    rank: Option<RankInfo>,
    training_error: f64,
    iterations: Option<usize>,
    warnings: Vec<FitWarning>,
}

pub struct ConstrainedSolver<'a> {
    builder: &'a SensingMatrixBuilder<'a>,
    constraints: &'a LinearConstraintSet,
    control: &'a OptimizerControl,
    strategy: SolveStrategy,
}

impl<'a> ConstrainedSolver<'a> {
    pub fn new(
        builder: &'a SensingMatrixBuilder<'a>,
        constraints: &'a LinearConstraintSet,
        control: &'a OptimizerControl,
    ) -> Self {
        Self {
            builder,
            constraints,
            control,
            strategy: SolveStrategy::from_control(control),
        }
    }

    pub fn strategy(&self) -> SolveStrategy {
        self.strategy
    }

    pub fn solve(&self, training: &DisplacementDataset) -> FitResult<LeastSquaresFit> {
        log::debug!("least squares strategy: {:?}", self.strategy);
        let (x, sol) = match self.strategy.constraints {
            ConstraintHandling::Unconstrained => {
                let sol = self.solve_in_basis(training, ColumnBasis::Full)?;
                (sol.x.clone(), sol)
            }
            ConstraintHandling::Algebraic => {
                let map = self.constraints.algebraic(self.control.tolerance_constraint)?;
                let sol = self.solve_in_basis(training, ColumnBasis::Compact(&map))?;
                (map.expand(&sol.x), sol)
            }
            ConstraintHandling::Explicit => {
                if self.strategy.backend != Backend::Svd {
                    return Err(FitError::control(
                        "explicit constraints are only supported with the SVD backend",
                    ));
                }
                let sol = self.solve_explicit(training)?;
                (sol.x.clone(), sol)
            }
        };

        let mut warnings = sol.warnings;
        if let Some(rank) = sol.rank.filter(|r| r.is_deficient()) {
            log::warn!(
                "sensing matrix is rank deficient ({} of {} columns); returning the minimum-norm solution",
                rank.rank,
                rank.cols
            );
            warnings.push(FitWarning::RankDeficient {
                rank: rank.rank,
                cols: rank.cols,
            });
        }

        Ok(LeastSquaresFit {
            x,
            rank: sol.rank,
            training_error: sol.training_error,
            iterations: sol.iterations,
            warnings,
        })
    }

    fn solve_in_basis(&self, training: &DisplacementDataset, basis: ColumnBasis<'_>) -> FitResult<BasisSolution> {
        let rcond = self.control.svd_rcond;
        match self.strategy.backend {
            Backend::Svd => {
                let m = self.builder.build(training, basis, Storage::Dense)?;
                let rows = m.dense_rows();
                let sol = solve_least_squares(&rows.a, &rows.b, rcond)?;
                Ok(BasisSolution {
                    training_error: rows.relative_error(&sol.x),
                    rank: Some(RankInfo {
                        rank: sol.rank,
                        cols: sol.cols,
                    }),
                    x: sol.x,
                    iterations: None,
                    warnings: Vec::new(),
                })
            }
            Backend::Cholesky => {
                let ne = self
                    .builder
                    .normal_equations(training, basis, self.control.chunk_size)?;
                let cols = ne.ata.ncols();
                let factor = match ne.ata.clone().cholesky() {
                    Some(chol) => {
                        let (lo, hi) = chol
                            .l_dirty()
                            .diagonal()
                            .iter()
                            .map(|l| l * l)
                            .fold((f64::INFINITY, 0.0_f64), |(lo, hi), d| (lo.min(d), hi.max(d)));
                        if lo > rcond * hi {
                            Ok(chol)
                        } else {
                            Err(format!(
                                "normal matrix is numerically singular (pivot ratio {:.3e})",
                                lo / hi
                            ))
                        }
                    }
                    None => Err("normal matrix is not positive definite".to_string()),
                };
                match factor {
                    Ok(chol) => {
                        let x = chol.solve(&ne.atb);
                        Ok(BasisSolution {
                            training_error: ne.relative_error(&x),
                            rank: Some(RankInfo { rank: cols, cols }),
                            x,
                            iterations: None,
                            warnings: Vec::new(),
                        })
                    }
                    Err(reason) => {
                        log::warn!("Cholesky failed ({reason}); falling back to SVD");
                        let sol = solve_least_squares(&ne.ata, &ne.atb, rcond)?;
                        Ok(BasisSolution {
                            training_error: ne.relative_error(&sol.x),
                            rank: Some(RankInfo {
                                rank: sol.rank,
                                cols: sol.cols,
                            }),
                            x: sol.x,
                            iterations: None,
                            warnings: vec![FitWarning::CholeskyFallback { reason }],
                        })
                    }
                }
            }
            Backend::Sparse(solver) => {
                let m = self.builder.build(training, basis, Storage::Sparse)?;
                let Design::Sparse(a) = &m.design else {
                    return Err(FitError::numerical("sparse backend received a dense design"));
                };
                let (ata, atb) = sparse_normal_equations(a, &m.target);
                let cols = ata.cols();
                let attempt = match solver {
                    SparseSolver::Ldlt => ldlt_solve(&ata, &atb, rcond)
                        .map(|x| (x, Some(RankInfo { rank: cols, cols }), None)),
                    SparseSolver::ConjugateGradient => conjugate_gradient(
                        &ata,
                        &atb,
                        self.control.max_iterations,
                        self.control.tolerance_iteration,
                    )
                    .map(|(x, it)| (x, None, Some(it))),
                };
                match attempt {
                    Ok((x, rank, iterations)) => Ok(BasisSolution {
                        training_error: m.relative_error(&x),
                        rank,
                        x,
                        iterations,
                        warnings: Vec::new(),
                    }),
                    Err(e) => {
                        let reason = e.to_string();
                        log::warn!("sparse {solver:?} solve failed ({reason}); falling back to SVD");
                        let rows = m.dense_rows();
                        let sol = solve_least_squares(&rows.a, &rows.b, rcond)?;
                        Ok(BasisSolution {
                            training_error: rows.relative_error(&sol.x),
                            rank: Some(RankInfo {
                                rank: sol.rank,
                                cols: sol.cols,
                            }),
                            x: sol.x,
                            iterations: None,
                            warnings: vec![FitWarning::SparseSolverFallback { solver, reason }],
                        })
                    }
                }
            }
        }
    }

    /// `min ||Ax - b||` subject to `C x = d`: `x = x_p + Z w` with w from the
    /// unconstrained problem `min ||A Z w - (b - A x_p)||`.
    fn solve_explicit(&self, training: &DisplacementDataset) -> FitResult<BasisSolution> {
        let ns = self.constraints.null_space(self.control.tolerance_constraint)?;
        let m = self.builder.build(training, ColumnBasis::Full, Storage::Dense)?;
        let rows = m.dense_rows();

        let az = &rows.a * &ns.z;
        let shifted = &rows.b - &rows.a * &ns.x_p;
        let sol = solve_least_squares(&az, &shifted, self.control.svd_rcond)?;
        let x = &ns.x_p + &ns.z * &sol.x;

        Ok(BasisSolution {
            training_error: rows.relative_error(&x),
            rank: Some(RankInfo {
                rank: sol.rank,
                cols: sol.cols,
            }),
            x,
            iterations: None,
            warnings: Vec::new(),
        })
    }
}
