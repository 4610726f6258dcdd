//! Fitting orchestration.
//!
//! Responsibilities:
//!
//! - constrained least squares over the dense, normal-equation and sparse backends
//! - elastic-net coordinate descent with standardization and debiasing
//! - the α grid and cross-validated selection (parallel over folds)
//! - recovery of physical force constants from fitted coefficients

pub mod alpha_grid;
pub mod cv;
pub mod lasso;
pub mod recover;
pub mod solver;
pub mod sparse;

pub use alpha_grid::*;
pub use cv::*;
pub use lasso::*;
pub use recover::*;
pub use solver::*;
pub use sparse::*;
