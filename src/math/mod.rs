//! Mathematical utilities: rank-revealing least squares, SVD null spaces and the
//! scalar kernels of the fitting engine.

pub mod kernels;
pub mod nullspace;
pub mod ols;

pub use kernels::*;
pub use nullspace::*;
pub use ols::*;
