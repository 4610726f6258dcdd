//! Linear constraints over the irreducible force-constant parameters.
//!
//! Responsibilities:
//!
//! - collect per-order constraint rows and user-fixed values
//! - generate the translational-invariance rows from the cluster tables
//! - reduce the system to an affine map (algebraic elimination) or to a particular
//!   solution plus null-space basis (explicit equality-constrained solve)

pub mod invariance;
pub mod reduction;
pub mod set;

pub use invariance::*;
pub use reduction::*;
pub use set::*;
