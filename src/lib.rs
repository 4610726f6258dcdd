//! `ifc-fit` library crate.
//!
//! Fits interatomic force constants to displacement/force samples by constrained
//! least squares or elastic-net regression. The crate is a pure library:
//!
//! - symmetry analysis and cluster enumeration happen upstream and arrive here as
//!   `ClusterTables` plus constraint rows
//! - the library never installs a logger; callers pick one for the `log` facade
//! - results come back as plain values (`FitOutcome`) for external writers

pub mod constraint;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod pipeline;
pub mod report;
pub mod sensing;

pub use error::{FitError, FitResult};
pub use pipeline::{FitOutcome, ForceConstantFitter};
