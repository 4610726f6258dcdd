//! Domain types used throughout the fitting engine.
//!
//! This module defines:
//!
//! - displacement/force datasets (`DisplacementDataset`)
//! - symmetry-reduced cluster tables (`ClusterTables`, `FcClass`, `FcElement`)
//! - the optimizer configuration (`OptimizerControl` and its enums)
//! - fit outputs (`FcValues`, `FitDiagnostics`, `FitWarning`)

pub mod control;
pub mod types;

pub use control::*;
pub use types::*;
