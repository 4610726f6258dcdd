//! Human-readable reports of fits and cross-validation runs.

pub mod format;

pub use format::*;
