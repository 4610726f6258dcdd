//! Input/output helpers.
//!
//! - CV score exports as CSV, text and JSON (`cvscore`)

pub mod cvscore;

pub use cvscore::*;
