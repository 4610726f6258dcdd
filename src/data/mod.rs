//! Data sources.

pub mod synthetic;

pub use synthetic::*;
