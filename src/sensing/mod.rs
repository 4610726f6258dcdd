//! Sensing matrix `A` and target `b` from displacement/force samples.

pub mod builder;
pub mod design;
pub mod normal;

pub use builder::*;
pub use design::*;
pub use normal::*;
