//! Crate-wide error type.
//!
//! Every variant carries a stable exit code so an outer driver can map a failed
//! fit to a process status without matching on messages.

use thiserror::Error;

pub type FitResult<T> = Result<T, FitError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    /// Malformed or inconsistent input shapes.
    #[error("dimension error: {0}")]
    Dimension(String),

    /// Conflicting or malformed constraint input.
    #[error("constraint error: {0}")]
    Constraint(String),

    /// The constraint rows cannot be satisfied simultaneously.
    #[error("infeasible constraints for order {order}: residual {residual:.3e} after reduction")]
    InfeasibleConstraint { order: usize, residual: f64 },

    /// Divergence or non-finite values in a numerical routine.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// The optimizer configuration is invalid.
    #[error("invalid optimizer control: {0}")]
    InvalidControl(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FitError {
    pub fn exit_code(&self) -> u8 {
        match self {
            FitError::InvalidControl(_) => 2,
            FitError::Dimension(_) => 3,
            FitError::Constraint(_) | FitError::InfeasibleConstraint { .. } => 4,
            FitError::Numerical(_) => 5,
            FitError::Io(_) | FitError::Serialization(_) => 6,
        }
    }

    pub(crate) fn dimension(message: impl Into<String>) -> Self {
        FitError::Dimension(message.into())
    }

    pub(crate) fn constraint(message: impl Into<String>) -> Self {
        FitError::Constraint(message.into())
    }

    pub(crate) fn numerical(message: impl Into<String>) -> Self {
        FitError::Numerical(message.into())
    }

    pub(crate) fn control(message: impl Into<String>) -> Self {
        FitError::InvalidControl(message.into())
    }
}

impl From<std::io::Error> for FitError {
    fn from(e: std::io::Error) -> Self {
        FitError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for FitError {
    fn from(e: serde_json::Error) -> Self {
        FitError::Serialization(e.to_string())
    }
}
