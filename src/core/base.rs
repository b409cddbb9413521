use nalgebra::RealField as NaRealField;
use thiserror::Error;

/// Extension of [`nalgebra::RealField`] with constants needed by the solver
/// machinery.
pub trait RealField: NaRealField {
    /// Machine epsilon.
    const EPSILON: Self;

    /// Square root of the machine epsilon. This value is a standard constant
    /// for epsilons in approximating first-order derivative-based concepts.
    const EPSILON_SQRT: Self;

    /// Cubic root of the machine epsilon. This value is a standard constant
    /// for epsilons in approximating second-order derivative-based concepts.
    const EPSILON_CBRT: Self;
}

impl RealField for f32 {
    const EPSILON: Self = f32::EPSILON;
    const EPSILON_SQRT: Self = 0.00034526698;
    const EPSILON_CBRT: Self = 0.0049215667;
}

impl RealField for f64 {
    const EPSILON: Self = f64::EPSILON;
    const EPSILON_SQRT: Self = 0.000000014901161193847656;
    const EPSILON_CBRT: Self = 0.0000060554544523933395;
}

/// The base trait for [`System`](super::system::System).
///
/// A problem has a fixed dimension *n* (the number of equations and
/// variables). Every vector the solver touches for a given problem shares
/// that length.
pub trait Problem {
    /// Type of the field, usually f32 or f64.
    type Field: RealField + Copy;

    /// Returns the dimension of the problem.
    fn dim(&self) -> usize;
}

/// Error while evaluating the residuals of a system.
///
/// Evaluation failure is recoverable: it signals that the given point is
/// invalid for the system, and solvers respond by shortening the attempted
/// step rather than aborting the whole process.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The residuals cannot be evaluated in the given point.
    #[error("residuals cannot be evaluated in the given point")]
    InvalidPoint,
    /// A custom error specific to the system.
    #[error("{0}")]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}
