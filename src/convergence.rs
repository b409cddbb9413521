//! Stopping criteria for the solving process.
//!
//! Every solve ends with exactly one terminal [`Status`]. The criteria are
//! checked in a fixed priority order after each outer iteration, so when
//! several hold simultaneously, the first one in the order wins.

use getset::{CopyGetters, Setters};
use nalgebra::convert;

use crate::core::RealField;

/// Tolerances of the stopping tests, validated to be positive before any
/// iteration begins.
#[derive(Debug, Clone, Copy, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct Tolerances<T: RealField + Copy> {
    /// Tolerance on the scaled residual norm. Default: `EPSILON^(1/3)`.
    fx_norm: T,
    /// Tolerance on the scaled step length. Default: `EPSILON^(2/3)`.
    step: T,
}

impl<T: RealField + Copy> Tolerances<T> {
    /// Creates the tolerances with given values.
    pub fn new(fx_norm: T, step: T) -> Self {
        Self { fx_norm, step }
    }

    /// Determines whether both tolerances are strictly positive.
    pub fn is_valid(&self) -> bool {
        let zero = convert(0.0);
        self.fx_norm > zero && self.step > zero
    }
}

impl<T: RealField + Copy> Default for Tolerances<T> {
    fn default() -> Self {
        Self {
            fx_norm: T::EPSILON_CBRT,
            step: T::EPSILON_CBRT * T::EPSILON_CBRT,
        }
    }
}

/// Terminal status of a finished solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The scaled residual norm dropped below the residual tolerance; the
    /// final iterate is an approximate root.
    Converged,
    /// The scaled step length dropped below the step tolerance. The iterate
    /// is the best achievable approximation, but this may also indicate
    /// stagnation near a root with an ill-conditioned Jacobian.
    StepBelowTolerance,
    /// The iteration budget was exhausted before any other criterion was
    /// satisfied.
    MaxIterationsReached,
    /// The globalization strategy repeatedly failed to make progress from
    /// the current iterate.
    Stagnated,
    /// The linear solver could not produce any usable step.
    LinearSolverFailed,
}

impl Status {
    /// Determines whether the status represents a successfully found
    /// approximation of a root.
    pub fn is_converged(&self) -> bool {
        matches!(self, Status::Converged | Status::StepBelowTolerance)
    }
}

/// Snapshot of the solving process after one outer iteration, examined by
/// the stopping tests.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint<T> {
    /// Scaled residual norm in the current iterate.
    pub fx_norm: T,
    /// Scaled length of the last accepted step, if any was accepted in this
    /// iteration.
    pub step_norm: Option<T>,
    /// Number of attempted outer iterations so far.
    pub iterations: usize,
    /// Number of consecutive globalization failures.
    pub stalled_iterations: usize,
    /// Whether the linear solver reported an irrecoverable breakdown in this
    /// iteration.
    pub linear_solver_lost: bool,
}

/// The stopping tests of the solving process.
#[derive(Debug, Clone, Copy)]
pub struct Convergence<T: RealField + Copy> {
    tolerances: Tolerances<T>,
    max_iterations: usize,
    max_stalled: usize,
}

impl<T: RealField + Copy> Convergence<T> {
    /// Creates the stopping tests from the tolerances, the iteration budget
    /// and the allowed number of consecutive globalization failures.
    pub fn new(tolerances: Tolerances<T>, max_iterations: usize, max_stalled: usize) -> Self {
        Self {
            tolerances,
            max_iterations,
            max_stalled,
        }
    }

    /// Examines the checkpoint and returns the terminal status if any
    /// criterion is satisfied.
    ///
    /// The criteria are checked in a fixed priority order: residual norm,
    /// step length, iteration budget, stagnation, linear solver breakdown.
    pub fn check(&self, checkpoint: &Checkpoint<T>) -> Option<Status> {
        if checkpoint.fx_norm < self.tolerances.fx_norm() {
            return Some(Status::Converged);
        }

        if let Some(step_norm) = checkpoint.step_norm {
            if step_norm < self.tolerances.step() {
                return Some(Status::StepBelowTolerance);
            }
        }

        if checkpoint.iterations >= self.max_iterations {
            return Some(Status::MaxIterationsReached);
        }

        if self.max_stalled > 0 && checkpoint.stalled_iterations >= self.max_stalled {
            return Some(Status::Stagnated);
        }

        if checkpoint.linear_solver_lost {
            return Some(Status::LinearSolverFailed);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(fx_norm: f64) -> Checkpoint<f64> {
        Checkpoint {
            fx_norm,
            step_norm: None,
            iterations: 1,
            stalled_iterations: 0,
            linear_solver_lost: false,
        }
    }

    #[test]
    fn default_tolerances_are_valid() {
        assert!(Tolerances::<f64>::default().is_valid());
        assert!(Tolerances::<f32>::default().is_valid());
    }

    #[test]
    fn nonpositive_tolerances_are_invalid() {
        assert!(!Tolerances::new(0.0, 1e-11).is_valid());
        assert!(!Tolerances::new(1e-6, -1.0).is_valid());
    }

    #[test]
    fn no_criterion_satisfied() {
        let conv = Convergence::new(Tolerances::new(1e-6, 1e-11), 100, 5);

        assert_eq!(conv.check(&checkpoint(1.0)), None);
    }

    #[test]
    fn residual_norm_wins_over_all() {
        let conv = Convergence::new(Tolerances::new(1e-6, 1e-11), 100, 5);

        let c = Checkpoint {
            fx_norm: 1e-8,
            step_norm: Some(1e-12),
            iterations: 100,
            stalled_iterations: 5,
            linear_solver_lost: true,
        };

        assert_eq!(conv.check(&c), Some(Status::Converged));
    }

    #[test]
    fn step_length_wins_over_budget() {
        let conv = Convergence::new(Tolerances::new(1e-6, 1e-11), 100, 5);

        let c = Checkpoint {
            step_norm: Some(1e-12),
            iterations: 100,
            ..checkpoint(1.0)
        };

        assert_eq!(conv.check(&c), Some(Status::StepBelowTolerance));
    }

    #[test]
    fn budget_wins_over_stagnation() {
        let conv = Convergence::new(Tolerances::new(1e-6, 1e-11), 100, 5);

        let c = Checkpoint {
            iterations: 100,
            stalled_iterations: 5,
            linear_solver_lost: true,
            ..checkpoint(1.0)
        };

        assert_eq!(conv.check(&c), Some(Status::MaxIterationsReached));
    }

    #[test]
    fn stagnation_wins_over_linear_failure() {
        let conv = Convergence::new(Tolerances::new(1e-6, 1e-11), 100, 5);

        let c = Checkpoint {
            stalled_iterations: 5,
            linear_solver_lost: true,
            ..checkpoint(1.0)
        };

        assert_eq!(conv.check(&c), Some(Status::Stagnated));
    }

    #[test]
    fn linear_failure_is_checked_last() {
        let conv = Convergence::new(Tolerances::new(1e-6, 1e-11), 100, 5);

        let c = Checkpoint {
            linear_solver_lost: true,
            ..checkpoint(1.0)
        };

        assert_eq!(conv.check(&c), Some(Status::LinearSolverFailed));
    }

    #[test]
    fn rejected_iteration_has_no_step_length() {
        let conv = Convergence::new(Tolerances::new(1e-6, 1e-11), 100, 5);

        // Without an accepted step there is nothing to compare against the
        // step tolerance.
        let c = Checkpoint {
            step_norm: None,
            ..checkpoint(1.0)
        };

        assert_eq!(conv.check(&c), None);
    }
}
