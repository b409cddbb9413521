use nalgebra::{storage::StorageMut, Dyn, IsContiguous, Vector};

use super::{scaling::Scaling, system::System};

/// Description of one accepted iteration of a solver.
#[derive(Debug, Clone, Copy)]
pub struct Step<T> {
    /// Step length multiplier accepted by the globalization strategy.
    pub lambda: T,
    /// Scaled length of the accepted step.
    pub step_norm: T,
    /// Scaled residual norm in the new iterate.
    pub fx_norm: T,
}

/// Interface of a solver.
///
/// A solver is an iterative algorithm which takes the current iterate *x*
/// and computes the next one in the solving process. Repeated calls should
/// eventually converge into a solution *x'* in successful cases.
pub trait Solver<F: System> {
    /// Name of the solver.
    const NAME: &'static str;

    /// Error while computing the next iterate.
    ///
    /// Errors are not necessarily terminal. Drivers are free to absorb
    /// recoverable errors (e.g., a failed globalization in one iteration) and
    /// call `solve_next` again.
    type Error;

    /// Computes the next iterate in the solving process.
    ///
    /// The value of `x` is the current iterate and `rx` _must_ contain its
    /// residuals on input; the caller establishes this before the first call
    /// and the implementations keep the invariant afterwards. After the
    /// method returns successfully, `x` holds the accepted iterate and `rx`
    /// its residuals. When the method returns an error, both `x` and `rx`
    /// are left untouched.
    fn solve_next<Sx, Srx>(
        &mut self,
        f: &F,
        scaling: &Scaling<F::Field>,
        x: &mut Vector<F::Field, Dyn, Sx>,
        rx: &mut Vector<F::Field, Dyn, Srx>,
    ) -> Result<Step<F::Field>, Self::Error>
    where
        Sx: StorageMut<F::Field, Dyn> + IsContiguous,
        Srx: StorageMut<F::Field, Dyn>;
}
