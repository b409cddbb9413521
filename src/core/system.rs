use nalgebra::{
    storage::{Storage, StorageMut},
    Dyn, IsContiguous, Vector,
};

use super::base::{EvalError, Problem};

/// Definition of a system of equations.
///
/// ## Defining a system
///
/// A system is any type that implements [`System`] and [`Problem`] traits.
///
/// ```rust
/// use newton_krylov::nalgebra as na;
/// use newton_krylov::{EvalError, Problem, System};
/// use na::{Dyn, IsContiguous};
///
/// // A damped oscillator discretized to a steady-state problem.
/// struct Oscillator {
///     zeta: f64,
/// }
///
/// impl Problem for Oscillator {
///     type Field = f64;
///
///     fn dim(&self) -> usize {
///         2
///     }
/// }
///
/// impl System for Oscillator {
///     fn eval<Sx, Srx>(
///         &self,
///         x: &na::Vector<Self::Field, Dyn, Sx>,
///         rx: &mut na::Vector<Self::Field, Dyn, Srx>,
///     ) -> Result<(), EvalError>
///     where
///         Sx: na::storage::Storage<Self::Field, Dyn> + IsContiguous,
///         Srx: na::storage::StorageMut<Self::Field, Dyn>,
///     {
///         // Compute the residuals of all equations.
///         rx[0] = -self.zeta * x[0] - x[1];
///         rx[1] = x[0];
///         Ok(())
///     }
/// }
/// ```
pub trait System: Problem {
    /// Calculates the system residuals in given point.
    ///
    /// Returning an error signals that the point is invalid for the system.
    /// This is recoverable: solvers react by shortening the attempted step.
    fn eval<Sx, Srx>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        rx: &mut Vector<Self::Field, Dyn, Srx>,
    ) -> Result<(), EvalError>
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Srx: StorageMut<Self::Field, Dyn>;

    /// Calculates the product of the system Jacobian in point `x` with the
    /// vector `v`, i.e., the directional derivative of the residuals along
    /// `v`.
    ///
    /// The value of `rx` must contain the residuals in `x` as computed by
    /// [`eval`](System::eval) and `typ` is the typical magnitude of the
    /// variables (see
    /// [`Scaling::typical_magnitude`](super::scaling::Scaling::typical_magnitude)).
    ///
    /// The default implementation approximates the product by a one-sided
    /// finite difference of the residuals, which costs one evaluation of the
    /// system and allocates a temporary vector for the perturbed point on
    /// every call. Override it when an analytic directional derivative is
    /// available; this also avoids the allocation.
    fn jac_vec<Sx, Sv, Srx, Sjv>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        v: &Vector<Self::Field, Dyn, Sv>,
        rx: &Vector<Self::Field, Dyn, Srx>,
        typ: Self::Field,
        jv: &mut Vector<Self::Field, Dyn, Sjv>,
    ) -> Result<(), EvalError>
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Sv: Storage<Self::Field, Dyn> + IsContiguous,
        Srx: Storage<Self::Field, Dyn>,
        Sjv: StorageMut<Self::Field, Dyn>,
        Self: Sized,
    {
        crate::derivatives::jac_vec_fd(self, x, v, rx, typ, jv)
    }
}
