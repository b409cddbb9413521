//! High-level API for solving systems of equations.
//!
//! This module contains a "driver" that encapsulates all internal state and
//! provides a simple API to run the iterative process until a stopping
//! criterion is reached.
//!
//! The simplest way of using the driver is to initialize it with the
//! defaults and run the whole process:
//!
//! ```rust
//! use newton_krylov::SolverDriver;
//! # use newton_krylov::nalgebra as na;
//! # use newton_krylov::{EvalError, Problem, System};
//! # use na::{Dyn, IsContiguous};
//! #
//! # struct MySystem;
//! #
//! # impl MySystem {
//! #     fn new() -> Self {
//! #         Self
//! #     }
//! # }
//! #
//! # impl Problem for MySystem {
//! #     type Field = f64;
//! #
//! #     fn dim(&self) -> usize {
//! #         2
//! #     }
//! # }
//! #
//! # impl System for MySystem {
//! #     fn eval<Sx, Srx>(
//! #         &self,
//! #         x: &na::Vector<Self::Field, Dyn, Sx>,
//! #         rx: &mut na::Vector<Self::Field, Dyn, Srx>,
//! #     ) -> Result<(), EvalError>
//! #     where
//! #         Sx: na::storage::Storage<Self::Field, Dyn> + IsContiguous,
//! #         Srx: na::storage::StorageMut<Self::Field, Dyn>,
//! #     {
//! #         rx[0] = x[0] + x[1] + 1.0;
//! #         rx[1] = x[0] - x[1] - 3.0;
//! #         Ok(())
//! #     }
//! # }
//!
//! let f = MySystem::new();
//!
//! let mut solver = SolverDriver::new(&f);
//!
//! let result = solver.solve().expect("invalid solver setup");
//! println!("{:?} in {} iterations", result.status(), result.iterations());
//! ```
//!
//! If you need to specify additional settings, use the builder:
//!
//! ```rust
//! use newton_krylov::{Scaling, SolverDriver, Tolerances};
//! # use newton_krylov::nalgebra as na;
//! # use newton_krylov::{EvalError, Problem, System};
//! # use na::{Dyn, IsContiguous};
//! #
//! # struct MySystem;
//! #
//! # impl MySystem {
//! #     fn new() -> Self {
//! #         Self
//! #     }
//! # }
//! #
//! # impl Problem for MySystem {
//! #     type Field = f64;
//! #
//! #     fn dim(&self) -> usize {
//! #         2
//! #     }
//! # }
//! #
//! # impl System for MySystem {
//! #     fn eval<Sx, Srx>(
//! #         &self,
//! #         x: &na::Vector<Self::Field, Dyn, Sx>,
//! #         rx: &mut na::Vector<Self::Field, Dyn, Srx>,
//! #     ) -> Result<(), EvalError>
//! #     where
//! #         Sx: na::storage::Storage<Self::Field, Dyn> + IsContiguous,
//! #         Srx: na::storage::StorageMut<Self::Field, Dyn>,
//! #     {
//! #         rx[0] = x[0] + x[1] + 1.0;
//! #         rx[1] = x[0] - x[1] - 3.0;
//! #         Ok(())
//! #     }
//! # }
//!
//! let f = MySystem::new();
//!
//! let mut solver = SolverDriver::builder(&f)
//!     .with_initial(vec![10.0, -10.0])
//!     .with_scaling(Scaling::uniform(2))
//!     .with_tolerances(Tolerances::new(1e-5, 1e-5))
//!     .with_max_iters(100)
//!     .build();
//! ```
//!
//! If you need more control over the iteration process, you can do the
//! iterations manually with [`next`](SolverDriver::next) or run them with a
//! custom stopping criterion with [`find`](SolverDriver::find).

use getset::CopyGetters;
use log::debug;
use nalgebra::{convert, DimName, Dyn, OVector, U1};
use thiserror::Error;

use crate::{
    algo::{newton_krylov::NewtonKrylovError, NewtonKrylov},
    convergence::{Checkpoint, Convergence, Status, Tolerances},
    core::{wrms_norm, EvalError, Problem, RealField, Scaling, Solver, Step, System},
};

/// Error returned from [`SolverDriver::solve`] for invalid inputs or an
/// unrecoverable residual evaluation failure.
///
/// All input validation happens before any iteration begins. Recoverable
/// conditions (evaluation failures in trial points, globalization failures,
/// linear solver breakdowns) never surface as this error; they are absorbed
/// by the process and reflected in the terminal [`Status`] instead.
#[derive(Debug, Error)]
pub enum SolveError {
    /// Dimension of the scaling vectors does not match the dimension of the
    /// problem.
    #[error("invalid dimension of the scaling vectors")]
    InvalidScalingDim,
    /// A scaling weight is zero or negative.
    #[error("scaling weights must be strictly positive")]
    NonPositiveScaling,
    /// A tolerance is zero or negative.
    #[error("tolerances must be strictly positive")]
    NonPositiveTolerance,
    /// The iteration budget is zero.
    #[error("iteration budget must be positive")]
    ZeroIterationBudget,
    /// The residuals could not be evaluated in the initial point.
    #[error("{0}")]
    System(#[from] EvalError),
}

/// Result of a finished solve.
#[derive(Debug, Clone, CopyGetters)]
pub struct SolveResult<T: RealField + Copy> {
    x: OVector<T, Dyn>,
    /// Terminal status of the solve.
    #[getset(get_copy = "pub")]
    status: Status,
    /// Number of attempted outer iterations.
    #[getset(get_copy = "pub")]
    iterations: usize,
    /// Number of residual evaluations, not counting evaluations hidden in
    /// finite-difference Jacobian-vector products.
    #[getset(get_copy = "pub")]
    residual_evals: usize,
    /// Number of Jacobian-vector products. With the default
    /// finite-difference product, each one costs one additional residual
    /// evaluation.
    #[getset(get_copy = "pub")]
    jac_products: usize,
    /// Scaled residual norm in the final iterate.
    #[getset(get_copy = "pub")]
    fx_norm: T,
}

impl<T: RealField + Copy> SolveResult<T> {
    /// Returns the final iterate.
    pub fn x(&self) -> &[T] {
        self.x.as_slice()
    }
}

/// Builder for the [`SolverDriver`].
pub struct SolverBuilder<'a, F: Problem, A> {
    f: &'a F,
    algo: A,
    scaling: Scaling<F::Field>,
    x0: OVector<F::Field, Dyn>,
    max_iters: usize,
    stagnation_limit: usize,
}

impl<'a, F: Problem> SolverBuilder<'a, F, NewtonKrylov<F>> {
    fn new(f: &'a F) -> Self {
        let dim = Dyn(f.dim());

        Self {
            f,
            algo: NewtonKrylov::new(f),
            scaling: Scaling::uniform(f.dim()),
            x0: OVector::from_element_generic(dim, U1::name(), convert(0.0)),
            max_iters: 200,
            stagnation_limit: 5,
        }
    }

    /// Sets the tolerances of the stopping tests.
    pub fn with_tolerances(mut self, tolerances: Tolerances<F::Field>) -> Self {
        self.algo.set_tolerances(tolerances);
        self
    }
}

impl<'a, F: Problem, A> SolverBuilder<'a, F, A> {
    /// Sets the initial point from which the iterative process starts.
    pub fn with_initial(mut self, x0: Vec<F::Field>) -> Self {
        let dim = Dyn(self.f.dim());
        self.x0 = OVector::from_vec_generic(dim, U1::name(), x0);
        self
    }

    /// Sets the scaling of the variables and the residuals.
    pub fn with_scaling(mut self, scaling: Scaling<F::Field>) -> Self {
        self.scaling = scaling;
        self
    }

    /// Sets the maximum number of outer iterations. Default: `200`.
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    /// Sets the number of consecutive globalization failures after which the
    /// process is declared stagnated. Zero disables the check. Default: `5`.
    pub fn with_stagnation_limit(mut self, stagnation_limit: usize) -> Self {
        self.stagnation_limit = stagnation_limit;
        self
    }

    /// Sets specific algorithm to be used.
    ///
    /// This builder method accepts a closure that takes the reference to the
    /// problem. For many algorithms, you can simply pass the `new`
    /// constructor directly (e.g., `NewtonKrylov::new`).
    pub fn with_algo<A2, FA>(self, factory: FA) -> SolverBuilder<'a, F, A2>
    where
        FA: FnOnce(&F) -> A2,
    {
        SolverBuilder {
            f: self.f,
            algo: factory(self.f),
            scaling: self.scaling,
            x0: self.x0,
            max_iters: self.max_iters,
            stagnation_limit: self.stagnation_limit,
        }
    }

    /// Builds the [`SolverDriver`].
    pub fn build(self) -> SolverDriver<'a, F, A> {
        let rx = self.x0.clone_owned();

        SolverDriver {
            f: self.f,
            algo: self.algo,
            scaling: self.scaling,
            x: self.x0,
            rx,
            max_iters: self.max_iters,
            stagnation_limit: self.stagnation_limit,
            primed: false,
        }
    }
}

/// The driver for the process of solving a system of equations.
///
/// For default settings, use [`SolverDriver::new`]. For more flexibility,
/// use [`SolverDriver::builder`]. For the usage of the driver, see
/// [module](self) documentation.
pub struct SolverDriver<'a, F: Problem, A = NewtonKrylov<F>> {
    f: &'a F,
    algo: A,
    scaling: Scaling<F::Field>,
    x: OVector<F::Field, Dyn>,
    rx: OVector<F::Field, Dyn>,
    max_iters: usize,
    stagnation_limit: usize,
    primed: bool,
}

impl<'a, F: Problem> SolverDriver<'a, F, NewtonKrylov<F>> {
    /// Returns the builder for specifying additional settings.
    pub fn builder(f: &'a F) -> SolverBuilder<'a, F, NewtonKrylov<F>> {
        SolverBuilder::new(f)
    }

    /// Initializes the driver with the default settings.
    pub fn new(f: &'a F) -> Self {
        SolverDriver::builder(f).build()
    }
}

impl<'a, F: Problem, A> SolverDriver<'a, F, A> {
    /// Returns reference to the current iterate.
    pub fn x(&self) -> &[F::Field] {
        self.x.as_slice()
    }

    /// Returns reference to the current residuals.
    ///
    /// The residuals are meaningful only after the first iteration (or a
    /// finished solve).
    pub fn rx(&self) -> &[F::Field] {
        self.rx.as_slice()
    }

    /// Returns the scaled norm of the current residuals.
    pub fn norm(&self) -> F::Field {
        wrms_norm(&self.rx, self.scaling.rx())
    }
}

impl<'a, F: System, A: Solver<F>> SolverDriver<'a, F, A>
where
    A::Error: From<EvalError>,
{
    /// Does one iteration of the process.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Step<F::Field>, A::Error> {
        if !self.primed {
            self.f
                .eval(&self.x, &mut self.rx)
                .map_err(A::Error::from)?;
            self.primed = true;
        }

        self.algo
            .solve_next(self.f, &self.scaling, &mut self.x, &mut self.rx)
    }

    /// Runs the iterative process until given stopping criterion is
    /// satisfied.
    pub fn find<C>(&mut self, stop: C) -> Result<(&[F::Field], F::Field), A::Error>
    where
        C: Fn(IterState<'_, F>) -> bool,
    {
        let mut iter = 0;

        loop {
            let step = self.next()?;

            let state = IterState {
                x: &self.x,
                rx: &self.rx,
                step,
                iter,
            };

            if stop(state) {
                return Ok((self.x.as_slice(), step.fx_norm));
            }

            iter += 1;
        }
    }

    /// Returns the name of the used solver.
    pub fn name(&self) -> &str {
        A::NAME
    }
}

impl<'a, F: System> SolverDriver<'a, F, NewtonKrylov<F>> {
    /// Runs the whole solving process until a terminal status is reached.
    ///
    /// The inputs are validated before any iteration begins; recoverable
    /// conditions during the process are absorbed and reflected in the
    /// terminal [`Status`] of the returned result. Invoking `solve` again on
    /// an already converged driver returns immediately with zero additional
    /// iterations.
    pub fn solve(&mut self) -> Result<SolveResult<F::Field>, SolveError> {
        let tolerances = self.algo.options().tolerances();

        if self.scaling.dim() != self.f.dim() {
            return Err(SolveError::InvalidScalingDim);
        }

        if !self.scaling.is_valid() {
            return Err(SolveError::NonPositiveScaling);
        }

        if !tolerances.is_valid() {
            return Err(SolveError::NonPositiveTolerance);
        }

        if self.max_iters == 0 {
            return Err(SolveError::ZeroIterationBudget);
        }

        let convergence = Convergence::new(tolerances, self.max_iters, self.stagnation_limit);

        let evals0 = self.algo.residual_evals();
        let products0 = self.algo.jac_products();
        let mut direct_evals = 0;

        if !self.primed {
            self.f.eval(&self.x, &mut self.rx)?;
            self.primed = true;
            direct_evals += 1;
        }

        let mut fx_norm = wrms_norm(&self.rx, self.scaling.rx());
        let mut iterations = 0;
        let mut stalled = 0;

        let mut checkpoint = Checkpoint {
            fx_norm,
            step_norm: None,
            iterations,
            stalled_iterations: stalled,
            linear_solver_lost: false,
        };

        // The initial iterate may already satisfy the residual test.
        let status = if let Some(status) = convergence.check(&checkpoint) {
            status
        } else {
            loop {
                iterations += 1;

                let (step_norm, lost) = match self.algo.solve_next(
                    self.f,
                    &self.scaling,
                    &mut self.x,
                    &mut self.rx,
                ) {
                    Ok(step) => {
                        stalled = 0;
                        fx_norm = step.fx_norm;
                        (Some(step.step_norm), false)
                    }
                    Err(NewtonKrylovError::Globalization(error)) => {
                        stalled += 1;
                        debug!("globalization failure #{}: {}", stalled, error);
                        (None, false)
                    }
                    Err(NewtonKrylovError::LinearSolve(error)) => {
                        debug!("linear solver failure: {}", error);
                        (None, true)
                    }
                    Err(NewtonKrylovError::Residual(error)) => {
                        return Err(SolveError::System(error));
                    }
                };

                checkpoint = Checkpoint {
                    fx_norm,
                    step_norm,
                    iterations,
                    stalled_iterations: stalled,
                    linear_solver_lost: lost,
                };

                if let Some(status) = convergence.check(&checkpoint) {
                    break status;
                }
            }
        };

        Ok(SolveResult {
            x: self.x.clone_owned(),
            status,
            iterations,
            residual_evals: direct_evals + (self.algo.residual_evals() - evals0),
            jac_products: self.algo.jac_products() - products0,
            fx_norm,
        })
    }
}

/// State of the current iteration.
pub struct IterState<'a, F: Problem> {
    x: &'a OVector<F::Field, Dyn>,
    rx: &'a OVector<F::Field, Dyn>,
    step: Step<F::Field>,
    iter: usize,
}

impl<'a, F: Problem> IterState<'a, F> {
    /// Returns reference to the current iterate.
    pub fn x(&self) -> &[F::Field] {
        self.x.as_slice()
    }

    /// Returns reference to the current residuals.
    pub fn rx(&self) -> &[F::Field] {
        self.rx.as_slice()
    }

    /// Returns the scaled norm of the current residuals.
    pub fn norm(&self) -> F::Field {
        self.step.fx_norm
    }

    /// Returns the accepted step length multiplier.
    pub fn lambda(&self) -> F::Field {
        self.step.lambda
    }

    /// Returns the current iteration number.
    pub fn iter(&self) -> usize {
        self.iter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{ExtendedRosenbrock, Guarded, Linear, NoSolution, StiffLinear};

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn basic_use_case() {
        let f = StiffLinear::new();
        let mut solver = SolverDriver::builder(&f)
            .with_initial(vec![2.0, 1.0])
            .with_tolerances(Tolerances::new(1e-5, 1e-5))
            .build();

        let result = solver.solve().unwrap();

        assert_eq!(result.status(), Status::Converged);
        assert!(result.iterations() <= 15);
        assert!(result.fx_norm() < 1e-5);
        assert_abs_diff_eq!(solver.x()[0], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(solver.x()[1], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn rosenbrock_with_finite_differences() {
        let f = ExtendedRosenbrock::new(2);
        let mut solver = SolverDriver::builder(&f)
            .with_initial(vec![-1.2, 1.0])
            .build();

        let result = solver.solve().unwrap();

        assert!(result.status().is_converged());
        assert_abs_diff_eq!(solver.x()[0], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(solver.x()[1], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn solving_again_is_idempotent() {
        let f = StiffLinear::new();
        let mut solver = SolverDriver::builder(&f)
            .with_initial(vec![2.0, 1.0])
            .with_tolerances(Tolerances::new(1e-5, 1e-5))
            .build();

        let first = solver.solve().unwrap();
        assert_eq!(first.status(), Status::Converged);

        let second = solver.solve().unwrap();
        assert_eq!(second.status(), Status::Converged);
        assert_eq!(second.iterations(), 0);
        assert_eq!(second.residual_evals(), 0);
        assert_eq!(second.jac_products(), 0);
        assert_eq!(solver.x(), first.x());
    }

    #[test]
    fn unattainable_tolerance_terminates() {
        // The root is irrational, so the tolerance cannot be reached in
        // finite precision.
        let f = Linear::new(dmatrix![1.0, 0.0; 0.0, 3.0], dvector![2.0f64.sqrt(), 1.0]);
        let mut solver = SolverDriver::builder(&f)
            .with_initial(vec![5.0, 5.0])
            .with_tolerances(Tolerances::new(1e-300, 1e-300))
            .with_max_iters(30)
            // Rule out the stagnation status to observe the budget check.
            .with_stagnation_limit(0)
            .build();

        let result = solver.solve().unwrap();

        assert_eq!(result.status(), Status::MaxIterationsReached);
        assert_eq!(result.iterations(), 30);
    }

    #[test]
    fn nonpositive_scaling_is_rejected_before_iterating() {
        let f = StiffLinear::new();
        let mut solver = SolverDriver::builder(&f)
            .with_initial(vec![2.0, 1.0])
            .with_scaling(Scaling::new(vec![1.0, -1.0], vec![1.0, 1.0]))
            .build();

        let result = solver.solve();

        assert!(matches!(result, Err(SolveError::NonPositiveScaling)));
    }

    #[test]
    fn nonpositive_tolerance_is_rejected_before_iterating() {
        let f = StiffLinear::new();
        let mut solver = SolverDriver::builder(&f)
            .with_tolerances(Tolerances::new(0.0, 1e-11))
            .build();

        assert!(matches!(
            solver.solve(),
            Err(SolveError::NonPositiveTolerance)
        ));
    }

    #[test]
    fn zero_iteration_budget_is_rejected() {
        let f = StiffLinear::new();
        let mut solver = SolverDriver::builder(&f).with_max_iters(0).build();

        assert!(matches!(solver.solve(), Err(SolveError::ZeroIterationBudget)));
    }

    #[test]
    fn initial_evaluation_failure_is_fatal() {
        let inner = Linear::new(dmatrix![1.0, 0.0; 0.0, 1.0], dvector![0.0, 0.0]);
        let f = Guarded::new(inner, 1.0);

        // The initial point is outside the valid region.
        let mut solver = SolverDriver::builder(&f)
            .with_initial(vec![10.0, 10.0])
            .build();

        assert!(matches!(solver.solve(), Err(SolveError::System(_))));
    }

    #[test]
    fn rootless_system_stagnates() {
        let f = NoSolution;
        let mut solver = SolverDriver::builder(&f)
            .with_initial(vec![1.0])
            .with_max_iters(100)
            .build();

        let result = solver.solve().unwrap();

        assert_eq!(result.status(), Status::Stagnated);
        assert!(result.iterations() < 100);
    }

    #[test]
    fn zero_jacobian_reports_linear_failure() {
        let f = Linear::new(nalgebra::DMatrix::zeros(2, 2), dvector![1.0, 1.0]);
        let mut solver = SolverDriver::new(&f);

        let result = solver.solve().unwrap();

        assert_eq!(result.status(), Status::LinearSolverFailed);
        assert_eq!(result.iterations(), 1);
    }

    #[test]
    fn manual_iterations() {
        let f = StiffLinear::new();
        let mut solver = SolverDriver::builder(&f)
            .with_initial(vec![2.0, 1.0])
            .build();

        let (_, norm) = solver
            .find(|state| state.norm() <= 1e-5 || state.iter() >= 100)
            .unwrap();

        assert!(norm <= 1e-5);
    }

    #[test]
    fn default_initial_is_zero() {
        let f = StiffLinear::new();
        let solver = SolverDriver::new(&f);

        assert_eq!(solver.x(), &[0.0, 0.0]);
    }
}
