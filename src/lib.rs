#![allow(clippy::many_single_char_names)]
#![allow(clippy::too_many_arguments)]
#![warn(missing_docs)]

//! # Newton-Krylov
//!
//! A pure Rust implementation of a globalized, Jacobian-free Newton-Krylov
//! method for solving nonlinear systems of equations.
//!
//! Given a system of *n* equations with *n* unknowns, the solver looks for a
//! point where all residuals vanish. Each outer Newton iteration solves the
//! linearized system with a matrix-free [GMRES](gmres) solver that only
//! needs Jacobian-vector products -- the Jacobian matrix is never formed.
//! The products are approximated by finite differences of the residuals by
//! default, so defining the residual function is all that is needed; an
//! analytic directional derivative can be supplied as an opt-in. A
//! backtracking [line search](line_search) globalizes the iteration so that
//! progress is made even from initial guesses far from a root, and an
//! inexact-Newton forcing sequence keeps the linear solves as cheap as the
//! current accuracy allows.
//!
//! ## Problem
//!
//! Mathematically, the problem is formulated as
//!
//! ```text
//! F(x) = 0,
//!
//! where F(x) = { f1(x), ..., fn(x) }
//! and x = { x1, ..., xn }
//! ```
//!
//! When it comes to code, the problem is any type that implements the
//! [`System`] and [`Problem`] traits.
//!
//! ```rust
//! // The crate is based on the `nalgebra` crate.
//! use newton_krylov::nalgebra as na;
//! use newton_krylov::{EvalError, Problem, System};
//! use na::{Dyn, IsContiguous};
//!
//! // A problem is represented by a type.
//! struct Stationary;
//!
//! impl Problem for Stationary {
//!     // The numeric type. Usually f64 or f32.
//!     type Field = f64;
//!
//!     // The number of equations and variables.
//!     fn dim(&self) -> usize {
//!         2
//!     }
//! }
//!
//! impl System for Stationary {
//!     // Evaluate trial values of variables to the system.
//!     fn eval<Sx, Srx>(
//!         &self,
//!         x: &na::Vector<Self::Field, Dyn, Sx>,
//!         rx: &mut na::Vector<Self::Field, Dyn, Srx>,
//!     ) -> Result<(), EvalError>
//!     where
//!         Sx: na::storage::Storage<Self::Field, Dyn> + IsContiguous,
//!         Srx: na::storage::StorageMut<Self::Field, Dyn>,
//!     {
//!         // Compute the residuals of all equations.
//!         rx[0] = -101.0 * x[0] - 100.0 * x[1];
//!         rx[1] = x[0];
//!         Ok(())
//!     }
//! }
//! ```
//!
//! And that's it. There is no need for defining the Jacobian matrix or even
//! its products; the finite difference technique (usually sufficient in
//! practice) is used automatically.
//!
//! ## Solving
//!
//! When you have your system available, you can use the [`SolverDriver`] to
//! run the whole process until a terminal status is reached.
//!
//! ```rust
//! use newton_krylov::{SolverDriver, Tolerances};
//! # use newton_krylov::nalgebra as na;
//! # use newton_krylov::{EvalError, Problem, System};
//! # use na::{Dyn, IsContiguous};
//! #
//! # struct Stationary;
//! #
//! # impl Problem for Stationary {
//! #     type Field = f64;
//! #
//! #     fn dim(&self) -> usize {
//! #         2
//! #     }
//! # }
//! #
//! # impl System for Stationary {
//! #     fn eval<Sx, Srx>(
//! #         &self,
//! #         x: &na::Vector<Self::Field, Dyn, Sx>,
//! #         rx: &mut na::Vector<Self::Field, Dyn, Srx>,
//! #     ) -> Result<(), EvalError>
//! #     where
//! #         Sx: na::storage::Storage<Self::Field, Dyn> + IsContiguous,
//! #         Srx: na::storage::StorageMut<Self::Field, Dyn>,
//! #     {
//! #         rx[0] = -101.0 * x[0] - 100.0 * x[1];
//! #         rx[1] = x[0];
//! #         Ok(())
//! #     }
//! # }
//!
//! let f = Stationary;
//!
//! let mut solver = SolverDriver::builder(&f)
//!     .with_initial(vec![2.0, 1.0])
//!     .with_tolerances(Tolerances::new(1e-5, 1e-5))
//!     .build();
//!
//! let result = solver.solve().expect("invalid solver setup");
//!
//! assert!(result.status().is_converged());
//! println!(
//!     "x = {:?} after {} iterations",
//!     result.x(),
//!     result.iterations()
//! );
//! ```
//!
//! The solve ends with exactly one terminal [`Status`]: convergence in the
//! residual norm, convergence in the step length, an exhausted iteration
//! budget, stagnation of the globalization or a linear solver breakdown.
//! Recoverable conditions (residual evaluation failures in trial points,
//! rejected steps, reduced-accuracy linear solves) are absorbed by the
//! process and never abort it.
//!
//! ## Scaling
//!
//! For problems whose variables or residuals differ by orders of magnitude,
//! supply per-component weights with
//! [`with_scaling`](driver::SolverBuilder::with_scaling). All norms and
//! inner products used by the solver -- the Krylov basis orthogonalization,
//! the merit function of the line search and the stopping tests -- are
//! computed in the scaled space.

pub mod algo;
pub mod convergence;
mod core;
pub mod derivatives;
pub mod driver;
pub mod gmres;
pub mod line_search;

pub use crate::core::*;
pub use algo::NewtonKrylov;
pub use convergence::{Status, Tolerances};
pub use driver::{SolveError, SolveResult, SolverDriver};

#[cfg(feature = "testing")]
pub mod testing;

#[cfg(not(feature = "testing"))]
pub(crate) mod testing;

pub use nalgebra;
