//! Core abstractions and types.
//!
//! *Users* are mainly interested in implementing the [`System`] trait,
//! optionally overriding [`System::jac_vec`](System::jac_vec) with an analytic
//! Jacobian-vector product and providing appropriate [scaling](Scaling) for
//! poorly scaled problems.
//!
//! Algorithm *developers* are interested in implementing the [`Solver`] trait
//! and using the tools in the [derivatives](crate::derivatives),
//! [gmres](crate::gmres) and [line_search](crate::line_search) modules.

mod base;
mod scaling;
mod solver;
mod system;

pub use base::*;
pub use scaling::*;
pub use solver::*;
pub use system::*;
