//! The collection of implemented algorithms.

pub mod newton_krylov;

pub use newton_krylov::NewtonKrylov;
