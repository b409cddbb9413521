//! Testing systems and utilities useful for benchmarking, debugging and smoke
//! testing.
//!
//! [`Linear`] and [`StiffLinear`] are recommended for first tests. Others can
//! be used for specific conditions (e.g., repeated globalization failures or
//! invalid regions).
//!
//! # References
//!
//! \[1\] [Numerical Methods for Unconstrained Optimization and Nonlinear
//! Equations](https://epubs.siam.org/doi/book/10.1137/1.9781611971200)
//!
//! \[2\] [Testing Unconstrained Optimization
//! Software](https://dl.acm.org/doi/10.1145/355934.355936)

#![allow(unused)]

use nalgebra::{
    storage::{Storage, StorageMut},
    DMatrix, DVector, Dyn, IsContiguous, Vector,
};

use crate::core::{EvalError, Problem, System};

/// General linear system `F(x) = A x - b`.
///
/// The Jacobian is the matrix itself, which makes the system convenient for
/// exercising the finite-difference Jacobian-vector products (the difference
/// quotient of a linear map is exact up to rounding).
#[derive(Debug)]
pub struct Linear {
    a: DMatrix<f64>,
    b: DVector<f64>,
}

impl Linear {
    /// Initializes the system with given matrix and right-hand side.
    pub fn new(a: DMatrix<f64>, b: DVector<f64>) -> Self {
        assert!(a.is_square(), "matrix is not square");
        assert!(a.nrows() == b.nrows(), "mismatched right-hand side");

        Self { a, b }
    }

    /// Returns the unique root `A^-1 b` of the system.
    ///
    /// # Panics
    ///
    /// Panics if the matrix is singular.
    pub fn root(&self) -> DVector<f64> {
        self.a
            .clone()
            .lu()
            .solve(&self.b)
            .expect("singular matrix")
    }
}

impl Problem for Linear {
    type Field = f64;

    fn dim(&self) -> usize {
        self.b.nrows()
    }
}

impl System for Linear {
    fn eval<Sx, Srx>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        rx: &mut Vector<Self::Field, Dyn, Srx>,
    ) -> Result<(), EvalError>
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Srx: StorageMut<Self::Field, Dyn>,
    {
        for i in 0..self.a.nrows() {
            let mut sum = -self.b[i];
            for j in 0..self.a.ncols() {
                sum += self.a[(i, j)] * x[j];
            }
            rx[i] = sum;
        }

        Ok(())
    }
}

/// Linear system whose matrix has widely separated eigenvalues (-1 and
/// -100), a two-dimensional stationarity problem of a stiff ODE:
///
/// ```text
/// r1 = -101 x1 - 100 x2
/// r2 = x1
/// ```
///
/// The unique root is the origin. The system overrides
/// [`System::jac_vec`] with the analytic product, so it also exercises the
/// analytic path of solvers.
#[derive(Debug, Clone, Copy)]
pub struct StiffLinear;

impl StiffLinear {
    /// Initializes the system.
    pub fn new() -> Self {
        Self
    }
}

impl Default for StiffLinear {
    fn default() -> Self {
        Self::new()
    }
}

impl Problem for StiffLinear {
    type Field = f64;

    fn dim(&self) -> usize {
        2
    }
}

impl System for StiffLinear {
    fn eval<Sx, Srx>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        rx: &mut Vector<Self::Field, Dyn, Srx>,
    ) -> Result<(), EvalError>
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Srx: StorageMut<Self::Field, Dyn>,
    {
        rx[0] = -101.0 * x[0] - 100.0 * x[1];
        rx[1] = x[0];

        Ok(())
    }

    fn jac_vec<Sx, Sv, Srx, Sjv>(
        &self,
        _x: &Vector<Self::Field, Dyn, Sx>,
        v: &Vector<Self::Field, Dyn, Sv>,
        _rx: &Vector<Self::Field, Dyn, Srx>,
        _typ: Self::Field,
        jv: &mut Vector<Self::Field, Dyn, Sjv>,
    ) -> Result<(), EvalError>
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Sv: Storage<Self::Field, Dyn> + IsContiguous,
        Srx: Storage<Self::Field, Dyn>,
        Sjv: StorageMut<Self::Field, Dyn>,
    {
        jv[0] = -101.0 * v[0] - 100.0 * v[1];
        jv[1] = v[0];

        Ok(())
    }
}

/// [Extended Rosenbrock
/// function](https://en.wikipedia.org/wiki/Rosenbrock_function) \[1\]
/// formulated as a system of equations.
///
/// The root lies inside a long, narrow, parabolic shaped flat valley. The
/// challenge is to follow the valley without the merit function stalling the
/// progress.
#[derive(Debug, Clone, Copy)]
pub struct ExtendedRosenbrock {
    n: usize,
    alpha: f64,
}

impl ExtendedRosenbrock {
    /// Initializes the system with given dimension.
    ///
    /// The dimension **must** be a multiple of 2.
    pub fn new(n: usize) -> Self {
        Self::with_scaling(n, 1.0)
    }

    /// Initializes the system with given dimension and scaling factor.
    ///
    /// The dimension **must** be a multiple of 2. The higher the scaling
    /// factor is, the more difficult the system is.
    pub fn with_scaling(n: usize, alpha: f64) -> Self {
        assert!(n > 0, "n must be greater than zero");
        assert!(n % 2 == 0, "n must be a multiple of 2");
        assert!(alpha > 0.0, "alpha must be greater than zero");
        Self { n, alpha }
    }
}

impl Problem for ExtendedRosenbrock {
    type Field = f64;

    fn dim(&self) -> usize {
        self.n
    }
}

impl System for ExtendedRosenbrock {
    fn eval<Sx, Srx>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        rx: &mut Vector<Self::Field, Dyn, Srx>,
    ) -> Result<(), EvalError>
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Srx: StorageMut<Self::Field, Dyn>,
    {
        for i in 0..(self.n / 2) {
            let i1 = 2 * i;
            let i2 = 2 * i + 1;

            let x1 = x[i1] * self.alpha;
            let x2 = x[i2] / self.alpha;

            rx[i1] = 10.0 * (x2 - x1 * x1);
            rx[i2] = 1.0 - x1;
        }

        Ok(())
    }
}

/// One-dimensional system `F(x) = x^2 + 1` that has no root.
///
/// The merit function attains its positive minimum in the origin, where the
/// Jacobian is singular. Solvers are expected to stagnate there instead of
/// looping forever.
#[derive(Debug, Clone, Copy)]
pub struct NoSolution;

impl Problem for NoSolution {
    type Field = f64;

    fn dim(&self) -> usize {
        1
    }
}

impl System for NoSolution {
    fn eval<Sx, Srx>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        rx: &mut Vector<Self::Field, Dyn, Srx>,
    ) -> Result<(), EvalError>
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Srx: StorageMut<Self::Field, Dyn>,
    {
        rx[0] = x[0] * x[0] + 1.0;

        Ok(())
    }
}

/// Wrapper that makes the residuals of the inner system impossible to
/// evaluate outside a box around the origin.
///
/// Useful for exercising the recovery from evaluation failures: a trial
/// point with any `|x_i|` greater than the bound fails with
/// [`EvalError::InvalidPoint`].
#[derive(Debug)]
pub struct Guarded<F> {
    f: F,
    bound: f64,
}

impl<F> Guarded<F> {
    /// Wraps the system with given bound.
    pub fn new(f: F, bound: f64) -> Self {
        Self { f, bound }
    }
}

impl<F: Problem<Field = f64>> Problem for Guarded<F> {
    type Field = f64;

    fn dim(&self) -> usize {
        self.f.dim()
    }
}

impl<F: System<Field = f64>> System for Guarded<F> {
    fn eval<Sx, Srx>(
        &self,
        x: &Vector<Self::Field, Dyn, Sx>,
        rx: &mut Vector<Self::Field, Dyn, Srx>,
    ) -> Result<(), EvalError>
    where
        Sx: Storage<Self::Field, Dyn> + IsContiguous,
        Srx: StorageMut<Self::Field, Dyn>,
    {
        if x.iter().any(|xi| xi.abs() > self.bound) {
            return Err(EvalError::InvalidPoint);
        }

        self.f.eval(x, rx)
    }
}
