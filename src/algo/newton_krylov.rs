//! Globalized, Jacobian-free Newton-Krylov method.
//!
//! Each outer iteration linearizes the system in the current iterate and
//! solves the Newton system `J s = -F(x)` approximately with the matrix-free
//! [GMRES](crate::gmres) solver, using only Jacobian-vector products. The
//! accuracy of the linear solve is controlled by a forcing term that
//! tightens as the outer iteration approaches a root, so no effort is wasted
//! on solving linear systems precisely while far away. The computed step is
//! then passed to the [globalization](crate::line_search) strategy which
//! guarantees sufficient decrease of the residual merit function.
//!
//! # References
//!
//! \[1\] [Jacobian-free Newton-Krylov methods: a survey of approaches and
//! applications](https://www.sciencedirect.com/science/article/pii/S0021999103004340)
//!
//! \[2\] [Choosing the Forcing Terms in an Inexact Newton
//! Method](https://epubs.siam.org/doi/10.1137/0917003)
//!
//! \[3\] [Numerical Methods for Unconstrained Optimization and Nonlinear
//! Equations](https://epubs.siam.org/doi/book/10.1137/1.9781611971200)

use getset::{CopyGetters, Setters};
use log::debug;
use nalgebra::{
    convert,
    storage::StorageMut,
    DimName, Dyn, IsContiguous, OVector, RealField as _, Vector, U1,
};
use num_traits::{One, Zero};
use thiserror::Error;

use crate::{
    convergence::Tolerances,
    core::{wrms_norm, Problem, Scaling, Solver, Step, System},
    gmres::{Gmres, GmresError, GmresOptions},
    line_search::{Globalization, LineSearch, LineSearchError, LineSearchOptions},
};

/// Specification for the maximum allowed scaled step length.
#[derive(Debug, Clone, Copy)]
pub enum MaxStep<S> {
    /// Fixed value.
    Fixed(S),
    /// Estimated from the initial iterate as `1000 * max(|Du x0|, 1)`.
    Estimated,
}

/// Options for the [`NewtonKrylov`] solver.
#[derive(Debug, Clone, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct NewtonKrylovOptions<P: Problem> {
    /// Tolerances of the stopping tests. Default: see [`Tolerances`].
    tolerances: Tolerances<P::Field>,
    /// Forcing term (relative tolerance of the linear solve) used in the
    /// first iteration. Default: `0.9`.
    eta_init: P::Field,
    /// Upper bound for the forcing term. Default: `0.9`.
    eta_max: P::Field,
    /// Coefficient of the forcing term update. Default: `0.9`.
    eta_gamma: P::Field,
    /// Maximum allowed scaled step length. Default: estimated (see
    /// [`MaxStep`]).
    max_step: MaxStep<P::Field>,
    /// Globalization strategy for the computed steps. Default: line search.
    globalization: Globalization,
    /// Options of the inner linear solver.
    gmres: GmresOptions,
    /// Options of the line search.
    line_search: LineSearchOptions<P::Field>,
}

impl<P: Problem> Default for NewtonKrylovOptions<P> {
    fn default() -> Self {
        Self {
            tolerances: Tolerances::default(),
            eta_init: convert(0.9),
            eta_max: convert(0.9),
            eta_gamma: convert(0.9),
            max_step: MaxStep::Estimated,
            globalization: Globalization::LineSearch,
            gmres: GmresOptions::default(),
            line_search: LineSearchOptions::default(),
        }
    }
}

/// Error returned from [`NewtonKrylov`] solver.
///
/// Both variants are recoverable per iteration: the driver counts
/// consecutive globalization failures and gives up only after a configured
/// threshold, while a linear solver breakdown terminates the solve with a
/// dedicated status.
#[derive(Debug, Error)]
pub enum NewtonKrylovError {
    /// The globalization strategy could not find an acceptable step.
    #[error("globalization failed: {0}")]
    Globalization(#[from] LineSearchError),
    /// The linear solver could not produce any usable step.
    #[error("{0}")]
    LinearSolve(#[from] GmresError),
    /// The residuals could not be evaluated in the initial point.
    #[error("{0}")]
    Residual(#[from] crate::core::EvalError),
}

/// Jacobian-free Newton-Krylov solver.
///
/// See [module](self) documentation for more details.
pub struct NewtonKrylov<P: Problem> {
    options: NewtonKrylovOptions<P>,
    gmres: Gmres<P>,
    line_search: LineSearch<P>,
    p: OVector<P::Field, Dyn>,
    jv: OVector<P::Field, Dyn>,
    eta: P::Field,
    fx_norm_prev: P::Field,
    max_step: P::Field,
    iter: usize,
    slope_products: usize,
}

impl<P: Problem> NewtonKrylov<P> {
    /// Initializes the solver with default options.
    pub fn new(p: &P) -> Self {
        Self::with_options(p, NewtonKrylovOptions::default())
    }

    /// Initializes the solver with given options.
    pub fn with_options(f: &P, options: NewtonKrylovOptions<P>) -> Self {
        let dim = Dyn(f.dim());
        let max_step = match options.max_step {
            MaxStep::Fixed(fixed) => fixed,
            // Zero is recognized in `solve_next` and estimated there.
            MaxStep::Estimated => convert(0.0),
        };

        Self {
            gmres: Gmres::with_options(f, options.gmres),
            line_search: LineSearch::with_options(f, options.line_search),
            options,
            p: OVector::zeros_generic(dim, U1::name()),
            jv: OVector::zeros_generic(dim, U1::name()),
            eta: convert(0.0),
            fx_norm_prev: convert(0.0),
            max_step,
            iter: 0,
            slope_products: 0,
        }
    }

    /// Gets the options of the solver.
    pub fn options(&self) -> &NewtonKrylovOptions<P> {
        &self.options
    }

    /// Sets the tolerances of the stopping tests.
    ///
    /// Unlike the rest of the options, the tolerances do not influence any
    /// internal storage, so they can be changed on an existing solver.
    pub fn set_tolerances(&mut self, tolerances: Tolerances<P::Field>) -> &mut Self {
        self.options.set_tolerances(tolerances);
        self
    }

    /// Resets the internal state of the solver.
    pub fn reset(&mut self) {
        self.max_step = match self.options.max_step {
            MaxStep::Fixed(fixed) => fixed,
            MaxStep::Estimated => convert(0.0),
        };
        self.eta = convert(0.0);
        self.fx_norm_prev = convert(0.0);
        self.iter = 0;
    }

    /// Returns the number of residual evaluations performed by this instance
    /// when examining trial steps.
    ///
    /// Jacobian-vector products are counted separately (see
    /// [`jac_products`](NewtonKrylov::jac_products)).
    pub fn residual_evals(&self) -> usize {
        self.line_search.evals()
    }

    /// Returns the number of Jacobian-vector products applied by this
    /// instance. With the default finite-difference product, each product
    /// costs one additional residual evaluation.
    pub fn jac_products(&self) -> usize {
        self.gmres.products() + self.slope_products
    }
}

impl<F: System> Solver<F> for NewtonKrylov<F> {
    const NAME: &'static str = "Newton-Krylov";

    type Error = NewtonKrylovError;

    fn solve_next<Sx, Srx>(
        &mut self,
        f: &F,
        scaling: &Scaling<F::Field>,
        x: &mut Vector<F::Field, Dyn, Sx>,
        rx: &mut Vector<F::Field, Dyn, Srx>,
    ) -> Result<Step<F::Field>, Self::Error>
    where
        Sx: StorageMut<F::Field, Dyn> + IsContiguous,
        Srx: StorageMut<F::Field, Dyn>,
    {
        let NewtonKrylovOptions {
            tolerances,
            eta_init,
            eta_max,
            eta_gamma,
            globalization,
            ..
        } = self.options;

        let zero = F::Field::zero();
        let one = F::Field::one();
        let two: F::Field = convert(2.0);
        let half: F::Field = convert(0.5);

        let n = x.nrows();
        let du = scaling.x();
        let df = scaling.rx();
        let typ = scaling.typical_magnitude();

        let fx_norm = wrms_norm(rx, df);

        // Forcing term of the inexact Newton iteration. The linear solve is
        // loose far from a root and tightens with the observed quadratic
        // decrease of the residual norm.
        self.eta = if self.iter == 0 {
            eta_init
        } else {
            let ratio = fx_norm / self.fx_norm_prev;
            (eta_gamma * ratio * ratio).min(eta_max)
        };

        if self.max_step == zero {
            // Zero signifies that the maximum step length is to be estimated
            // from the initial iterate and it has not been done yet.
            let x_norm = wrms_norm(x, du);
            let factor: F::Field = convert(1000.0);
            self.max_step = factor * x_norm.max(one);
        }

        debug!(
            "iteration {}: || rx || = {}, eta = {}",
            self.iter, fx_norm, self.eta
        );

        // Compute the Newton direction p from J p ~ -rx.
        let linear = self
            .gmres
            .solve(f, x, rx, scaling, self.eta, &mut self.p)?;

        debug!(
            "step from {} linear iterations ({:?})",
            linear.iterations, linear.outcome
        );

        // Shorten overlong steps before globalization.
        let p_norm = wrms_norm(&self.p, du);
        if p_norm > self.max_step {
            debug!("shorten step from {} to {}", p_norm, self.max_step);
            self.p *= self.max_step / p_norm;
        }

        let merit = half * fx_norm * fx_norm;

        let accepted = match globalization {
            Globalization::LineSearch => {
                // Directional derivative of the merit function along p,
                // computed from one more Jacobian-vector product as
                // (Df rx)^T (Df J p). If the product fails, the exact-Newton
                // value is a usable estimate.
                let slope = match f.jac_vec(x, &self.p, rx, typ, &mut self.jv) {
                    Ok(()) => {
                        self.slope_products += 1;

                        let sum = (0..n).fold(zero, |sum, i| {
                            sum + (df[i] * rx[i]) * (df[i] * self.jv[i])
                        });
                        sum / convert(n as f64)
                    }
                    Err(_) => {
                        debug!("slope product failed, assuming the exact Newton value");
                        -two * merit
                    }
                };

                self.line_search.search(
                    f,
                    scaling,
                    x,
                    &self.p,
                    merit,
                    slope,
                    tolerances.step(),
                )?
            }
            Globalization::FullStep => {
                self.line_search
                    .full_step(f, scaling, x, &self.p, tolerances.step())?
            }
        };

        // Commit the accepted iterate. A rejected trial returns above and
        // leaves both x and rx untouched.
        x.copy_from(self.line_search.x_trial());
        rx.copy_from(self.line_search.rx_trial());

        self.fx_norm_prev = fx_norm;
        self.iter += 1;

        debug!(
            "accepted lambda = {}, || rx || = {}",
            accepted.lambda, accepted.fx_norm
        );

        Ok(Step {
            lambda: accepted.lambda,
            step_norm: accepted.step_norm,
            fx_norm: accepted.fx_norm,
        })
    }
}
