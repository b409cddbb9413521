//! Globalization of the Newton step.
//!
//! A step produced by the linear solver is only locally justified. The
//! globalization strategy decides how far along the step direction the next
//! iterate actually moves so that the merit function `g(lambda) = 0.5 *
//! |Df F(x + lambda s)|^2` decreases sufficiently even far from a root.
//!
//! # References
//!
//! \[1\] [Numerical Methods for Unconstrained Optimization and Nonlinear
//! Equations](https://epubs.siam.org/doi/book/10.1137/1.9781611971200)
//!
//! \[2\] [Choosing the Forcing Terms in an Inexact Newton
//! Method](https://epubs.siam.org/doi/10.1137/0917003)

use getset::{CopyGetters, Setters};
use log::debug;
use nalgebra::{
    convert,
    storage::Storage,
    ComplexField as _, DimName, Dyn, IsContiguous, OVector, RealField as _, Vector, U1,
};
use num_traits::{One, Zero};
use thiserror::Error;

use crate::core::{wrms_norm, Problem, RealField, Scaling, System};

/// Globalization strategy applied to the Newton step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Globalization {
    /// Backtracking line search enforcing sufficient decrease of the merit
    /// function. The recommended default.
    LineSearch,
    /// Always attempt the full step, shortening it only when the residuals
    /// cannot be evaluated in the trial point.
    FullStep,
}

/// Options for the [`LineSearch`] globalization.
#[derive(Debug, Clone, Copy, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct LineSearchOptions<T: RealField + Copy> {
    /// Coefficient of the sufficient-decrease condition. Default: `1e-4`.
    alpha: T,
    /// Lower bound for the contraction of the step length in one backtrack,
    /// relative to the previous length. Default: `0.1`.
    backtrack_min: T,
    /// Upper bound for the contraction of the step length in one backtrack,
    /// relative to the previous length. Default: `0.5`.
    backtrack_max: T,
}

impl<T: RealField + Copy> Default for LineSearchOptions<T> {
    fn default() -> Self {
        Self {
            alpha: convert(1e-4),
            backtrack_min: convert(0.1),
            backtrack_max: convert(0.5),
        }
    }
}

/// Error returned from the [`LineSearch`] globalization.
#[derive(Debug, Error)]
pub enum LineSearchError {
    /// The merit function does not locally decrease along the direction, so
    /// no step length can satisfy the sufficient-decrease condition.
    #[error("search direction is not a descent direction")]
    AscentDirection,
    /// No step length above the minimum satisfied the sufficient-decrease
    /// condition.
    #[error("no acceptable step length found")]
    NoAcceptableStep,
}

/// Accepted trial produced by the globalization.
#[derive(Debug, Clone, Copy)]
pub struct Accepted<T> {
    /// Accepted step length multiplier.
    pub lambda: T,
    /// Merit function value in the accepted point.
    pub merit: T,
    /// Scaled residual norm in the accepted point.
    pub fx_norm: T,
    /// Scaled length of the accepted step.
    pub step_norm: T,
}

/// Backtracking line search on the scaled merit function.
///
/// The trial point and its residuals are kept in buffers owned by this
/// instance; after a successful search the caller commits them to the solver
/// state, so a rejected trial never touches the current iterate.
pub struct LineSearch<F: Problem> {
    options: LineSearchOptions<F::Field>,
    x_trial: OVector<F::Field, Dyn>,
    rx_trial: OVector<F::Field, Dyn>,
    evals: usize,
}

impl<F: Problem> LineSearch<F> {
    /// Initializes the line search with default options.
    pub fn new(f: &F) -> Self {
        Self::with_options(f, LineSearchOptions::default())
    }

    /// Initializes the line search with given options.
    pub fn with_options(f: &F, options: LineSearchOptions<F::Field>) -> Self {
        let dim = Dyn(f.dim());

        Self {
            options,
            x_trial: OVector::zeros_generic(dim, U1::name()),
            rx_trial: OVector::zeros_generic(dim, U1::name()),
            evals: 0,
        }
    }

    /// Returns the accepted trial point.
    pub fn x_trial(&self) -> &OVector<F::Field, Dyn> {
        &self.x_trial
    }

    /// Returns the residuals in the accepted trial point.
    pub fn rx_trial(&self) -> &OVector<F::Field, Dyn> {
        &self.rx_trial
    }

    /// Returns the total number of residual evaluations performed by this
    /// instance.
    pub fn evals(&self) -> usize {
        self.evals
    }
}

impl<F: System> LineSearch<F> {
    /// Searches for a step length satisfying the sufficient-decrease
    /// condition
    ///
    /// ```text
    /// g(lambda) <= g(0) + alpha * lambda * g'(0)
    /// ```
    ///
    /// starting from the full step `lambda = 1` and backtracking by
    /// quadratic, then cubic interpolation of the sampled merit values. The
    /// value of `merit` must be the merit function value `g(0)` in `x` and
    /// `slope` its directional derivative `g'(0)` along `p`.
    ///
    /// The search fails when no length above the minimum (determined by
    /// `step_tol` relative to the step size) suffices; the failure leaves
    /// the current iterate untouched and is recoverable by the caller.
    pub fn search<Sx, Sp>(
        &mut self,
        f: &F,
        scaling: &Scaling<F::Field>,
        x: &Vector<F::Field, Dyn, Sx>,
        p: &Vector<F::Field, Dyn, Sp>,
        merit: F::Field,
        slope: F::Field,
        step_tol: F::Field,
    ) -> Result<Accepted<F::Field>, LineSearchError>
    where
        Sx: Storage<F::Field, Dyn> + IsContiguous,
        Sp: Storage<F::Field, Dyn> + IsContiguous,
    {
        let LineSearchOptions {
            alpha,
            backtrack_min,
            backtrack_max,
        } = self.options;

        let zero = F::Field::zero();
        let one = F::Field::one();
        let two: F::Field = convert(2.0);
        let three: F::Field = convert(3.0);
        let half: F::Field = convert(0.5);

        if slope >= zero {
            debug!("rejecting direction with slope {}", slope);
            return Err(LineSearchError::AscentDirection);
        }

        let lambda_min = min_lambda(scaling, x, p, step_tol);

        let mut lambda = one;
        let mut prev: Option<(F::Field, F::Field)> = None;

        loop {
            self.x_trial.copy_from(x);
            self.x_trial.axpy(lambda, p, one);

            self.evals += 1;

            let g_new = match f.eval(&self.x_trial, &mut self.rx_trial) {
                Ok(()) => {
                    let fx_norm = wrms_norm(&self.rx_trial, scaling.rx());
                    half * fx_norm * fx_norm
                }
                Err(_) => {
                    // The trial point is invalid for the system. Recover by
                    // shortening the step.
                    debug!("residual evaluation failed for lambda = {}", lambda);

                    if lambda <= lambda_min {
                        return Err(LineSearchError::NoAcceptableStep);
                    }

                    lambda *= half;
                    lambda = lambda.max(lambda_min);
                    prev = None;
                    continue;
                }
            };

            if g_new.is_finite() && g_new <= merit + alpha * lambda * slope {
                let fx_norm = (two * g_new).sqrt();
                let step_norm = lambda * wrms_norm(p, scaling.x());

                debug!(
                    "accept lambda = {}, || rx || = {}, backtracks = {}",
                    lambda,
                    fx_norm,
                    if prev.is_some() { "yes" } else { "no" }
                );

                return Ok(Accepted {
                    lambda,
                    merit: g_new,
                    fx_norm,
                    step_norm,
                });
            }

            if lambda <= lambda_min {
                debug!("no sufficient decrease above lambda = {}", lambda_min);
                return Err(LineSearchError::NoAcceptableStep);
            }

            let lambda_next = if !g_new.is_finite() {
                // An overflowing merit value carries no shape information
                // for the interpolation.
                lambda * half
            } else {
                match prev {
                    None => {
                        // Minimizer of the quadratic model through g(0),
                        // g'(0) and g(lambda).
                        -slope * lambda * lambda / (two * (g_new - merit - slope * lambda))
                    }
                    Some((lambda_prev, g_prev)) => {
                        // Minimizer of the cubic model through g(0), g'(0)
                        // and the last two samples.
                        let t1 = g_new - merit - slope * lambda;
                        let t2 = g_prev - merit - slope * lambda_prev;

                        let l2 = lambda * lambda;
                        let lp2 = lambda_prev * lambda_prev;
                        let denom = lambda - lambda_prev;

                        let a = (t1 / l2 - t2 / lp2) / denom;
                        let b = (-lambda_prev * t1 / l2 + lambda * t2 / lp2) / denom;

                        if a == zero {
                            -slope / (two * b)
                        } else {
                            let disc = (b * b - three * a * slope).max(zero);
                            (-b + disc.sqrt()) / (three * a)
                        }
                    }
                }
            };

            let lambda_next = if lambda_next.is_finite() {
                lambda_next
                    .max(backtrack_min * lambda)
                    .min(backtrack_max * lambda)
            } else {
                backtrack_max * lambda
            };

            if g_new.is_finite() {
                prev = Some((lambda, g_new));
            }

            lambda = lambda_next.max(lambda_min);
        }
    }

    /// Attempts the full step, shortening it only when the residuals cannot
    /// be evaluated in the trial point.
    pub fn full_step<Sx, Sp>(
        &mut self,
        f: &F,
        scaling: &Scaling<F::Field>,
        x: &Vector<F::Field, Dyn, Sx>,
        p: &Vector<F::Field, Dyn, Sp>,
        step_tol: F::Field,
    ) -> Result<Accepted<F::Field>, LineSearchError>
    where
        Sx: Storage<F::Field, Dyn> + IsContiguous,
        Sp: Storage<F::Field, Dyn> + IsContiguous,
    {
        let one = F::Field::one();
        let half: F::Field = convert(0.5);

        let lambda_min = min_lambda(scaling, x, p, step_tol);
        let mut lambda = one;

        loop {
            self.x_trial.copy_from(x);
            self.x_trial.axpy(lambda, p, one);

            self.evals += 1;

            match f.eval(&self.x_trial, &mut self.rx_trial) {
                Ok(()) => {
                    let fx_norm = wrms_norm(&self.rx_trial, scaling.rx());

                    if !fx_norm.is_finite() {
                        debug!("non-finite residuals for lambda = {}", lambda);
                    } else {
                        let step_norm = lambda * wrms_norm(p, scaling.x());

                        return Ok(Accepted {
                            lambda,
                            merit: half * fx_norm * fx_norm,
                            fx_norm,
                            step_norm,
                        });
                    }
                }
                Err(_) => {
                    debug!("residual evaluation failed for lambda = {}", lambda);
                }
            }

            if lambda <= lambda_min {
                return Err(LineSearchError::NoAcceptableStep);
            }

            lambda = (lambda * half).max(lambda_min);
        }
    }
}

// Minimum meaningful step length multiplier: any shorter step would change
// the iterate by less than the step tolerance.
fn min_lambda<T, Sx, Sp>(
    scaling: &Scaling<T>,
    x: &Vector<T, Dyn, Sx>,
    p: &Vector<T, Dyn, Sp>,
    step_tol: T,
) -> T
where
    T: RealField + Copy,
    Sx: Storage<T, Dyn>,
    Sp: Storage<T, Dyn>,
{
    let zero = T::zero();
    let one = T::one();
    let du = scaling.x();

    let rellength = (0..x.nrows()).fold(zero, |max, i| {
        let rel = p[i].abs() / (x[i].abs() + one / du[i]);
        rel.max(max)
    });

    if rellength > zero {
        step_tol / rellength
    } else {
        one
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{Guarded, Linear};

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector, DVector};

    fn merit_and_residuals(f: &Linear, x: &DVector<f64>, scaling: &Scaling<f64>) -> (f64, DVector<f64>) {
        let mut rx = DVector::zeros(x.nrows());
        f.eval(x, &mut rx).unwrap();
        let fx_norm = wrms_norm(&rx, scaling.rx());
        (0.5 * fx_norm * fx_norm, rx)
    }

    #[test]
    fn accepts_full_newton_step() {
        let f = Linear::new(dmatrix![2.0, 1.0; 1.0, 3.0], dvector![3.0, 4.0]);
        let scaling = Scaling::uniform(2);

        let x = dvector![0.0, 0.0];
        let (merit, _) = merit_and_residuals(&f, &x, &scaling);

        // Exact Newton direction and its slope in the scaled metric.
        let p = f.root() - &x;
        let slope = -2.0 * merit;

        let mut search = LineSearch::new(&f);
        let accepted = search
            .search(&f, &scaling, &x, &p, merit, slope, 1e-8)
            .unwrap();

        assert_abs_diff_eq!(accepted.lambda, 1.0);
        assert!(accepted.merit <= merit + 1e-4 * accepted.lambda * slope);
    }

    #[test]
    fn backtracks_overlong_step_within_armijo_bound() {
        let f = Linear::new(dmatrix![2.0, 1.0; 1.0, 3.0], dvector![3.0, 4.0]);
        let scaling = Scaling::uniform(2);

        let x = dvector![0.0, 0.0];
        let (merit, _) = merit_and_residuals(&f, &x, &scaling);

        // Three times the Newton step overshoots the root.
        let p = (f.root() - &x) * 3.0;
        let slope = -6.0 * merit;

        let mut search = LineSearch::new(&f);
        let accepted = search
            .search(&f, &scaling, &x, &p, merit, slope, 1e-8)
            .unwrap();

        // The quadratic model of a linear system is exact, so the first
        // interpolation lands in the minimizer.
        assert_abs_diff_eq!(accepted.lambda, 1.0 / 3.0, epsilon = 1e-6);
        assert!(accepted.merit <= merit + 1e-4 * accepted.lambda * slope);
    }

    #[test]
    fn rejects_ascent_direction() {
        let f = Linear::new(dmatrix![2.0, 1.0; 1.0, 3.0], dvector![3.0, 4.0]);
        let scaling = Scaling::uniform(2);

        let x = dvector![0.0, 0.0];
        let (merit, _) = merit_and_residuals(&f, &x, &scaling);

        let p = f.root() - &x;

        let mut search = LineSearch::new(&f);
        let result = search.search(&f, &scaling, &x, &p, merit, 2.0 * merit, 1e-8);

        assert!(matches!(result, Err(LineSearchError::AscentDirection)));
    }

    #[test]
    fn fails_when_no_length_decreases_merit() {
        let f = Linear::new(dmatrix![2.0, 1.0; 1.0, 3.0], dvector![3.0, 4.0]);
        let scaling = Scaling::uniform(2);

        let x = dvector![0.0, 0.0];
        let (merit, _) = merit_and_residuals(&f, &x, &scaling);

        // A direction away from the root with an (incorrectly) negative
        // slope estimate. No length can satisfy the condition.
        let p = (&x - f.root()) * 1.0;
        let slope = -1e-8;

        let mut search = LineSearch::new(&f);
        let result = search.search(&f, &scaling, &x, &p, merit, slope, 1e-6);

        assert!(matches!(result, Err(LineSearchError::NoAcceptableStep)));
    }

    #[test]
    fn shortens_step_out_of_invalid_region() {
        let inner = Linear::new(dmatrix![2.0, 1.0; 1.0, 3.0], dvector![3.0, 4.0]);
        let root = inner.root();
        // Residuals cannot be evaluated too far from the origin.
        let f = Guarded::new(inner, 1.8);
        let scaling = Scaling::uniform(2);

        let x = dvector![0.0, 0.0];
        let mut rx = DVector::zeros(2);
        f.eval(&x, &mut rx).unwrap();
        let fx_norm = wrms_norm(&rx, scaling.rx());
        let merit = 0.5 * fx_norm * fx_norm;

        // Twice the Newton step leaves the valid region.
        let p = (root - &x) * 2.0;
        let slope = -4.0 * merit;

        let mut search = LineSearch::new(&f);
        let accepted = search
            .search(&f, &scaling, &x, &p, merit, slope, 1e-8)
            .unwrap();

        assert!(accepted.lambda < 1.0);
        assert!(accepted.merit <= merit + 1e-4 * accepted.lambda * slope);
    }

    #[test]
    fn full_step_accepts_any_evaluable_point() {
        let f = Linear::new(dmatrix![2.0, 1.0; 1.0, 3.0], dvector![3.0, 4.0]);
        let scaling = Scaling::uniform(2);

        let x = dvector![0.0, 0.0];
        // A direction that increases the merit function is accepted too.
        let p = (&x - f.root()) * 1.0;

        let mut search = LineSearch::new(&f);
        let accepted = search.full_step(&f, &scaling, &x, &p, 1e-8).unwrap();

        assert_abs_diff_eq!(accepted.lambda, 1.0);
    }
}
