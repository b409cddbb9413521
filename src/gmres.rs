//! Restarted GMRES for the Newton linear systems.
//!
//! The solver works matrix-free: the only access to the Jacobian is through
//! [`System::jac_vec`] products. The Krylov basis is built by Arnoldi
//! iteration with modified Gram-Schmidt orthogonalization in the *scaled*
//! space defined by the variable and residual weights, which is essential
//! when the magnitudes of the variables differ by orders of magnitude. The
//! least-squares residual is tracked incrementally by Givens rotations
//! applied to the upper Hessenberg matrix, so no triangular system is
//! re-solved until the iteration stops.
//!
//! # References
//!
//! \[1\] [GMRES: A Generalized Minimal Residual Algorithm for Solving
//! Nonsymmetric Linear Systems](https://epubs.siam.org/doi/10.1137/0907058)
//!
//! \[2\] [Iterative Methods for Sparse Linear
//! Systems](https://epubs.siam.org/doi/book/10.1137/1.9780898718003)

use getset::{CopyGetters, Setters};
use log::debug;
use nalgebra::{
    storage::{Storage, StorageMut},
    ComplexField as _, DimName, Dyn, IsContiguous, OMatrix, OVector, Vector, U1,
};
use num_traits::{One, Zero};
use thiserror::Error;

use crate::core::{Problem, RealField as _, Scaling, System};

/// Options for the [`Gmres`] solver.
#[derive(Debug, Clone, Copy, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct GmresOptions {
    /// Maximum dimension of the Krylov subspace built before the iteration
    /// restarts. Default: `30`.
    max_subspace: usize,
    /// Maximum number of restarts from the current best estimate when the
    /// subspace dimension limit is reached. Default: `0`.
    max_restarts: usize,
}

impl Default for GmresOptions {
    fn default() -> Self {
        Self {
            max_subspace: 30,
            max_restarts: 0,
        }
    }
}

/// Error returned from the [`Gmres`] solver.
#[derive(Debug, Error)]
pub enum GmresError {
    /// Not even the first Krylov basis vector could be built, so there is no
    /// step to return. This happens when the very first Jacobian-vector
    /// product fails or vanishes.
    #[error("no usable Krylov basis could be built")]
    NoUsableBasis,
}

/// Accuracy of the step returned by one linear solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GmresOutcome {
    /// The relative scaled residual dropped below the requested tolerance.
    Converged,
    /// The iteration stopped early (basis breakdown, a failed
    /// Jacobian-vector product mid-basis, or an exhausted iteration budget).
    /// The returned step reduces the residual but does not meet the
    /// tolerance.
    ReducedAccuracy,
}

/// Report of one linear solve.
#[derive(Debug, Clone, Copy)]
pub struct GmresSolve<T> {
    /// Accuracy of the returned step.
    pub outcome: GmresOutcome,
    /// Number of performed Arnoldi iterations.
    pub iterations: usize,
    /// Final relative scaled residual norm.
    pub residual: T,
}

/// Matrix-free GMRES solver for the Newton system `J s = -F(x)`.
///
/// All storage for the Krylov subspace (basis vectors, the Hessenberg matrix
/// and the Givens rotation state) is owned by the solver instance and reused
/// across linear solves; a solve has exclusive access to it through `&mut
/// self`.
pub struct Gmres<F: Problem> {
    options: GmresOptions,
    basis: Vec<OVector<F::Field, Dyn>>,
    hess: OMatrix<F::Field, Dyn, Dyn>,
    giv_c: Vec<F::Field>,
    giv_s: Vec<F::Field>,
    g: Vec<F::Field>,
    y: Vec<F::Field>,
    w: OVector<F::Field, Dyn>,
    u: OVector<F::Field, Dyn>,
    rt: OVector<F::Field, Dyn>,
    st: OVector<F::Field, Dyn>,
    products: usize,
}

impl<F: Problem> Gmres<F> {
    /// Initializes the solver with default options.
    pub fn new(f: &F) -> Self {
        Self::with_options(f, GmresOptions::default())
    }

    /// Initializes the solver with given options.
    pub fn with_options(f: &F, options: GmresOptions) -> Self {
        assert!(options.max_subspace > 0, "empty Krylov subspace");

        let dim = Dyn(f.dim());
        let maxl = options.max_subspace;
        let zero = F::Field::zero();

        Self {
            options,
            basis: (0..(maxl + 1))
                .map(|_| OVector::zeros_generic(dim, U1::name()))
                .collect(),
            hess: OMatrix::zeros_generic(Dyn(maxl + 1), Dyn(maxl)),
            giv_c: vec![zero; maxl],
            giv_s: vec![zero; maxl],
            g: vec![zero; maxl + 1],
            y: vec![zero; maxl],
            w: OVector::zeros_generic(dim, U1::name()),
            u: OVector::zeros_generic(dim, U1::name()),
            rt: OVector::zeros_generic(dim, U1::name()),
            st: OVector::zeros_generic(dim, U1::name()),
            products: 0,
        }
    }

    /// Returns the total number of Jacobian-vector products applied by this
    /// instance.
    pub fn products(&self) -> usize {
        self.products
    }
}

impl<F: System> Gmres<F> {
    /// Solves `J s ~ -F(x)` for the step `s`, where `rx` contains the
    /// residuals `F(x)`.
    ///
    /// The iteration stops as soon as the relative scaled residual drops
    /// below `tol`. When the subspace dimension limit is reached, the
    /// iteration restarts from the current best estimate, up to the
    /// configured number of restarts. A basis breakdown or a failed
    /// Jacobian-vector product mid-iteration stops the solve with the best
    /// available step flagged [`GmresOutcome::ReducedAccuracy`] rather than
    /// failing it. A zero right-hand side returns the zero step immediately.
    pub fn solve<Sx, Srx, Ss>(
        &mut self,
        f: &F,
        x: &Vector<F::Field, Dyn, Sx>,
        rx: &Vector<F::Field, Dyn, Srx>,
        scaling: &Scaling<F::Field>,
        tol: F::Field,
        step: &mut Vector<F::Field, Dyn, Ss>,
    ) -> Result<GmresSolve<F::Field>, GmresError>
    where
        Sx: Storage<F::Field, Dyn> + IsContiguous,
        Srx: Storage<F::Field, Dyn>,
        Ss: StorageMut<F::Field, Dyn>,
    {
        let GmresOptions {
            max_subspace,
            max_restarts,
        } = self.options;

        let zero = F::Field::zero();
        let one = F::Field::one();

        let du = scaling.x();
        let df = scaling.rx();
        let typ = scaling.typical_magnitude();
        let n = x.nrows();

        // Scaled right-hand side -Df F(x).
        for i in 0..n {
            self.rt[i] = -(df[i] * rx[i]);
        }

        let beta0 = self.rt.norm();
        self.st.fill(zero);
        step.fill(zero);

        if beta0 == zero {
            // The residual is already zero, so the zero step is the solution.
            return Ok(GmresSolve {
                outcome: GmresOutcome::Converged,
                iterations: 0,
                residual: zero,
            });
        }

        let mut total_iters = 0;
        let mut built_any = false;
        let mut converged = false;
        let mut stopped = false;
        let mut rel_res = one;

        for cycle in 0..=max_restarts {
            if cycle > 0 {
                // Recompute the scaled residual of the accumulated estimate
                // for the restart.
                for i in 0..n {
                    self.u[i] = self.st[i] / du[i];
                }

                if f.jac_vec(x, &self.u, rx, typ, &mut self.w).is_err() {
                    debug!("Jacobian-vector product failed on restart {}", cycle);
                    break;
                }

                self.products += 1;

                for i in 0..n {
                    self.rt[i] = -(df[i] * rx[i]) - df[i] * self.w[i];
                }

                debug!(
                    "restart {} with residual {}",
                    cycle,
                    self.rt.norm() / beta0
                );
            }

            let beta = self.rt.norm();
            rel_res = beta / beta0;

            if rel_res <= tol {
                converged = true;
                break;
            }

            self.basis[0].copy_from(&self.rt);
            self.basis[0] *= one / beta;

            for gi in self.g.iter_mut() {
                *gi = zero;
            }
            self.g[0] = beta;

            let mut k_used = 0;

            for k in 0..max_subspace {
                // Unscale the basis vector and apply the Jacobian, then bring
                // the product back to the scaled space.
                for i in 0..n {
                    self.u[i] = self.basis[k][i] / du[i];
                }

                if f.jac_vec(x, &self.u, rx, typ, &mut self.w).is_err() {
                    if !built_any {
                        return Err(GmresError::NoUsableBasis);
                    }

                    debug!("Jacobian-vector product failed in iteration {}", k);
                    stopped = true;
                    break;
                }

                self.products += 1;
                total_iters += 1;

                for i in 0..n {
                    self.w[i] *= df[i];
                }

                let w_norm = self.w.norm();

                if w_norm == zero {
                    // The operator annihilated the basis vector. The column
                    // carries no information, so it is not incorporated.
                    if !built_any {
                        return Err(GmresError::NoUsableBasis);
                    }

                    debug!("Jacobian-vector product vanished in iteration {}", k);
                    stopped = true;
                    break;
                }

                // Modified Gram-Schmidt against the existing basis.
                for j in 0..=k {
                    let h = self.w.dot(&self.basis[j]);
                    self.hess[(j, k)] = h;
                    self.w.axpy(-h, &self.basis[j], one);
                }

                let h_next = self.w.norm();
                self.hess[(k + 1, k)] = h_next;

                // Apply the accumulated rotations to the new column and
                // compute a new rotation zeroing its subdiagonal entry.
                for j in 0..k {
                    let hj = self.giv_c[j] * self.hess[(j, k)] + self.giv_s[j] * self.hess[(j + 1, k)];
                    self.hess[(j + 1, k)] =
                        -self.giv_s[j] * self.hess[(j, k)] + self.giv_c[j] * self.hess[(j + 1, k)];
                    self.hess[(j, k)] = hj;
                }

                let (c, s) = givens(self.hess[(k, k)], self.hess[(k + 1, k)]);
                self.giv_c[k] = c;
                self.giv_s[k] = s;
                self.hess[(k, k)] = c * self.hess[(k, k)] + s * self.hess[(k + 1, k)];
                self.hess[(k + 1, k)] = zero;

                self.g[k + 1] = -s * self.g[k];
                self.g[k] = c * self.g[k];

                k_used = k + 1;
                built_any = true;

                // The rotated right-hand side tracks the least-squares
                // residual, non-increasing within the cycle.
                rel_res = self.g[k + 1].abs() / beta0;

                if rel_res <= tol {
                    converged = true;
                    break;
                }

                if h_next <= F::Field::EPSILON * w_norm {
                    debug!("Krylov basis breakdown (subdiagonal = {})", h_next);
                    stopped = true;
                    break;
                }

                self.basis[k + 1].copy_from(&self.w);
                self.basis[k + 1] *= one / h_next;
            }

            // Solve the triangular system over the built columns and
            // accumulate the estimate.
            for i in (0..k_used).rev() {
                let mut sum = self.g[i];
                for j in (i + 1)..k_used {
                    sum -= self.hess[(i, j)] * self.y[j];
                }

                let rii = self.hess[(i, i)];
                self.y[i] = if rii == zero { zero } else { sum / rii };
            }

            for j in 0..k_used {
                self.st.axpy(self.y[j], &self.basis[j], one);
            }

            if converged || stopped {
                break;
            }
        }

        // Bring the solution back to the original variables.
        for i in 0..n {
            step[i] = self.st[i] / du[i];
        }

        let outcome = if converged {
            GmresOutcome::Converged
        } else {
            GmresOutcome::ReducedAccuracy
        };

        debug!(
            "linear solve: {:?} after {} iterations, residual = {}",
            outcome, total_iters, rel_res
        );

        Ok(GmresSolve {
            outcome,
            iterations: total_iters,
            residual: rel_res,
        })
    }
}

fn givens<T: nalgebra::RealField + Copy>(a: T, b: T) -> (T, T) {
    let zero = T::zero();
    let one = T::one();

    if b == zero {
        (one, zero)
    } else if b.abs() > a.abs() {
        let t = a / b;
        let s = one / (one + t * t).sqrt();
        (s * t, s)
    } else {
        let t = b / a;
        let c = one / (one + t * t).sqrt();
        (c, c * t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::Linear;

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector, DMatrix, DVector};

    fn newton_step(
        f: &Linear,
        x: &DVector<f64>,
        scaling: &Scaling<f64>,
        options: GmresOptions,
        tol: f64,
    ) -> (DVector<f64>, GmresSolve<f64>) {
        let mut rx = DVector::zeros(f.dim());
        f.eval(x, &mut rx).unwrap();

        let mut gmres = Gmres::with_options(f, options);
        let mut step = DVector::zeros(f.dim());
        let solve = gmres
            .solve(f, x, &rx, scaling, tol, &mut step)
            .unwrap();

        (step, solve)
    }

    #[test]
    fn computes_newton_step_for_linear_system() {
        // The Newton step of a linear system from any point is the exact
        // correction towards the root.
        let f = Linear::new(dmatrix![4.0, 1.0; 2.0, 3.0], dvector![5.0, 5.0]);
        let scaling = Scaling::uniform(2);

        let x = dvector![0.0, 0.0];
        let (step, solve) = newton_step(&f, &x, &scaling, GmresOptions::default(), 1e-12);

        assert_eq!(solve.outcome, GmresOutcome::Converged);
        assert_abs_diff_eq!(&x + step, f.root(), epsilon = 1e-8);
    }

    #[test]
    fn zero_rhs_returns_zero_step() {
        let f = Linear::new(dmatrix![2.0, 0.0; 0.0, 4.0], dvector![2.0, 4.0]);
        let scaling = Scaling::uniform(2);

        let x = f.root().clone_owned();
        let (step, solve) = newton_step(&f, &x, &scaling, GmresOptions::default(), 1e-12);

        assert_eq!(solve.outcome, GmresOutcome::Converged);
        assert_eq!(solve.iterations, 0);
        assert_eq!(step, DVector::zeros(2));
    }

    #[test]
    fn respects_scaling() {
        // Variables and residuals differing by six orders of magnitude.
        let f = Linear::new(dmatrix![1.0, 0.0; 0.0, 1e6], dvector![1.0, 1e6]);
        let scaling = Scaling::new(vec![1.0, 1.0], vec![1.0, 1e-6]);

        let x = dvector![-1.0, 3.0];
        let (step, solve) = newton_step(&f, &x, &scaling, GmresOptions::default(), 1e-10);

        assert_eq!(solve.outcome, GmresOutcome::Converged);
        assert_abs_diff_eq!(&x + step, f.root(), epsilon = 1e-4);
    }

    #[test]
    fn restarts_continue_progress() {
        let f = Linear::new(dmatrix![2.0, 1.0; 1.0, 3.0], dvector![3.0, 4.0]);
        let scaling = Scaling::uniform(2);

        let options = *GmresOptions::default()
            .set_max_subspace(1)
            .set_max_restarts(25);

        let x = dvector![0.0, 0.0];
        let (step, solve) = newton_step(&f, &x, &scaling, options, 1e-8);

        assert_eq!(solve.outcome, GmresOutcome::Converged);
        assert!(solve.iterations > 1);
        assert_abs_diff_eq!(&x + step, f.root(), epsilon = 1e-6);
    }

    #[test]
    fn residual_is_nonincreasing_in_subspace_dimension() {
        let a = DMatrix::from_row_slice(
            4,
            4,
            &[
                4.0, 1.0, 0.0, 2.0, //
                1.0, 5.0, 1.0, 0.0, //
                0.0, 1.0, 6.0, 1.0, //
                2.0, 0.0, 1.0, 7.0,
            ],
        );
        let b = dvector![1.0, 2.0, 3.0, 4.0];
        let f = Linear::new(a, b);
        let scaling = Scaling::uniform(4);
        let x = DVector::zeros(4);

        let mut last = f64::INFINITY;
        for maxl in 1..=4 {
            let options = *GmresOptions::default().set_max_subspace(maxl);
            // Unattainable tolerance forces the full subspace to be built.
            let (_, solve) = newton_step(&f, &x, &scaling, options, 1e-300);

            assert!(solve.residual <= last);
            last = solve.residual;
        }

        // The full space solves the system exactly up to rounding.
        assert!(last < 1e-10);
    }

    #[test]
    fn happy_breakdown_solves_exactly() {
        // The right-hand side spans an invariant subspace of the operator, so
        // the basis breaks down with the exact solution available.
        let f = Linear::new(dmatrix![3.0, 0.0; 0.0, 2.0], dvector![3.0, 0.0]);
        let scaling = Scaling::uniform(2);

        let x = dvector![0.0, 0.0];
        let (step, solve) = newton_step(&f, &x, &scaling, GmresOptions::default(), 1e-12);

        assert_eq!(solve.outcome, GmresOutcome::Converged);
        assert_eq!(solve.iterations, 1);
        assert_abs_diff_eq!(step, dvector![1.0, 0.0], epsilon = 1e-12);
    }

    #[test]
    fn singular_operator_yields_no_basis() {
        let f = Linear::new(DMatrix::zeros(2, 2), dvector![1.0, 1.0]);
        let scaling = Scaling::uniform(2);

        let x = dvector![0.0, 0.0];
        let mut rx = DVector::zeros(2);
        f.eval(&x, &mut rx).unwrap();

        let mut gmres = Gmres::new(&f);
        let mut step = DVector::zeros(2);
        let result = gmres.solve(&f, &x, &rx, &scaling, 1e-8, &mut step);

        assert!(matches!(result, Err(GmresError::NoUsableBasis)));
    }
}
