//! Tools for derivative-based methods.

use nalgebra::{
    storage::{Storage, StorageMut},
    ComplexField as _, Dyn, IsContiguous, RealField as _, Vector,
};
use num_traits::{One, Zero};

use crate::core::{EvalError, RealField, System};

/// Approximates the Jacobian-vector product `J(x) v` by a one-sided finite
/// difference of the residuals:
///
/// ```text
/// J(x) v ~ (F(x + sigma v) - F(x)) / sigma
/// ```
///
/// The differencing increment balances two competing needs. It should be as
/// small as possible so that the quotient is close to the directional
/// derivative, but a very small increment makes `F(x + sigma v) ~ F(x)` with
/// a very small number of good digits. The increment
///
/// ```text
/// sigma = sqrt(EPSILON) * max(|x^T v|, typ * |v|_1) / |v|_2^2
/// ```
///
/// relates the perturbation to the magnitude of `x` along `v`, with the
/// typical magnitude `typ` of the variables taking over when `x` is close to
/// zero in that direction. The approximation is first-order accurate in
/// `sigma`.
///
/// If `v` is a zero vector, the product is a zero vector and the system is
/// not evaluated at all.
///
/// The value of `rx` must contain the residuals in `x`.
pub fn jac_vec_fd<F, Sx, Sv, Srx, Sjv>(
    f: &F,
    x: &Vector<F::Field, Dyn, Sx>,
    v: &Vector<F::Field, Dyn, Sv>,
    rx: &Vector<F::Field, Dyn, Srx>,
    typ: F::Field,
    jv: &mut Vector<F::Field, Dyn, Sjv>,
) -> Result<(), EvalError>
where
    F: System,
    Sx: Storage<F::Field, Dyn> + IsContiguous,
    Sv: Storage<F::Field, Dyn> + IsContiguous,
    Srx: Storage<F::Field, Dyn>,
    Sjv: StorageMut<F::Field, Dyn>,
{
    let eps_sqrt = F::Field::EPSILON_SQRT;
    let zero = F::Field::zero();

    let norm2 = v.norm_squared();

    if norm2 == zero {
        // The directional derivative along a zero direction is zero. Treating
        // this separately avoids dividing by the zero norm below.
        jv.fill(zero);
        return Ok(());
    }

    let dot = x.dot(v).abs();
    let l1 = v.iter().fold(zero, |sum, vi| sum + vi.abs());

    let sigma = eps_sqrt * dot.max(typ * l1) / norm2;
    let sigma = if sigma == zero { eps_sqrt } else { sigma };

    // Evaluate the residuals in the perturbed point x + sigma v.
    let mut perturbed = x.clone_owned();
    perturbed.axpy(sigma, v, F::Field::one());
    f.eval(&perturbed, jv)?;

    // Form the difference quotient in place.
    for i in 0..jv.nrows() {
        jv[i] = (jv[i] - rx[i]) / sigma;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::core::Problem;
    use crate::testing::{ExtendedRosenbrock, Linear, StiffLinear};

    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector, DVector};

    #[test]
    fn matches_analytic_product_for_linear_system() {
        let f = Linear::new(dmatrix![4.0, 1.0; 2.0, 3.0], dvector![1.0, -1.0]);

        let x = dvector![0.3, -0.7];
        let v = dvector![1.0, 2.0];
        let mut rx = dvector![0.0, 0.0];
        let mut jv = dvector![0.0, 0.0];

        f.eval(&x, &mut rx).unwrap();
        jac_vec_fd(&f, &x, &v, &rx, 1.0, &mut jv).unwrap();

        // J v = A v for a linear system.
        let expected = dvector![4.0 * 1.0 + 1.0 * 2.0, 2.0 * 1.0 + 3.0 * 2.0];
        assert_abs_diff_eq!(jv, expected, epsilon = 1e-6);
    }

    #[test]
    fn matches_default_trait_method() {
        let f = Linear::new(dmatrix![4.0, 1.0; 2.0, 3.0], dvector![1.0, -1.0]);

        let x = dvector![0.3, -0.7];
        let v = dvector![-2.0, 0.5];
        let mut rx = dvector![0.0, 0.0];

        f.eval(&x, &mut rx).unwrap();

        let mut direct = dvector![0.0, 0.0];
        let mut via_trait = dvector![0.0, 0.0];

        jac_vec_fd(&f, &x, &v, &rx, 1.0, &mut direct).unwrap();
        f.jac_vec(&x, &v, &rx, 1.0, &mut via_trait).unwrap();

        assert_abs_diff_eq!(direct, via_trait);
    }

    #[test]
    fn agrees_with_analytic_override() {
        let f = StiffLinear::new();

        let x = dvector![2.0, 1.0];
        let v = dvector![0.5, -1.5];
        let mut rx = dvector![0.0, 0.0];
        let mut fd = dvector![0.0, 0.0];
        let mut analytic = dvector![0.0, 0.0];

        f.eval(&x, &mut rx).unwrap();
        jac_vec_fd(&f, &x, &v, &rx, 1.0, &mut fd).unwrap();
        f.jac_vec(&x, &v, &rx, 1.0, &mut analytic).unwrap();

        assert_abs_diff_eq!(fd, analytic, epsilon = 1e-5);
    }

    #[test]
    fn first_order_accuracy_on_rosenbrock() {
        let f = ExtendedRosenbrock::new(2);

        let x = dvector![-1.2, 1.0];
        let v = dvector![1.0, -0.5];
        let mut rx = dvector![0.0, 0.0];
        let mut jv = dvector![0.0, 0.0];

        f.eval(&x, &mut rx).unwrap();
        jac_vec_fd(&f, &x, &v, &rx, 1.0, &mut jv).unwrap();

        // J = [[-20 x1, 10], [-1, 0]] in (-1.2, 1).
        let expected = dvector![-20.0 * -1.2 * 1.0 + 10.0 * -0.5, -1.0];
        assert_abs_diff_eq!(jv, expected, epsilon = 1e-5);
    }

    #[test]
    fn zero_direction_gives_zero_product() {
        let f = ExtendedRosenbrock::new(2);

        let x = dvector![3.0, 4.0];
        let v = DVector::zeros(f.dim());
        let mut rx = dvector![0.0, 0.0];
        let mut jv = dvector![1.0, 1.0];

        f.eval(&x, &mut rx).unwrap();
        jac_vec_fd(&f, &x, &v, &rx, 1.0, &mut jv).unwrap();

        assert_eq!(jv, DVector::zeros(2));
    }
}
