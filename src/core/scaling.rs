//! Scaling of variables and residuals.

use na::DimName;
use nalgebra as na;
use nalgebra::{storage::Storage, Dyn, OVector, Vector};

use crate::core::RealField;

/// Per-component scaling weights for the variables and the residuals of a
/// problem.
///
/// The variable weights are chosen such that multiplying a variable by its
/// weight brings it to a magnitude around one, and similarly for the residual
/// weights. Appropriate scaling is essential for problems whose variables or
/// equations differ by orders of magnitude, because all norms and inner
/// products used by the solvers are computed in the scaled space.
///
/// Scaling is supplied once per solve and is immutable afterwards. All
/// weights must be strictly positive; this is validated before any iteration
/// begins.
#[derive(Debug, Clone)]
pub struct Scaling<T: RealField + Copy> {
    x: OVector<T, Dyn>,
    rx: OVector<T, Dyn>,
}

impl<T: RealField + Copy> Scaling<T> {
    /// Creates the scaling from weights for the variables (`x`) and the
    /// residuals (`rx`).
    pub fn new(x: Vec<T>, rx: Vec<T>) -> Self {
        assert!(x.len() == rx.len(), "x and rx weights have different size");
        assert!(!x.is_empty(), "empty scaling");

        let dim = na::Dyn(x.len());
        let x = OVector::from_vec_generic(dim, na::U1::name(), x);
        let rx = OVector::from_vec_generic(dim, na::U1::name(), rx);

        Self { x, rx }
    }

    /// Creates the scaling with all weights equal to one.
    pub fn uniform(dim: usize) -> Self {
        assert!(dim > 0, "empty scaling");

        let one = T::from_subset(&1.0);
        let n = na::Dyn(dim);

        Self {
            x: OVector::from_element_generic(n, na::U1::name(), one),
            rx: OVector::from_element_generic(n, na::U1::name(), one),
        }
    }

    /// Gets the dimension of the scaling vectors.
    pub fn dim(&self) -> usize {
        self.x.nrows()
    }

    /// Gets the weights of the variables.
    pub fn x(&self) -> &OVector<T, Dyn> {
        &self.x
    }

    /// Gets the weights of the residuals.
    pub fn rx(&self) -> &OVector<T, Dyn> {
        &self.rx
    }

    /// Determines whether all weights are strictly positive.
    pub fn is_valid(&self) -> bool {
        let zero = T::from_subset(&0.0);
        self.x.iter().chain(self.rx.iter()).all(|w| *w > zero)
    }

    /// Returns the typical magnitude of the variables, i.e., the largest
    /// inverse variable weight.
    pub fn typical_magnitude(&self) -> T {
        let one = T::from_subset(&1.0);
        self.x
            .iter()
            .fold(T::from_subset(&0.0), |typ, w| (one / *w).max(typ))
    }
}

/// Computes the weighted root-mean-square norm `sqrt(sum((v_i * w_i)^2) / n)`.
///
/// This is the norm used for all caller-visible quantities: stopping tests,
/// step lengths and merit values.
pub fn wrms_norm<T, D, Sv, Sw>(v: &Vector<T, D, Sv>, w: &Vector<T, D, Sw>) -> T
where
    T: RealField + Copy,
    D: na::Dim,
    Sv: Storage<T, D>,
    Sw: Storage<T, D>,
{
    let sum = v
        .iter()
        .zip(w.iter())
        .fold(T::from_subset(&0.0), |sum, (vi, wi)| {
            let vw = *vi * *wi;
            sum + vw * vw
        });

    (sum / T::from_subset(&(v.nrows() as f64))).sqrt()
}
