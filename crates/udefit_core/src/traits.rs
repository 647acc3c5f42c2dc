use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in our dynamics.
/// Implemented by `f64` for plain evaluation and by `Dual` for sensitivities.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Converts an `f64` constant into the scalar type.
///
/// Conversion from `f64` never fails for `f64` or `Dual`; other scalar types
/// that cannot represent the value produce NaN, which the integrator rejects.
#[inline]
pub fn constant<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// A vector field `dx/dt = f(t, x, p)` whose right-hand side depends on a
/// parameter vector supplied at every evaluation.
///
/// Implementations must be pure: identical `(t, x, p)` must produce
/// identical output, since the integrator evaluates the field at adaptively
/// chosen times and repeats evaluations for error estimation.
pub trait ParametricSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Number of entries the parameter vector must have.
    fn parameter_count(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// p: parameter vector
    /// out: buffer to write dx/dt
    fn apply(&self, t: T, x: &[T], p: &[T], out: &mut [T]);
}

impl<T: Scalar, S: ParametricSystem<T> + ?Sized> ParametricSystem<T> for &S {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn parameter_count(&self) -> usize {
        (**self).parameter_count()
    }

    fn apply(&self, t: T, x: &[T], p: &[T], out: &mut [T]) {
        (**self).apply(t, x, p, out)
    }
}
