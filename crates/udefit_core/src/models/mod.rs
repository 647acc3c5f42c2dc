//! Dynamics models: fully parametric systems and hybrid models that add a
//! learnable term to a fixed analytic one.

pub mod hybrid;
pub mod lotka_volterra;
pub mod neural;

pub use hybrid::{HybridModel, InteractionTerm, NoKnownDynamics, ZeroTerm};
pub use lotka_volterra::{LotkaVolterra, LotkaVolterraKnown};
pub use neural::{Activation, DenseNetwork};

use crate::error::Result;
use crate::traits::Scalar;

/// The fixed, closed-form part of a hybrid model.
pub trait KnownDynamics {
    fn dimension(&self) -> usize;

    /// Checked once by [`HybridModel::new`]. Known dynamics have no free
    /// parameters, so anything that would read one is rejected here.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Writes the known contribution to `dx/dt` into `out`.
    fn evaluate<T: Scalar>(&self, t: T, x: &[T], out: &mut [T]);
}

/// The learnable part of a hybrid model, driven by the parameter vector.
pub trait LearnedTerm {
    fn input_dimension(&self) -> usize;

    fn output_dimension(&self) -> usize;

    fn parameter_count(&self) -> usize;

    /// Adds the learned contribution `U(x; p)` onto `out`.
    fn accumulate<T: Scalar>(&self, x: &[T], p: &[T], out: &mut [T]);
}
