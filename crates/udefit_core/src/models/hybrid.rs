use super::{KnownDynamics, LearnedTerm};
use crate::error::{ensure_dimension, Result};
use crate::traits::{constant, ParametricSystem, Scalar};

/// `dx/dt = known(t, x) + learned(x; p)`.
///
/// The parameter vector belongs entirely to the learned term.
#[derive(Debug, Clone)]
pub struct HybridModel<K, L> {
    pub known: K,
    pub learned: L,
}

impl<K: KnownDynamics, L: LearnedTerm> HybridModel<K, L> {
    pub fn new(known: K, learned: L) -> Result<Self> {
        known.validate()?;
        let dim = known.dimension();
        ensure_dimension("learned term input", dim, learned.input_dimension())?;
        ensure_dimension("learned term output", dim, learned.output_dimension())?;
        Ok(Self { known, learned })
    }

    /// Output of the learned term alone at a single state.
    pub fn learned_output(&self, x: &[f64], p: &[f64]) -> Result<Vec<f64>> {
        ensure_dimension("state", self.known.dimension(), x.len())?;
        ensure_dimension("parameter", self.learned.parameter_count(), p.len())?;
        let mut out = vec![0.0; self.learned.output_dimension()];
        self.learned.accumulate(x, p, &mut out);
        Ok(out)
    }
}

impl<T: Scalar, K: KnownDynamics, L: LearnedTerm> ParametricSystem<T> for HybridModel<K, L> {
    fn dimension(&self) -> usize {
        self.known.dimension()
    }

    fn parameter_count(&self) -> usize {
        self.learned.parameter_count()
    }

    fn apply(&self, t: T, x: &[T], p: &[T], out: &mut [T]) {
        self.known.evaluate(t, x, out);
        self.learned.accumulate(x, p, out);
    }
}

/// Known dynamics that contribute nothing, for purely learned models.
#[derive(Debug, Clone, Copy)]
pub struct NoKnownDynamics {
    pub dimension: usize,
}

impl KnownDynamics for NoKnownDynamics {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn evaluate<T: Scalar>(&self, _t: T, _x: &[T], out: &mut [T]) {
        for value in out.iter_mut() {
            *value = T::zero();
        }
    }
}

/// A learned term that always outputs zero while still claiming a nominal
/// parameter vector. Useful to check that a hybrid model reduces to its
/// known part.
#[derive(Debug, Clone, Copy)]
pub struct ZeroTerm {
    pub dimension: usize,
    pub parameter_count: usize,
}

impl LearnedTerm for ZeroTerm {
    fn input_dimension(&self) -> usize {
        self.dimension
    }

    fn output_dimension(&self) -> usize {
        self.dimension
    }

    fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    fn accumulate<T: Scalar>(&self, _x: &[T], _p: &[T], _out: &mut [T]) {}
}

/// Scalar coefficients on the predator-prey interaction:
/// `U(x, y; p) = (-p0·x·y, p1·x·y)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InteractionTerm;

impl LearnedTerm for InteractionTerm {
    fn input_dimension(&self) -> usize {
        2
    }

    fn output_dimension(&self) -> usize {
        2
    }

    fn parameter_count(&self) -> usize {
        2
    }

    fn accumulate<T: Scalar>(&self, x: &[T], p: &[T], out: &mut [T]) {
        let xy = x[0] * x[1];
        out[0] = out[0] + constant::<T>(-1.0) * p[0] * xy;
        out[1] = out[1] + p[1] * xy;
    }
}
