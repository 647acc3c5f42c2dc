use super::KnownDynamics;
use crate::traits::{constant, ParametricSystem, Scalar};

/// Predator-prey model with all four rates learnable:
///
/// ```text
/// dx/dt =  α·x − β·x·y
/// dy/dt = −γ·y + δ·x·y
/// ```
///
/// Parameter order is `[α, β, γ, δ]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LotkaVolterra;

impl LotkaVolterra {
    pub const PARAMETER_NAMES: [&'static str; 4] = ["alpha", "beta", "gamma", "delta"];

    /// The interaction terms `(−β·x·y, δ·x·y)` that a hybrid model built on
    /// `LotkaVolterraKnown` has to learn.
    pub fn interaction(params: &[f64], x: &[f64]) -> [f64; 2] {
        let xy = x[0] * x[1];
        [-params[1] * xy, params[3] * xy]
    }
}

impl<T: Scalar> ParametricSystem<T> for LotkaVolterra {
    fn dimension(&self) -> usize {
        2
    }

    fn parameter_count(&self) -> usize {
        4
    }

    fn apply(&self, _t: T, x: &[T], p: &[T], out: &mut [T]) {
        let (prey, predator) = (x[0], x[1]);
        out[0] = p[0] * prey - p[1] * prey * predator;
        out[1] = -p[2] * predator + p[3] * prey * predator;
    }
}

/// The linear part of the predator-prey model with fixed rates: prey growth
/// `α·x` and predator decay `−γ·y`. The interaction is left to a learned term.
#[derive(Debug, Clone, Copy)]
pub struct LotkaVolterraKnown {
    pub prey_growth: f64,
    pub predator_decay: f64,
}

impl LotkaVolterraKnown {
    pub fn new(prey_growth: f64, predator_decay: f64) -> Self {
        Self {
            prey_growth,
            predator_decay,
        }
    }
}

impl KnownDynamics for LotkaVolterraKnown {
    fn dimension(&self) -> usize {
        2
    }

    fn evaluate<T: Scalar>(&self, _t: T, x: &[T], out: &mut [T]) {
        out[0] = constant::<T>(self.prey_growth) * x[0];
        out[1] = constant::<T>(-self.predator_decay) * x[1];
    }
}
