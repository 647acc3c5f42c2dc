//! Gradient-based minimizers used by the training loop.
//!
//! Both optimizers talk to the problem through [`Objective`] and report every
//! iterate to a callback that can stop the run at an iteration boundary.

pub mod adam;
pub mod bfgs;

pub use adam::{Adam, AdamSettings};
pub use bfgs::{Bfgs, BfgsSettings};

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// A scalar function of the parameter vector with a gradient.
pub trait Objective {
    fn dimension(&self) -> usize;

    fn value(&self, params: &[f64]) -> Result<f64>;

    fn value_and_gradient(&self, params: &[f64]) -> Result<(f64, Vec<f64>)>;

    /// Loss at a line-search trial point. Wrappers that replace failed
    /// evaluations with a substitute loss must pass failures through here,
    /// so a failed trial is rejected instead of accepted.
    fn trial_value(&self, params: &[f64]) -> Result<f64> {
        self.value(params)
    }
}

impl<O: Objective + ?Sized> Objective for &O {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn value(&self, params: &[f64]) -> Result<f64> {
        (**self).value(params)
    }

    fn value_and_gradient(&self, params: &[f64]) -> Result<(f64, Vec<f64>)> {
        (**self).value_and_gradient(params)
    }

    fn trial_value(&self, params: &[f64]) -> Result<f64> {
        (**self).trial_value(params)
    }
}

/// Returned by iteration callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    Continue,
    Stop,
}

/// What an optimizer reports once per iteration.
#[derive(Debug, Clone, Copy)]
pub struct Iterate<'a> {
    pub iteration: usize,
    pub params: &'a [f64],
    pub loss: f64,
    pub gradient_norm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// The iteration budget ran out.
    BudgetExhausted,
    /// The callback returned `Control::Stop`.
    Stopped,
    GradientTolerance,
    FunctionTolerance,
    /// No trial point along the search direction was acceptable.
    LineSearchFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Minimum {
    pub params: Vec<f64>,
    pub loss: f64,
    /// Number of iterates reported to the callback.
    pub iterations: usize,
    pub termination: Termination,
}

pub trait Optimizer {
    fn minimize<O: Objective + ?Sized>(
        &self,
        objective: &O,
        initial: Vec<f64>,
        callback: &mut dyn FnMut(&Iterate<'_>) -> Control,
    ) -> Result<Minimum>;
}

pub(crate) fn norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}
