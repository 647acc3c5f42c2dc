//! BFGS with a backtracking Armijo line search.
//!
//! The line search never accepts a point whose loss is above the current one
//! unless `allow_increase` is set, and a trial point whose evaluation fails
//! for that candidate alone (integration or gradient failure) is treated as a
//! rejected step rather than an error.

use super::{norm, Control, Iterate, Minimum, Objective, Optimizer, Termination};
use crate::error::{ensure_dimension, Result, UdeError};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

const ARMIJO_C1: f64 = 1e-4;
const BACKTRACK: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BfgsSettings {
    /// Length of the first step; sets the initial inverse Hessian to
    /// `I * initial_step_norm / |g0|`.
    pub initial_step_norm: f64,
    pub max_iterations: usize,
    /// Take the full quasi-Newton step whenever it evaluates, even if the
    /// loss goes up.
    pub allow_increase: bool,
    pub gradient_tolerance: f64,
    pub function_tolerance: f64,
    pub max_line_search_steps: usize,
}

impl Default for BfgsSettings {
    fn default() -> Self {
        Self {
            initial_step_norm: 0.01,
            max_iterations: 1000,
            allow_increase: false,
            gradient_tolerance: 1e-8,
            function_tolerance: 1e-12,
            max_line_search_steps: 40,
        }
    }
}

impl BfgsSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.initial_step_norm > 0.0) || !self.initial_step_norm.is_finite() {
            return Err(UdeError::InvalidSettings(format!(
                "initial_step_norm must be positive and finite, got {}",
                self.initial_step_norm
            )));
        }
        if !(self.gradient_tolerance >= 0.0) || !(self.function_tolerance >= 0.0) {
            return Err(UdeError::InvalidSettings(
                "tolerances must be non-negative".to_string(),
            ));
        }
        if self.max_line_search_steps == 0 {
            return Err(UdeError::InvalidSettings(
                "max_line_search_steps must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bfgs {
    pub settings: BfgsSettings,
}

impl Bfgs {
    pub fn new(settings: BfgsSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    /// Backtracks from the full step. Returns the accepted point and its loss.
    fn line_search<O: Objective + ?Sized>(
        &self,
        objective: &O,
        x: &DVector<f64>,
        loss: f64,
        direction: &DVector<f64>,
        slope: f64,
    ) -> Result<Option<(DVector<f64>, f64)>> {
        let s = &self.settings;
        let mut alpha = 1.0;
        for attempt in 0..s.max_line_search_steps {
            let candidate = x + direction * alpha;
            match objective.trial_value(candidate.as_slice()) {
                Ok(trial) if trial.is_finite() => {
                    let armijo = trial <= loss + ARMIJO_C1 * alpha * slope;
                    if s.allow_increase || (armijo && trial <= loss) {
                        return Ok(Some((candidate, trial)));
                    }
                    trace!(attempt, alpha, trial, loss, "line search rejected trial");
                }
                Ok(_) => trace!(attempt, alpha, "line search trial is not finite"),
                Err(err) if err.is_candidate_failure() => {
                    trace!(attempt, alpha, error = %err, "line search trial failed");
                }
                Err(err) => return Err(err),
            }
            alpha *= BACKTRACK;
        }
        Ok(None)
    }
}

impl Optimizer for Bfgs {
    /// Reports every accepted step to `callback`. The starting point is
    /// evaluated but not reported.
    fn minimize<O: Objective + ?Sized>(
        &self,
        objective: &O,
        initial: Vec<f64>,
        callback: &mut dyn FnMut(&Iterate<'_>) -> Control,
    ) -> Result<Minimum> {
        let s = &self.settings;
        s.validate()?;
        let n = initial.len();
        ensure_dimension("parameter", objective.dimension(), n)?;

        let mut x = DVector::from_vec(initial);
        let (mut loss, grad) = objective.value_and_gradient(x.as_slice())?;
        ensure_dimension("gradient", n, grad.len())?;
        let mut g = DVector::from_vec(grad);

        let finish = |x: DVector<f64>, loss: f64, iterations: usize, termination: Termination| {
            Minimum {
                params: x.as_slice().to_vec(),
                loss,
                iterations,
                termination,
            }
        };

        let g_norm = g.norm();
        if g_norm <= s.gradient_tolerance {
            return Ok(finish(x, loss, 0, Termination::GradientTolerance));
        }

        let initial_scale = s.initial_step_norm / g_norm;
        let mut h_inv = DMatrix::<f64>::identity(n, n) * initial_scale;

        for iteration in 0..s.max_iterations {
            let mut direction = -(&h_inv * &g);
            let mut slope = g.dot(&direction);
            if !(slope < 0.0) {
                // Lost positive definiteness; restart from a scaled identity.
                h_inv = DMatrix::identity(n, n) * (s.initial_step_norm / g.norm());
                direction = -(&h_inv * &g);
                slope = g.dot(&direction);
            }

            let Some((x_new, trial_loss)) =
                self.line_search(objective, &x, loss, &direction, slope)?
            else {
                warn!(iteration, loss, "line search found no acceptable step");
                return Ok(finish(x, loss, iteration, Termination::LineSearchFailed));
            };

            let (_, grad_new) = objective.value_and_gradient(x_new.as_slice())?;
            ensure_dimension("gradient", n, grad_new.len())?;
            let g_new = DVector::from_vec(grad_new);
            let g_new_norm = norm(g_new.as_slice());

            let control = callback(&Iterate {
                iteration,
                params: x_new.as_slice(),
                loss: trial_loss,
                gradient_norm: g_new_norm,
            });

            let step = &x_new - &x;
            let change = &g_new - &g;
            let previous_loss = loss;
            x = x_new;
            g = g_new;
            loss = trial_loss;

            if control == Control::Stop {
                return Ok(finish(x, loss, iteration + 1, Termination::Stopped));
            }
            if g_new_norm <= s.gradient_tolerance {
                return Ok(finish(x, loss, iteration + 1, Termination::GradientTolerance));
            }
            if (previous_loss - loss).abs() <= s.function_tolerance * previous_loss.abs().max(1.0)
            {
                return Ok(finish(x, loss, iteration + 1, Termination::FunctionTolerance));
            }

            let curvature = step.dot(&change);
            if curvature > 1e-12 * step.norm() * change.norm() {
                // H <- (I - rho s y^T) H (I - rho y s^T) + rho s s^T
                let rho = 1.0 / curvature;
                let hy = &h_inv * &change;
                let yhy = change.dot(&hy);
                h_inv += (&step * step.transpose()) * (rho * (1.0 + rho * yhy))
                    - (&step * hy.transpose() + &hy * step.transpose()) * rho;
            }
        }

        Ok(finish(x, loss, s.max_iterations, Termination::BudgetExhausted))
    }
}
