use super::{norm, Control, Iterate, Minimum, Objective, Optimizer, Termination};
use crate::error::{ensure_dimension, Result, UdeError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdamSettings {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Number of gradient evaluations (and updates) in one run.
    pub iterations: usize,
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            iterations: 100,
        }
    }
}

impl AdamSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(UdeError::InvalidSettings(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(UdeError::InvalidSettings(format!(
                    "{name} must lie in [0, 1), got {beta}"
                )));
            }
        }
        if !(self.epsilon > 0.0) {
            return Err(UdeError::InvalidSettings(
                "epsilon must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Adam with bias-corrected moment estimates.
#[derive(Debug, Clone, Copy, Default)]
pub struct Adam {
    pub settings: AdamSettings,
}

impl Adam {
    pub fn new(settings: AdamSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }
}

impl Optimizer for Adam {
    /// Each iteration evaluates the loss and gradient at the current point,
    /// reports that point, then updates it. The loss returned after a full
    /// budget belongs to the final, updated parameters.
    fn minimize<O: Objective + ?Sized>(
        &self,
        objective: &O,
        initial: Vec<f64>,
        callback: &mut dyn FnMut(&Iterate<'_>) -> Control,
    ) -> Result<Minimum> {
        let s = &self.settings;
        s.validate()?;
        ensure_dimension("parameter", objective.dimension(), initial.len())?;

        let mut params = initial;
        let mut m = vec![0.0; params.len()];
        let mut v = vec![0.0; params.len()];
        let mut beta1_power = 1.0;
        let mut beta2_power = 1.0;

        for iteration in 0..s.iterations {
            let (loss, grad) = objective.value_and_gradient(&params)?;
            ensure_dimension("gradient", params.len(), grad.len())?;

            let control = callback(&Iterate {
                iteration,
                params: &params,
                loss,
                gradient_norm: norm(&grad),
            });
            if control == Control::Stop {
                return Ok(Minimum {
                    params,
                    loss,
                    iterations: iteration + 1,
                    termination: Termination::Stopped,
                });
            }

            beta1_power *= s.beta1;
            beta2_power *= s.beta2;
            for i in 0..params.len() {
                m[i] = s.beta1 * m[i] + (1.0 - s.beta1) * grad[i];
                v[i] = s.beta2 * v[i] + (1.0 - s.beta2) * grad[i] * grad[i];
                let m_hat = m[i] / (1.0 - beta1_power);
                let v_hat = v[i] / (1.0 - beta2_power);
                params[i] -= s.learning_rate * m_hat / (v_hat.sqrt() + s.epsilon);
            }
        }

        let loss = objective.value(&params)?;
        Ok(Minimum {
            params,
            loss,
            iterations: s.iterations,
            termination: Termination::BudgetExhausted,
        })
    }
}
