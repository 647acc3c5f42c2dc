//! Synthetic observations: a noiseless reference trajectory plus Gaussian
//! measurement noise scaled to the mean of each state component.

use crate::error::{Result, UdeError};
use crate::problem::{InitialValueProblem, Trajectory};
use crate::solvers::Simulator;
use crate::traits::ParametricSystem;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

impl ExperimentConfig {
    pub fn context(&self) -> ExperimentContext {
        ExperimentContext::new(*self)
    }
}

/// Owns every source of randomness for one experiment. Pass it explicitly to
/// whatever needs to draw numbers.
#[derive(Debug, Clone)]
pub struct ExperimentContext {
    rng: StdRng,
}

impl ExperimentContext {
    pub fn new(config: ExperimentConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NoiseSettings {
    /// Noise standard deviation as a fraction of each component's mean.
    pub noise_magnitude: f64,
}

impl Default for NoiseSettings {
    fn default() -> Self {
        Self {
            noise_magnitude: 0.05,
        }
    }
}

impl NoiseSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.noise_magnitude.is_finite() || self.noise_magnitude < 0.0 {
            return Err(UdeError::InvalidSettings(format!(
                "noise_magnitude must be finite and non-negative, got {}",
                self.noise_magnitude
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticData {
    pub reference: Trajectory,
    pub observations: Trajectory,
}

/// Simulates `system` at `true_params` and perturbs the result.
///
/// Each sample receives `noise_magnitude * mean_i * z` with `z ~ N(0, 1)`,
/// drawn in sample-major order from the context RNG.
pub fn generate<S>(
    context: &mut ExperimentContext,
    simulator: &Simulator,
    system: &S,
    problem: &InitialValueProblem,
    true_params: &[f64],
    settings: &NoiseSettings,
) -> Result<SyntheticData>
where
    S: ParametricSystem<f64> + ?Sized,
{
    settings.validate()?;
    let reference = simulator.solve(system, problem, true_params)?;
    let means = reference.component_means();

    let mut states = reference.states.clone();
    if settings.noise_magnitude > 0.0 {
        for row in states.chunks_exact_mut(reference.dimension) {
            for (value, mean) in row.iter_mut().zip(&means) {
                let z: f64 = context.rng().sample(StandardNormal);
                *value += settings.noise_magnitude * mean * z;
            }
        }
    }
    debug!(
        samples = reference.len(),
        noise_magnitude = settings.noise_magnitude,
        "generated synthetic observations"
    );

    let observations = Trajectory::new(reference.dimension, reference.times.clone(), states)?;
    Ok(SyntheticData {
        reference,
        observations,
    })
}
