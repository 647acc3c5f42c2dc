//! Problem and trajectory types shared by the simulator, the data generator
//! and the loss evaluator.

use crate::error::{ensure_dimension, Result, UdeError};
use serde::{Deserialize, Serialize};

/// Strictly increasing sample times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeGrid {
    times: Vec<f64>,
}

impl TimeGrid {
    pub fn new(times: Vec<f64>) -> Result<Self> {
        if times.is_empty() {
            return Err(UdeError::InvalidTimeGrid(
                "grid must contain at least one sample time".to_string(),
            ));
        }
        if let Some(bad) = times.iter().find(|t| !t.is_finite()) {
            return Err(UdeError::InvalidTimeGrid(format!(
                "sample time {bad} is not finite"
            )));
        }
        for (idx, pair) in times.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(UdeError::InvalidTimeGrid(format!(
                    "sample times must be strictly increasing (t[{}] = {}, t[{}] = {})",
                    idx,
                    pair[0],
                    idx + 1,
                    pair[1]
                )));
            }
        }
        Ok(Self { times })
    }

    /// Uniform grid `start, start + step, ...` up to and including `end`.
    ///
    /// The sample count is rounded so that accumulated floating error does
    /// not drop the final point; the last sample is pinned to `end` when the
    /// span is an integer multiple of the step.
    pub fn uniform(start: f64, end: f64, step: f64) -> Result<Self> {
        if !(step > 0.0) || !step.is_finite() {
            return Err(UdeError::InvalidTimeGrid(format!(
                "step must be positive and finite, got {step}"
            )));
        }
        if !(end >= start) {
            return Err(UdeError::InvalidTimeGrid(format!(
                "end ({end}) must not precede start ({start})"
            )));
        }
        let intervals = ((end - start) / step + 1e-9).floor() as usize;
        let mut times: Vec<f64> = (0..=intervals)
            .map(|i| start + step * i as f64)
            .collect();
        if let Some(last) = times.last_mut() {
            if (*last - end).abs() <= 1e-9 * step.max(1.0) {
                *last = end;
            }
        }
        Self::new(times)
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn first(&self) -> f64 {
        self.times[0]
    }

    pub fn last(&self) -> f64 {
        self.times[self.times.len() - 1]
    }
}

/// An initial value problem sampled on a fixed grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialValueProblem {
    pub initial_state: Vec<f64>,
    pub t0: f64,
    pub t1: f64,
    pub grid: TimeGrid,
}

impl InitialValueProblem {
    pub fn new(initial_state: Vec<f64>, span: (f64, f64), grid: TimeGrid) -> Result<Self> {
        let (t0, t1) = span;
        if !t0.is_finite() || !t1.is_finite() || t1 <= t0 {
            return Err(UdeError::InvalidTimeGrid(format!(
                "time span [{t0}, {t1}] must be finite and increasing"
            )));
        }
        if grid.first() < t0 || grid.last() > t1 {
            return Err(UdeError::InvalidTimeGrid(format!(
                "sample times [{}, {}] fall outside the span [{t0}, {t1}]",
                grid.first(),
                grid.last()
            )));
        }
        if initial_state.is_empty() {
            return Err(UdeError::InvalidSettings(
                "initial state must have positive dimension".to_string(),
            ));
        }
        Ok(Self {
            initial_state,
            t0,
            t1,
            grid,
        })
    }

    /// Span `[t0, t1]` sampled every `step`, the layout every scenario uses.
    pub fn uniformly_sampled(initial_state: Vec<f64>, span: (f64, f64), step: f64) -> Result<Self> {
        let grid = TimeGrid::uniform(span.0, span.1, step)?;
        Self::new(initial_state, span, grid)
    }

    pub fn dimension(&self) -> usize {
        self.initial_state.len()
    }

    /// Same initial condition, integrated over a longer horizon.
    pub fn extended(&self, t1: f64, step: f64) -> Result<Self> {
        Self::uniformly_sampled(self.initial_state.clone(), (self.t0, t1), step)
    }
}

/// States sampled on a time grid, stored row-major (`states[k * dim + i]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub dimension: usize,
    pub times: Vec<f64>,
    pub states: Vec<f64>,
}

impl Trajectory {
    pub fn new(dimension: usize, times: Vec<f64>, states: Vec<f64>) -> Result<Self> {
        ensure_dimension("trajectory", times.len() * dimension, states.len())?;
        Ok(Self {
            dimension,
            times,
            states,
        })
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn state(&self, index: usize) -> &[f64] {
        &self.states[index * self.dimension..(index + 1) * self.dimension]
    }

    /// Per-component mean over all samples.
    pub fn component_means(&self) -> Vec<f64> {
        let mut means = vec![0.0; self.dimension];
        if self.is_empty() {
            return means;
        }
        for k in 0..self.len() {
            for (mean, value) in means.iter_mut().zip(self.state(k)) {
                *mean += value;
            }
        }
        let count = self.len() as f64;
        for mean in &mut means {
            *mean /= count;
        }
        means
    }

    /// One series per component, convenient for reporting.
    pub fn components(&self) -> Vec<Vec<f64>> {
        (0..self.dimension)
            .map(|i| (0..self.len()).map(|k| self.states[k * self.dimension + i]).collect())
            .collect()
    }
}

/// A trajectory together with its parameter sensitivities at every sample,
/// stored as `sensitivities[k * dim * p + i * p + j] = ∂x_i(t_k)/∂p_j`.
#[derive(Debug, Clone)]
pub struct SensitivityTrajectory {
    pub trajectory: Trajectory,
    pub parameter_count: usize,
    pub sensitivities: Vec<f64>,
}

impl SensitivityTrajectory {
    pub fn sensitivity(&self, sample: usize, component: usize, parameter: usize) -> f64 {
        let dim = self.trajectory.dimension;
        let p = self.parameter_count;
        self.sensitivities[sample * dim * p + component * p + parameter]
    }
}
