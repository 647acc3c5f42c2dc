//! Two-phase training: Adam to get into the basin, then BFGS to refine.
//!
//! The loop owns the parameter vector and the loss trace. Optimizer state
//! lives only inside each phase; the sole thing handed from one phase to the
//! next is the parameter vector.

use crate::error::{ensure_dimension, Result, UdeError};
use crate::optimize::{
    Adam, AdamSettings, Bfgs, BfgsSettings, Control, Iterate, Minimum, Objective, Optimizer,
    Termination,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// What to do when the simulation behind a loss evaluation fails.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum DivergencePolicy {
    /// Fail the run with the underlying error.
    #[default]
    Abort,
    /// Report `loss` with a zero gradient and keep going.
    Penalize { loss: f64 },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrainingSettings {
    pub exploration: AdamSettings,
    pub refinement: BfgsSettings,
    pub divergence: DivergencePolicy,
}

impl TrainingSettings {
    pub fn validate(&self) -> Result<()> {
        self.exploration.validate()?;
        self.refinement.validate()?;
        if let DivergencePolicy::Penalize { loss } = self.divergence {
            if !loss.is_finite() || loss < 0.0 {
                return Err(UdeError::InvalidSettings(format!(
                    "penalty loss must be finite and non-negative, got {loss}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Exploration,
    Refinement,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Exploration => write!(f, "exploration"),
            Phase::Refinement => write!(f, "refinement"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub phase: Phase,
    pub iteration: usize,
    pub loss: f64,
}

/// Append-only record of the loss at every reported iterate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossTrace {
    entries: Vec<TraceEntry>,
}

impl LossTrace {
    fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.entries.last()
    }

    pub fn losses(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.loss).collect()
    }

    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = &TraceEntry> + '_ {
        self.entries.iter().filter(move |e| e.phase == phase)
    }
}

/// Passed to the user callback after each trace entry is recorded.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    pub phase: Phase,
    pub iteration: usize,
    pub params: &'a [f64],
    pub loss: f64,
    pub trace: &'a LossTrace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub iterations: usize,
    pub loss: f64,
    pub termination: Termination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub params: Vec<f64>,
    pub loss: f64,
    pub trace: LossTrace,
    pub phases: Vec<PhaseReport>,
}

/// Applies a [`DivergencePolicy`] to another objective.
struct Guarded<'a, O: ?Sized> {
    inner: &'a O,
    policy: DivergencePolicy,
}

impl<O: Objective + ?Sized> Guarded<'_, O> {
    fn recover<T>(&self, err: UdeError, penalty: impl FnOnce(f64) -> T) -> Result<T> {
        match self.policy {
            DivergencePolicy::Penalize { loss } if err.is_candidate_failure() => {
                warn!(error = %err, penalty = loss, "substituting penalty loss");
                Ok(penalty(loss))
            }
            _ => Err(err),
        }
    }
}

impl<O: Objective + ?Sized> Objective for Guarded<'_, O> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn value(&self, params: &[f64]) -> Result<f64> {
        self.inner
            .value(params)
            .or_else(|err| self.recover(err, |loss| loss))
    }

    fn value_and_gradient(&self, params: &[f64]) -> Result<(f64, Vec<f64>)> {
        let n = params.len();
        self.inner
            .value_and_gradient(params)
            .or_else(|err| self.recover(err, |loss| (loss, vec![0.0; n])))
    }

    fn trial_value(&self, params: &[f64]) -> Result<f64> {
        self.inner.trial_value(params)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrainingLoop {
    settings: TrainingSettings,
}

impl TrainingLoop {
    pub fn new(settings: TrainingSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    /// Runs both phases from `initial`. `callback` sees every traced iterate
    /// and may return `Control::Stop` to end the phase it is called from.
    pub fn run<O, F>(
        &self,
        objective: &O,
        initial: Vec<f64>,
        mut callback: F,
    ) -> Result<TrainingOutcome>
    where
        O: Objective + ?Sized,
        F: FnMut(&Progress<'_>) -> Control,
    {
        ensure_dimension("parameter", objective.dimension(), initial.len())?;
        let guarded = Guarded {
            inner: objective,
            policy: self.settings.divergence,
        };
        let mut trace = LossTrace::default();
        let mut phases = Vec::with_capacity(2);

        let adam = Adam::new(self.settings.exploration)?;
        let explored = run_phase(
            Phase::Exploration,
            &adam,
            &guarded,
            initial,
            &mut trace,
            &mut callback,
        )?;
        let params = explored.params.clone();
        phases.push(report(Phase::Exploration, &explored));

        let bfgs = Bfgs::new(self.settings.refinement)?;
        let refined = run_phase(
            Phase::Refinement,
            &bfgs,
            &guarded,
            params,
            &mut trace,
            &mut callback,
        )?;
        phases.push(report(Phase::Refinement, &refined));

        info!(
            loss = refined.loss,
            trace_len = trace.len(),
            "training finished"
        );
        Ok(TrainingOutcome {
            params: refined.params,
            loss: refined.loss,
            trace,
            phases,
        })
    }
}

fn run_phase<P, O, F>(
    phase: Phase,
    optimizer: &P,
    objective: &O,
    initial: Vec<f64>,
    trace: &mut LossTrace,
    callback: &mut F,
) -> Result<Minimum>
where
    P: Optimizer,
    O: Objective + ?Sized,
    F: FnMut(&Progress<'_>) -> Control,
{
    info!(%phase, "starting phase");
    let minimum = optimizer.minimize(objective, initial, &mut |it: &Iterate<'_>| {
        trace.push(TraceEntry {
            phase,
            iteration: it.iteration,
            loss: it.loss,
        });
        debug!(
            %phase,
            iteration = it.iteration,
            loss = it.loss,
            gradient_norm = it.gradient_norm,
            "iterate"
        );
        callback(&Progress {
            phase,
            iteration: it.iteration,
            params: it.params,
            loss: it.loss,
            trace,
        })
    })?;
    info!(
        %phase,
        iterations = minimum.iterations,
        loss = minimum.loss,
        termination = ?minimum.termination,
        "phase finished"
    );
    Ok(minimum)
}

fn report(phase: Phase, minimum: &Minimum) -> PhaseReport {
    PhaseReport {
        phase,
        iterations: minimum.iterations,
        loss: minimum.loss,
        termination: minimum.termination,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::test_objectives::{Quadratic, Walled};

    fn short_settings() -> TrainingSettings {
        TrainingSettings {
            exploration: AdamSettings {
                iterations: 20,
                ..AdamSettings::default()
            },
            ..TrainingSettings::default()
        }
    }

    #[test]
    fn exploration_traces_one_entry_per_iteration() {
        let objective = Quadratic {
            target: vec![1.0, 2.0],
            scale: vec![1.0, 1.0],
        };
        let mut seen = Vec::new();
        let outcome = TrainingLoop::new(short_settings())
            .expect("loop")
            .run(&objective, vec![0.0, 0.0], |progress| {
                seen.push(progress.trace.len());
                Control::Continue
            })
            .expect("run");

        assert_eq!(outcome.trace.phase(Phase::Exploration).count(), 20);
        assert_eq!(outcome.phases[0].iterations, 20);
        // the callback sees the trace after its own entry was appended
        assert_eq!(seen, (1..=outcome.trace.len()).collect::<Vec<_>>());
        assert!(outcome.loss < 1e-10);
    }

    #[test]
    fn refinement_losses_never_increase() {
        let objective = Quadratic {
            target: vec![3.0, -1.0, 0.5],
            scale: vec![1.0, 10.0, 0.1],
        };
        let outcome = TrainingLoop::new(short_settings())
            .expect("loop")
            .run(&objective, vec![0.0; 3], |_| Control::Continue)
            .expect("run");
        let mut previous = outcome.phases[0].loss;
        for entry in outcome.trace.phase(Phase::Refinement) {
            assert!(entry.loss <= previous);
            previous = entry.loss;
        }
    }

    #[test]
    fn stop_ends_only_the_current_phase() {
        let objective = Quadratic {
            target: vec![1.0],
            scale: vec![1.0],
        };
        let outcome = TrainingLoop::new(short_settings())
            .expect("loop")
            .run(&objective, vec![0.0], |progress| {
                if progress.phase == Phase::Exploration && progress.iteration == 2 {
                    Control::Stop
                } else {
                    Control::Continue
                }
            })
            .expect("run");
        assert_eq!(outcome.phases[0].termination, Termination::Stopped);
        assert_eq!(outcome.trace.phase(Phase::Exploration).count(), 3);
        assert!(outcome.trace.phase(Phase::Refinement).count() > 0);
    }

    #[test]
    fn abort_policy_propagates_divergence() {
        let settings = TrainingSettings {
            exploration: AdamSettings {
                learning_rate: 5.0,
                iterations: 5,
                ..AdamSettings::default()
            },
            ..TrainingSettings::default()
        };
        let err = TrainingLoop::new(settings)
            .expect("loop")
            .run(&Walled { wall: 3.0 }, vec![0.0], |_| Control::Continue)
            .expect_err("divergence should abort");
        assert!(err.is_candidate_failure());
    }

    #[test]
    fn penalty_policy_substitutes_the_configured_loss() {
        let settings = TrainingSettings {
            exploration: AdamSettings {
                learning_rate: 5.0,
                iterations: 3,
                ..AdamSettings::default()
            },
            divergence: DivergencePolicy::Penalize { loss: 1e6 },
            ..TrainingSettings::default()
        };
        let outcome = TrainingLoop::new(settings)
            .expect("loop")
            .run(&Walled { wall: 3.0 }, vec![0.0], |_| Control::Continue)
            .expect("penalty keeps the run alive");
        // 0 -> 5 crosses the wall on the first update
        let losses = outcome.trace.losses();
        assert_eq!(losses[0], 100.0);
        assert_eq!(losses[1], 1e6);
    }

    #[test]
    fn penalty_never_wins_a_refinement_line_search() {
        // The penalty sits below the starting loss, so a masked failure would
        // pass the no-increase guard if the line search ever saw it.
        let settings = TrainingSettings {
            exploration: AdamSettings {
                iterations: 0,
                ..AdamSettings::default()
            },
            refinement: BfgsSettings {
                initial_step_norm: 4.0,
                ..BfgsSettings::default()
            },
            divergence: DivergencePolicy::Penalize { loss: 50.0 },
        };
        let walled = Walled { wall: 3.0 };
        let outcome = TrainingLoop::new(settings)
            .expect("loop")
            .run(&walled, vec![0.0], |_| Control::Continue)
            .expect("run");

        assert!(outcome.params[0] <= 3.0, "params {:?}", outcome.params);
        let raw = walled.value(&outcome.params).expect("result integrates");
        assert_eq!(outcome.loss, raw);
        assert!(outcome.loss >= 49.0);
        assert!(outcome
            .trace
            .phase(Phase::Refinement)
            .all(|entry| entry.loss != 50.0));
        assert_ne!(outcome.phases[1].termination, Termination::GradientTolerance);
    }

    #[test]
    fn rejects_negative_penalty() {
        let settings = TrainingSettings {
            divergence: DivergencePolicy::Penalize { loss: -1.0 },
            ..TrainingSettings::default()
        };
        let err = TrainingLoop::new(settings).expect_err("negative penalty");
        assert!(format!("{err}").contains("penalty loss"));
    }
}
