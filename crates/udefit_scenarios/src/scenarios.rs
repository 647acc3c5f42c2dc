use crate::results::{Extrapolation, MissingTerm, ScenarioReport};
use anyhow::{Context, Result};
use tracing::{info, warn};
use udefit_core::autodiff::Dual;
use udefit_core::data::{generate, ExperimentConfig, NoiseSettings};
use udefit_core::equation_engine::EquationSystem;
use udefit_core::loss::LossEvaluator;
use udefit_core::models::{
    Activation, DenseNetwork, HybridModel, LotkaVolterra, LotkaVolterraKnown,
};
use udefit_core::optimize::{AdamSettings, BfgsSettings, Control};
use udefit_core::problem::InitialValueProblem;
use udefit_core::solvers::Simulator;
use udefit_core::traits::ParametricSystem;
use udefit_core::training::{DivergencePolicy, Progress, TrainingLoop, TrainingSettings};

const TRUE_PARAMETERS: [f64; 4] = [1.5, 1.0, 3.0, 1.0];
const INITIAL_STATE: [f64; 2] = [1.0, 1.0];
const SAMPLE_STEP: f64 = 0.1;
const EXTRAPOLATION_END: f64 = 20.0;
const LOG_EVERY: usize = 100;

/// Scenario 1: recover all four Lotka-Volterra rates from noisy data.
pub mod parameter_fit {
    pub const PREFIX: &str = "lv_parameters";
    pub const SPAN: (f64, f64) = (0.0, 10.0);
    pub const INITIAL_GUESS: [f64; 4] = [2.2, 1.0, 2.0, 0.4];
    pub const EQUATIONS: [&str; 2] = ["alpha*x - beta*x*y", "-gamma*y + delta*x*y"];
    pub const ADAM_LEARNING_RATE: f64 = 0.05;
    pub const ADAM_ITERATIONS: usize = 2500;
    pub const BFGS_ITERATIONS: usize = 1000;
}

/// Scenario 2: keep the linear rates, learn the interaction with a network.
pub mod missing_physics {
    pub const PREFIX: &str = "lv_missing_physics";
    pub const SPAN: (f64, f64) = (0.0, 3.0);
    pub const WIDTHS: [usize; 4] = [2, 5, 5, 2];
    pub const ADAM_LEARNING_RATE: f64 = 0.05;
    pub const ADAM_ITERATIONS: usize = 200;
    pub const BFGS_ITERATIONS: usize = 1000;
    pub const PENALTY_LOSS: f64 = 1e6;
}

fn log_progress(scenario: &'static str) -> impl FnMut(&Progress<'_>) -> Control {
    move |progress: &Progress<'_>| {
        if progress.iteration % LOG_EVERY == 0 {
            info!(
                scenario,
                phase = %progress.phase,
                iteration = progress.iteration,
                loss = progress.loss,
                "training progress"
            );
        }
        Control::Continue
    }
}

/// Simulates truth and fit past the training span. A fit that cannot be
/// integrated that far is logged and left out of the report.
fn extrapolate<S>(
    problem: &InitialValueProblem,
    simulator: &Simulator,
    model: &S,
    fitted: &[f64],
) -> Result<Option<Extrapolation>>
where
    S: ParametricSystem<f64>,
{
    let long = problem
        .extended(EXTRAPOLATION_END, SAMPLE_STEP)
        .context("failed to build extrapolation grid")?;
    let truth = simulator
        .solve(&LotkaVolterra, &long, &TRUE_PARAMETERS)
        .context("failed to simulate ground truth over the extrapolation horizon")?;
    match simulator.solve(model, &long, fitted) {
        Ok(prediction) => Ok(Some(Extrapolation {
            times: long.grid.times().to_vec(),
            truth: truth.components(),
            fitted: prediction.components(),
        })),
        Err(err) => {
            warn!(error = %err, "fitted model could not be extrapolated");
            Ok(None)
        }
    }
}

pub fn run_parameter_fit(noise_magnitude: f64) -> Result<ScenarioReport> {
    use parameter_fit::*;

    let config = ExperimentConfig::default();
    let mut context = config.context();
    let simulator = Simulator::default();
    let problem =
        InitialValueProblem::uniformly_sampled(INITIAL_STATE.to_vec(), SPAN, SAMPLE_STEP)?;
    let data = generate(
        &mut context,
        &simulator,
        &LotkaVolterra,
        &problem,
        &TRUE_PARAMETERS,
        &NoiseSettings { noise_magnitude },
    )
    .context("failed to generate synthetic data")?;

    let system = EquationSystem::compile(
        &EQUATIONS,
        &["x", "y"],
        &LotkaVolterra::PARAMETER_NAMES,
        &[],
    )?;
    let eval =
        LossEvaluator::new(simulator, system, problem.clone(), data.observations.clone())?;
    let initial_loss = eval.loss(&INITIAL_GUESS).context("failed to evaluate initial guess")?;

    let settings = TrainingSettings {
        exploration: AdamSettings {
            learning_rate: ADAM_LEARNING_RATE,
            iterations: ADAM_ITERATIONS,
            ..AdamSettings::default()
        },
        refinement: BfgsSettings {
            max_iterations: BFGS_ITERATIONS,
            ..BfgsSettings::default()
        },
        divergence: DivergencePolicy::Abort,
    };
    let outcome = TrainingLoop::new(settings)?
        .run(&eval, INITIAL_GUESS.to_vec(), log_progress(PREFIX))
        .context("training failed")?;
    info!(
        scenario = PREFIX,
        noise_magnitude,
        fitted = ?outcome.params,
        loss = outcome.loss,
        "fit complete"
    );

    let (_, fitted) = eval.loss_and_prediction(&outcome.params)?;
    let extrapolation = extrapolate(&problem, &simulator, eval.model(), &outcome.params)?;

    Ok(ScenarioReport {
        scenario: PREFIX,
        model: format!("dx/dt = {}; dy/dt = {}", EQUATIONS[0], EQUATIONS[1]),
        noise_magnitude,
        seed: config.seed,
        parameter_names: LotkaVolterra::PARAMETER_NAMES
            .iter()
            .map(|s| s.to_string())
            .collect(),
        true_parameters: TRUE_PARAMETERS.to_vec(),
        initial_parameters: INITIAL_GUESS.to_vec(),
        fitted_parameters: outcome.params,
        initial_loss,
        final_loss: outcome.loss,
        times: data.reference.times.clone(),
        reference: data.reference.components(),
        observations: data.observations.components(),
        fitted: fitted.components(),
        trace: outcome.trace,
        phases: outcome.phases,
        extrapolation,
        missing_term: None,
    })
}

pub fn run_missing_physics(noise_magnitude: f64) -> Result<ScenarioReport> {
    use missing_physics::*;

    let config = ExperimentConfig::default();
    let mut context = config.context();
    let simulator = Simulator::default();
    let problem =
        InitialValueProblem::uniformly_sampled(INITIAL_STATE.to_vec(), SPAN, SAMPLE_STEP)?;
    let data = generate(
        &mut context,
        &simulator,
        &LotkaVolterra,
        &problem,
        &TRUE_PARAMETERS,
        &NoiseSettings { noise_magnitude },
    )
    .context("failed to generate synthetic data")?;

    let known = LotkaVolterraKnown::new(TRUE_PARAMETERS[0], TRUE_PARAMETERS[2]);
    let network = DenseNetwork::new(WIDTHS.to_vec(), Activation::Rbf)?;
    let initial = network.initial_parameters(&mut context);
    let model = HybridModel::new(known, network)?;
    let parameter_count = ParametricSystem::<Dual>::parameter_count(&model);
    let eval = LossEvaluator::new(simulator, model, problem.clone(), data.observations.clone())?;
    let initial_loss = eval.loss(&initial).context("failed to evaluate initial network")?;

    let settings = TrainingSettings {
        exploration: AdamSettings {
            learning_rate: ADAM_LEARNING_RATE,
            iterations: ADAM_ITERATIONS,
            ..AdamSettings::default()
        },
        refinement: BfgsSettings {
            max_iterations: BFGS_ITERATIONS,
            ..BfgsSettings::default()
        },
        divergence: DivergencePolicy::Penalize { loss: PENALTY_LOSS },
    };
    let outcome = TrainingLoop::new(settings)?
        .run(&eval, initial.clone(), log_progress(PREFIX))
        .context("training failed")?;
    info!(
        scenario = PREFIX,
        noise_magnitude,
        parameters = parameter_count,
        loss = outcome.loss,
        "fit complete"
    );

    let (_, fitted) = eval
        .loss_and_prediction(&outcome.params)
        .context("fitted network does not integrate over the training span")?;

    let mut missing = MissingTerm {
        states: Vec::with_capacity(fitted.len()),
        learned: Vec::with_capacity(fitted.len()),
        truth: Vec::with_capacity(fitted.len()),
    };
    for k in 0..fitted.len() {
        let state = fitted.state(k);
        let learned = eval.model().learned_output(state, &outcome.params)?;
        missing.states.push([state[0], state[1]]);
        missing.learned.push([learned[0], learned[1]]);
        missing
            .truth
            .push(LotkaVolterra::interaction(&TRUE_PARAMETERS, state));
    }

    let extrapolation = extrapolate(&problem, &simulator, eval.model(), &outcome.params)?;

    Ok(ScenarioReport {
        scenario: PREFIX,
        model: format!(
            "dx/dt = {a}*x + U1(x, y); dy/dt = -{g}*y + U2(x, y); U = dense network {WIDTHS:?} (rbf)",
            a = TRUE_PARAMETERS[0],
            g = TRUE_PARAMETERS[2],
        ),
        noise_magnitude,
        seed: config.seed,
        parameter_names: (0..parameter_count).map(|i| format!("w{i}")).collect(),
        true_parameters: TRUE_PARAMETERS.to_vec(),
        initial_parameters: initial,
        fitted_parameters: outcome.params,
        initial_loss,
        final_loss: outcome.loss,
        times: data.reference.times.clone(),
        reference: data.reference.components(),
        observations: data.observations.components(),
        fitted: fitted.components(),
        trace: outcome.trace,
        phases: outcome.phases,
        extrapolation,
        missing_term: Some(missing),
    })
}
