use udefit_core::data::{generate, ExperimentConfig, NoiseSettings, SyntheticData};
use udefit_core::equation_engine::EquationSystem;
use udefit_core::loss::LossEvaluator;
use udefit_core::models::LotkaVolterra;
use udefit_core::optimize::{AdamSettings, BfgsSettings, Control, Objective};
use udefit_core::problem::InitialValueProblem;
use udefit_core::solvers::Simulator;
use udefit_core::training::{Phase, TrainingLoop, TrainingSettings};

const TRUTH: [f64; 4] = [1.5, 1.0, 3.0, 1.0];
const INITIAL_GUESS: [f64; 4] = [2.2, 1.0, 2.0, 0.4];

fn problem() -> InitialValueProblem {
    InitialValueProblem::uniformly_sampled(vec![1.0, 1.0], (0.0, 10.0), 0.1).expect("problem")
}

fn data(noise_magnitude: f64) -> SyntheticData {
    generate(
        &mut ExperimentConfig::default().context(),
        &Simulator::default(),
        &LotkaVolterra,
        &problem(),
        &TRUTH,
        &NoiseSettings { noise_magnitude },
    )
    .expect("synthetic data")
}

fn evaluator(observations: SyntheticData) -> LossEvaluator<LotkaVolterra> {
    LossEvaluator::new(
        Simulator::default(),
        LotkaVolterra,
        problem(),
        observations.observations,
    )
    .expect("evaluator")
}

fn settings(adam_iterations: usize, bfgs_iterations: usize) -> TrainingSettings {
    TrainingSettings {
        exploration: AdamSettings {
            learning_rate: 0.05,
            iterations: adam_iterations,
            ..AdamSettings::default()
        },
        refinement: BfgsSettings {
            max_iterations: bfgs_iterations,
            ..BfgsSettings::default()
        },
        ..TrainingSettings::default()
    }
}

#[test]
fn two_phase_fit_improves_on_the_initial_guess() {
    let eval = evaluator(data(0.05));
    let initial_loss = eval.loss(&INITIAL_GUESS).expect("initial loss");

    let outcome = TrainingLoop::new(settings(2500, 200))
        .expect("training loop")
        .run(&eval, INITIAL_GUESS.to_vec(), |_| Control::Continue)
        .expect("training");

    let explored = &outcome.phases[0];
    assert_eq!(explored.phase, Phase::Exploration);
    assert!(
        explored.loss < initial_loss,
        "exploration loss {} should be below initial loss {initial_loss}",
        explored.loss
    );
    assert!(outcome.loss <= explored.loss);
    assert_eq!(outcome.trace.phase(Phase::Exploration).count(), 2500);
    assert_eq!(outcome.params.len(), 4);
}

#[test]
fn exploration_fills_the_trace_to_its_budget() {
    let eval = evaluator(data(0.05));
    let mut lengths = Vec::new();
    let outcome = TrainingLoop::new(settings(30, 0))
        .expect("training loop")
        .run(&eval, INITIAL_GUESS.to_vec(), |progress| {
            lengths.push(progress.trace.len());
            Control::Continue
        })
        .expect("training");

    assert_eq!(outcome.trace.len(), 30);
    assert!(lengths.windows(2).all(|w| w[1] > w[0]));
    assert_eq!(outcome.trace.entries()[0].loss, eval.loss(&INITIAL_GUESS).expect("loss"));
}

#[test]
fn refinement_accepts_only_non_increasing_losses() {
    let eval = evaluator(data(0.05));
    let outcome = TrainingLoop::new(settings(20, 60))
        .expect("training loop")
        .run(&eval, INITIAL_GUESS.to_vec(), |_| Control::Continue)
        .expect("training");

    let mut previous = outcome.phases[0].loss;
    for entry in outcome.trace.phase(Phase::Refinement) {
        assert!(
            entry.loss <= previous,
            "refinement step {} raised the loss from {previous} to {}",
            entry.iteration,
            entry.loss
        );
        previous = entry.loss;
    }
    assert!(outcome.loss <= outcome.phases[0].loss);
}

#[test]
fn training_from_the_truth_on_clean_data_stays_at_zero() {
    let clean = data(0.0);
    assert_eq!(clean.observations, clean.reference);
    let eval = evaluator(clean);

    let outcome = TrainingLoop::new(settings(25, 25))
        .expect("training loop")
        .run(&eval, TRUTH.to_vec(), |_| Control::Continue)
        .expect("training");

    assert_eq!(outcome.loss, 0.0);
    assert_eq!(outcome.params, TRUTH.to_vec());
    assert!(outcome.trace.losses().iter().all(|&l| l == 0.0));
}

#[test]
fn equation_system_reproduces_the_built_in_model() {
    let system = EquationSystem::compile(
        &["alpha*x - beta*x*y", "-gamma*y + delta*x*y"],
        &["x", "y"],
        &["alpha", "beta", "gamma", "delta"],
        &[],
    )
    .expect("equations");
    let observations = data(0.05).observations;
    let from_strings = LossEvaluator::new(Simulator::default(), system, problem(), observations)
        .expect("evaluator");
    let built_in = evaluator(data(0.05));

    let (a, grad_a) = from_strings.value_and_gradient(&INITIAL_GUESS).expect("strings");
    let (b, grad_b) = built_in.value_and_gradient(&INITIAL_GUESS).expect("built in");
    assert!((a - b).abs() <= 1e-8 * b, "{a} vs {b}");
    for (ga, gb) in grad_a.iter().zip(&grad_b) {
        assert!((ga - gb).abs() <= 1e-6 * gb.abs().max(1.0), "{ga} vs {gb}");
    }
}
