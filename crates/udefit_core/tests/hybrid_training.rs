use udefit_core::data::{generate, ExperimentConfig, NoiseSettings, SyntheticData};
use udefit_core::loss::LossEvaluator;
use udefit_core::models::{
    Activation, DenseNetwork, HybridModel, InteractionTerm, LotkaVolterra, LotkaVolterraKnown,
    ZeroTerm,
};
use udefit_core::optimize::{AdamSettings, BfgsSettings, Control};
use udefit_core::problem::InitialValueProblem;
use udefit_core::solvers::Simulator;
use udefit_core::training::{DivergencePolicy, TrainingLoop, TrainingSettings};
use udefit_core::UdeError;

const TRUTH: [f64; 4] = [1.5, 1.0, 3.0, 1.0];

fn problem() -> InitialValueProblem {
    InitialValueProblem::uniformly_sampled(vec![1.0, 1.0], (0.0, 3.0), 0.1).expect("problem")
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

fn known() -> LotkaVolterraKnown {
    LotkaVolterraKnown::new(TRUTH[0], TRUTH[2])
}

#[test]
fn zero_term_loss_matches_known_dynamics_alone() {
    let observations = data(0.05).observations;
    let bare = LossEvaluator::new(
        Simulator::default(),
        HybridModel::new(
            known(),
            ZeroTerm {
                dimension: 2,
                parameter_count: 0,
            },
        )
        .expect("model"),
        problem(),
        observations.clone(),
    )
    .expect("evaluator");
    let padded = LossEvaluator::new(
        Simulator::default(),
        HybridModel::new(
            known(),
            ZeroTerm {
                dimension: 2,
                parameter_count: 6,
            },
        )
        .expect("model"),
        problem(),
        observations,
    )
    .expect("evaluator");

    let reference = bare.loss(&[]).expect("bare loss");
    assert!(reference > 0.0);
    for params in [[0.0; 6], [3.0, -1.0, 7.5, 0.2, -9.0, 1e3]] {
        assert_eq!(padded.loss(&params).expect("padded loss"), reference);
        let (_, grad) = padded.loss_and_gradient(&params).expect("gradient");
        assert!(grad.iter().all(|&g| g == 0.0));
    }
}

#[test]
fn interaction_coefficients_are_recovered_from_clean_data() {
    let model = HybridModel::new(known(), InteractionTerm).expect("model");
    let eval = LossEvaluator::new(Simulator::default(), model, problem(), data(0.0).observations)
        .expect("evaluator");

    let settings = TrainingSettings {
        exploration: AdamSettings {
            learning_rate: 0.02,
            iterations: 100,
            ..AdamSettings::default()
        },
        refinement: BfgsSettings {
            max_iterations: 300,
            ..BfgsSettings::default()
        },
        ..TrainingSettings::default()
    };
    let outcome = TrainingLoop::new(settings)
        .expect("training loop")
        .run(&eval, vec![0.8, 1.2], |_| Control::Continue)
        .expect("training");

    assert!(outcome.loss < 1e-8, "loss {}", outcome.loss);
    assert!((outcome.params[0] - 1.0).abs() < 1e-3, "{:?}", outcome.params);
    assert!((outcome.params[1] - 1.0).abs() < 1e-3, "{:?}", outcome.params);
}

#[test]
fn neural_hybrid_training_reduces_the_loss() {
    let network = DenseNetwork::new(vec![2, 6, 2], Activation::Tanh).expect("network");
    let initial = network.initial_parameters(&mut ExperimentConfig { seed: 3 }.context());
    let model = HybridModel::new(known(), network).expect("model");
    let eval = LossEvaluator::new(Simulator::default(), model, problem(), data(0.05).observations)
        .expect("evaluator");
    let initial_loss = eval.loss(&initial).expect("initial loss");

    let settings = TrainingSettings {
        exploration: AdamSettings {
            learning_rate: 0.01,
            iterations: 150,
            ..AdamSettings::default()
        },
        refinement: BfgsSettings {
            max_iterations: 30,
            ..BfgsSettings::default()
        },
        divergence: DivergencePolicy::Penalize { loss: 1e6 },
    };
    let outcome = TrainingLoop::new(settings)
        .expect("training loop")
        .run(&eval, initial, |_| Control::Continue)
        .expect("training");

    assert!(
        outcome.loss < initial_loss,
        "final loss {} should be below initial loss {initial_loss}",
        outcome.loss
    );

    // The learned term is evaluated along the data like any other field.
    let learned = eval
        .model()
        .learned_output(&[1.0, 1.0], &outcome.params)
        .expect("learned output");
    assert_eq!(learned.len(), 2);
    assert!(learned.iter().all(|v| v.is_finite()));
}

#[test]
fn wrong_parameter_count_is_a_dimension_error() {
    let model = HybridModel::new(known(), InteractionTerm).expect("model");
    let eval = LossEvaluator::new(Simulator::default(), model, problem(), data(0.0).observations)
        .expect("evaluator");
    let err = TrainingLoop::default()
        .run(&eval, vec![1.0, 1.0, 1.0], |_| Control::Continue)
        .expect_err("dimension mismatch");
    assert_eq!(
        err,
        UdeError::DimensionMismatch {
            what: "parameter",
            expected: 2,
            actual: 3
        }
    );
}
