use crate::autodiff::Dual;
use crate::error::{ensure_dimension, Result, UdeError};
use crate::optimize::Objective;
use crate::problem::{InitialValueProblem, Trajectory};
use crate::solvers::Simulator;
use crate::traits::ParametricSystem;

/// Sum of squared errors between a simulated trajectory and observations on
/// the same grid.
#[derive(Debug, Clone)]
pub struct LossEvaluator<S> {
    simulator: Simulator,
    model: S,
    problem: InitialValueProblem,
    observations: Trajectory,
}

impl<S> LossEvaluator<S>
where
    S: ParametricSystem<f64> + ParametricSystem<Dual>,
{
    pub fn new(
        simulator: Simulator,
        model: S,
        problem: InitialValueProblem,
        observations: Trajectory,
    ) -> Result<Self> {
        let dim = ParametricSystem::<f64>::dimension(&model);
        ensure_dimension("state", dim, problem.dimension())?;
        ensure_dimension("observation", dim, observations.dimension)?;
        ensure_dimension("observation sample", problem.grid.len(), observations.len())?;
        if observations.times.as_slice() != problem.grid.times() {
            return Err(UdeError::InvalidTimeGrid(
                "observation times differ from the problem grid".to_string(),
            ));
        }
        Ok(Self {
            simulator,
            model,
            problem,
            observations,
        })
    }

    pub fn model(&self) -> &S {
        &self.model
    }

    pub fn problem(&self) -> &InitialValueProblem {
        &self.problem
    }

    pub fn observations(&self) -> &Trajectory {
        &self.observations
    }

    pub fn parameter_count(&self) -> usize {
        ParametricSystem::<f64>::parameter_count(&self.model)
    }

    pub fn loss(&self, params: &[f64]) -> Result<f64> {
        Ok(self.loss_and_prediction(params)?.0)
    }

    pub fn loss_and_prediction(&self, params: &[f64]) -> Result<(f64, Trajectory)> {
        let prediction = self.simulator.solve(&self.model, &self.problem, params)?;
        Ok((self.sum_of_squares(&prediction), prediction))
    }

    /// Loss and `dL/dp = 2 Σ_k Σ_i (x_i(t_k) - obs_i(t_k)) ∂x_i(t_k)/∂p`.
    pub fn loss_and_gradient(&self, params: &[f64]) -> Result<(f64, Vec<f64>)> {
        let solved = self
            .simulator
            .solve_with_sensitivities(&self.model, &self.problem, params)?;
        let prediction = &solved.trajectory;
        let dim = prediction.dimension;
        let np = solved.parameter_count;

        let mut gradient = vec![0.0; np];
        for k in 0..prediction.len() {
            let predicted = prediction.state(k);
            let observed = self.observations.state(k);
            for i in 0..dim {
                let residual = predicted[i] - observed[i];
                let row = &solved.sensitivities[(k * dim + i) * np..(k * dim + i + 1) * np];
                for (g, s) in gradient.iter_mut().zip(row) {
                    *g += 2.0 * residual * s;
                }
            }
        }
        if let Some(pos) = gradient.iter().position(|g| !g.is_finite()) {
            return Err(UdeError::Gradient(format!(
                "gradient component {pos} is not finite"
            )));
        }
        Ok((self.sum_of_squares(prediction), gradient))
    }

    fn sum_of_squares(&self, prediction: &Trajectory) -> f64 {
        prediction
            .states
            .iter()
            .zip(&self.observations.states)
            .map(|(x, o)| (x - o) * (x - o))
            .sum()
    }
}

impl<S> Objective for LossEvaluator<S>
where
    S: ParametricSystem<f64> + ParametricSystem<Dual>,
{
    fn dimension(&self) -> usize {
        self.parameter_count()
    }

    fn value(&self, params: &[f64]) -> Result<f64> {
        self.loss(params)
    }

    fn value_and_gradient(&self, params: &[f64]) -> Result<(f64, Vec<f64>)> {
        self.loss_and_gradient(params)
    }
}
