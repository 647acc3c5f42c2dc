use crate::autodiff::{Dual, SensitivitySystem};
use crate::error::{ensure_dimension, Result, UdeError};
use crate::problem::{InitialValueProblem, SensitivityTrajectory, Trajectory};
use crate::traits::ParametricSystem;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Settings controlling the adaptive integrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SolverSettings {
    pub rtol: f64,
    pub atol: f64,
    /// First trial step. `None` picks one from the local derivative scale.
    pub initial_step: Option<f64>,
    pub min_step: f64,
    pub max_step: f64,
    pub max_steps: usize,
    pub safety: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-8,
            initial_step: None,
            min_step: 1e-12,
            max_step: f64::INFINITY,
            max_steps: 100_000,
            safety: 0.9,
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.rtol > 0.0) || !(self.atol > 0.0) {
            return Err(UdeError::InvalidSettings(
                "rtol and atol must be positive".to_string(),
            ));
        }
        if !(self.min_step > 0.0) {
            return Err(UdeError::InvalidSettings(
                "min_step must be positive".to_string(),
            ));
        }
        if !(self.max_step >= self.min_step) {
            return Err(UdeError::InvalidSettings(
                "max_step must not be smaller than min_step".to_string(),
            ));
        }
        if let Some(h) = self.initial_step {
            if !(h > 0.0) || !h.is_finite() {
                return Err(UdeError::InvalidSettings(
                    "initial_step must be positive and finite".to_string(),
                ));
            }
        }
        if self.max_steps == 0 {
            return Err(UdeError::InvalidSettings(
                "max_steps must be greater than zero".to_string(),
            ));
        }
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(UdeError::InvalidSettings(
                "safety must lie in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

// Tsitouras 5(4) tableau.
const C2: f64 = 0.161;
const C3: f64 = 0.327;
const C4: f64 = 0.9;
const C5: f64 = 0.9800255409045097;

const A21: f64 = 0.161;
const A31: f64 = -0.008480655492356989;
const A32: f64 = 0.335480655492357;
const A41: f64 = 2.898;
const A42: f64 = -6.359447987781783;
const A43: f64 = 4.361447987781783;
const A51: f64 = 5.325864858437957;
const A52: f64 = -11.748883564062828;
const A53: f64 = 7.495539342889693;
const A54: f64 = -0.09249506636030195;
const A61: f64 = 5.86145544294642;
const A62: f64 = -12.92096931784711;
const A63: f64 = 8.159367898576159;
const A64: f64 = -0.071584973281401;
const A65: f64 = -0.02826857949054663;

// 5th order weights (also row 7 of the tableau, which makes the method FSAL).
const B1: f64 = 0.09646076681806523;
const B2: f64 = 0.01;
const B3: f64 = 0.4798896504144996;
const B4: f64 = 1.379008574103742;
const B5: f64 = -3.290069515436099;
const B6: f64 = 2.324710524099774;

// Difference between the 5th and embedded 4th order weights.
const E1: f64 = -0.00178001105222577714;
const E2: f64 = -0.0008164344596567469;
const E3: f64 = 0.007880878010261995;
const E4: f64 = -0.1447110071732629;
const E5: f64 = 0.5823571654525552;
const E6: f64 = -0.45808210592918697;
const E7: f64 = 0.015151515151515152;

/// Stage storage for one Tsit5 step.
/// `k1` must hold f(t, y) on entry; after `attempt`, `k7` holds f(t + dt, y_new).
struct Tsit5 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    k5: Vec<f64>,
    k6: Vec<f64>,
    k7: Vec<f64>,
    tmp: Vec<f64>,
    y_new: Vec<f64>,
    err: Vec<f64>,
}

impl Tsit5 {
    fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            k5: vec![0.0; dim],
            k6: vec![0.0; dim],
            k7: vec![0.0; dim],
            tmp: vec![0.0; dim],
            y_new: vec![0.0; dim],
            err: vec![0.0; dim],
        }
    }

    fn attempt<S: ParametricSystem<f64> + ?Sized>(
        &mut self,
        system: &S,
        params: &[f64],
        t0: f64,
        state: &[f64],
        dt: f64,
    ) {
        let n = state.len();

        for i in 0..n {
            self.tmp[i] = state[i] + dt * (A21 * self.k1[i]);
        }
        system.apply(t0 + C2 * dt, &self.tmp, params, &mut self.k2);

        for i in 0..n {
            self.tmp[i] = state[i] + dt * (A31 * self.k1[i] + A32 * self.k2[i]);
        }
        system.apply(t0 + C3 * dt, &self.tmp, params, &mut self.k3);

        for i in 0..n {
            self.tmp[i] = state[i] + dt * (A41 * self.k1[i] + A42 * self.k2[i] + A43 * self.k3[i]);
        }
        system.apply(t0 + C4 * dt, &self.tmp, params, &mut self.k4);

        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (A51 * self.k1[i] + A52 * self.k2[i] + A53 * self.k3[i] + A54 * self.k4[i]);
        }
        system.apply(t0 + C5 * dt, &self.tmp, params, &mut self.k5);

        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (A61 * self.k1[i]
                    + A62 * self.k2[i]
                    + A63 * self.k3[i]
                    + A64 * self.k4[i]
                    + A65 * self.k5[i]);
        }
        system.apply(t0 + dt, &self.tmp, params, &mut self.k6);

        for i in 0..n {
            self.y_new[i] = state[i]
                + dt * (B1 * self.k1[i]
                    + B2 * self.k2[i]
                    + B3 * self.k3[i]
                    + B4 * self.k4[i]
                    + B5 * self.k5[i]
                    + B6 * self.k6[i]);
        }
        system.apply(t0 + dt, &self.y_new, params, &mut self.k7);

        for i in 0..n {
            self.err[i] = dt
                * (E1 * self.k1[i]
                    + E2 * self.k2[i]
                    + E3 * self.k3[i]
                    + E4 * self.k4[i]
                    + E5 * self.k5[i]
                    + E6 * self.k6[i]
                    + E7 * self.k7[i]);
        }
    }
}

/// Adaptive Tsit5 integrator with cubic Hermite dense output.
///
/// Only the first `control` components of the state take part in step-size
/// control. Sensitivity solves restrict it to the primary state so that a
/// plain solve and a sensitivity solve follow the same step sequence and
/// report bit-identical trajectories.
#[derive(Debug, Clone, Copy)]
pub struct Simulator {
    settings: SolverSettings,
}

impl Default for Simulator {
    fn default() -> Self {
        Self {
            settings: SolverSettings::default(),
        }
    }
}

impl Simulator {
    pub fn new(settings: SolverSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// Integrates `system` under `params` and samples it on the problem grid.
    pub fn solve<S>(
        &self,
        system: &S,
        problem: &InitialValueProblem,
        params: &[f64],
    ) -> Result<Trajectory>
    where
        S: ParametricSystem<f64> + ?Sized,
    {
        ensure_dimension("state", system.dimension(), problem.dimension())?;
        ensure_dimension("parameter", system.parameter_count(), params.len())?;

        let dim = problem.dimension();
        let states = self.integrate(system, params, &problem.initial_state, problem, dim)?;
        Trajectory::new(dim, problem.grid.times().to_vec(), states)
    }

    /// Integrates the state together with `∂x/∂p` for every parameter.
    pub fn solve_with_sensitivities<S>(
        &self,
        system: &S,
        problem: &InitialValueProblem,
        params: &[f64],
    ) -> Result<SensitivityTrajectory>
    where
        S: ParametricSystem<f64> + ParametricSystem<Dual>,
    {
        let dim = ParametricSystem::<f64>::dimension(system);
        let np = ParametricSystem::<f64>::parameter_count(system);
        ensure_dimension("state", dim, problem.dimension())?;
        ensure_dimension("parameter", np, params.len())?;

        let augmented = SensitivitySystem::new(system);
        let y0 = augmented.initial_state(&problem.initial_state);
        let raw = self.integrate(&augmented, params, &y0, problem, dim)?;

        let aug_dim = dim + dim * np;
        let samples = problem.grid.len();
        let mut states = Vec::with_capacity(samples * dim);
        let mut sensitivities = Vec::with_capacity(samples * dim * np);
        for row in raw.chunks_exact(aug_dim) {
            states.extend_from_slice(&row[..dim]);
            sensitivities.extend_from_slice(&row[dim..]);
        }

        if let Some(pos) = sensitivities.iter().position(|v| !v.is_finite()) {
            return Err(UdeError::Gradient(format!(
                "sensitivity entry {pos} is not finite"
            )));
        }

        Ok(SensitivityTrajectory {
            trajectory: Trajectory::new(dim, problem.grid.times().to_vec(), states)?,
            parameter_count: np,
            sensitivities,
        })
    }

    fn integrate<S>(
        &self,
        system: &S,
        params: &[f64],
        y0: &[f64],
        problem: &InitialValueProblem,
        control: usize,
    ) -> Result<Vec<f64>>
    where
        S: ParametricSystem<f64> + ?Sized,
    {
        let settings = &self.settings;
        let dim = y0.len();
        let samples = problem.grid.times();
        let (t0, t1) = (problem.t0, problem.t1);

        if y0.iter().any(|v| !v.is_finite()) {
            return Err(UdeError::integration(t0, "initial state is not finite"));
        }

        let mut out = Vec::with_capacity(samples.len() * dim);
        let mut next = 0usize;
        while next < samples.len() && samples[next] <= t0 {
            out.extend_from_slice(y0);
            next += 1;
        }
        if next == samples.len() {
            return Ok(out);
        }

        let mut stepper = Tsit5::new(dim);
        let mut y = y0.to_vec();
        let mut t = t0;
        system.apply(t, &y, params, &mut stepper.k1);
        if stepper.k1.iter().any(|v| !v.is_finite()) {
            return Err(UdeError::integration(t, "vector field is not finite at the initial state"));
        }

        let mut dt = match settings.initial_step {
            Some(h) => h,
            None => self.initial_step(system, params, t, &y, &stepper.k1, control),
        }
        .min(settings.max_step)
        .min(t1 - t0);

        let mut attempts = 0usize;
        while next < samples.len() {
            if attempts >= settings.max_steps {
                return Err(UdeError::integration(
                    t,
                    format!("exceeded max_steps ({})", settings.max_steps),
                ));
            }
            attempts += 1;

            let remaining = t1 - t;
            // Never leave a sliver of the span that is shorter than min_step.
            let last_step = dt >= remaining || remaining - dt < settings.min_step;
            if last_step {
                dt = remaining;
            }
            if dt < settings.min_step {
                return Err(UdeError::integration(
                    t,
                    format!("step size {dt:e} collapsed below min_step"),
                ));
            }

            stepper.attempt(system, params, t, &y, dt);
            let finite = stepper.y_new.iter().all(|v| v.is_finite())
                && stepper.k7.iter().all(|v| v.is_finite());
            let err = if finite {
                self.error_norm(&y, &stepper.y_new, &stepper.err, control)
            } else {
                f64::INFINITY
            };

            if err <= 1.0 {
                let t_new = if last_step { t1 } else { t + dt };
                while next < samples.len() && samples[next] <= t_new {
                    let ts = samples[next];
                    if ts == t_new {
                        out.extend_from_slice(&stepper.y_new);
                    } else {
                        let theta = (ts - t) / dt;
                        hermite(&y, &stepper.y_new, &stepper.k1, &stepper.k7, dt, theta, &mut out);
                    }
                    next += 1;
                }

                std::mem::swap(&mut y, &mut stepper.y_new);
                std::mem::swap(&mut stepper.k1, &mut stepper.k7);
                t = t_new;

                let factor = if err == 0.0 {
                    10.0
                } else {
                    (settings.safety * err.powf(-0.2)).clamp(0.2, 10.0)
                };
                dt = (dt * factor).min(settings.max_step);
            } else {
                trace!(t, dt, err, "rejected step");
                let factor = if err.is_finite() {
                    (settings.safety * err.powf(-0.2)).max(0.2)
                } else {
                    0.2
                };
                dt *= factor;
            }

            if t >= t1 && next < samples.len() {
                return Err(UdeError::integration(t, "reached end of span before all samples"));
            }
        }

        Ok(out)
    }

    fn error_norm(&self, y: &[f64], y_new: &[f64], err: &[f64], control: usize) -> f64 {
        let mut sum = 0.0;
        for i in 0..control {
            let scale =
                self.settings.atol + self.settings.rtol * y[i].abs().max(y_new[i].abs());
            let ratio = err[i] / scale;
            sum += ratio * ratio;
        }
        (sum / control as f64).sqrt()
    }

    /// Starting step from the local scale of the solution and its
    /// derivative (Hairer, Nørsett & Wanner, II.4).
    fn initial_step<S>(
        &self,
        system: &S,
        params: &[f64],
        t: f64,
        y: &[f64],
        f0: &[f64],
        control: usize,
    ) -> f64
    where
        S: ParametricSystem<f64> + ?Sized,
    {
        let settings = &self.settings;
        let scale: Vec<f64> = y[..control]
            .iter()
            .map(|v| settings.atol + settings.rtol * v.abs())
            .collect();
        let rms = |values: &[f64]| -> f64 {
            let sum: f64 = values
                .iter()
                .zip(&scale)
                .map(|(v, s)| (v / s) * (v / s))
                .sum();
            (sum / control as f64).sqrt()
        };

        let d0 = rms(&y[..control]);
        let d1 = rms(&f0[..control]);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };

        let y1: Vec<f64> = y.iter().zip(f0).map(|(yi, fi)| yi + h0 * fi).collect();
        let mut f1 = vec![0.0; y.len()];
        system.apply(t + h0, &y1, params, &mut f1);
        let diff: Vec<f64> = f1[..control]
            .iter()
            .zip(&f0[..control])
            .map(|(a, b)| a - b)
            .collect();
        let d2 = rms(&diff) / h0;

        let h1 = if !d2.is_finite() {
            h0
        } else if d1.max(d2) <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(0.2)
        };

        (100.0 * h0).min(h1).max(settings.min_step)
    }
}

/// Cubic Hermite interpolant on `[t, t + dt]` evaluated at `t + theta * dt`.
fn hermite(
    y0: &[f64],
    y1: &[f64],
    f0: &[f64],
    f1: &[f64],
    dt: f64,
    theta: f64,
    out: &mut Vec<f64>,
) {
    let theta2 = theta * theta;
    let theta3 = theta2 * theta;
    let h00 = 2.0 * theta3 - 3.0 * theta2 + 1.0;
    let h10 = theta3 - 2.0 * theta2 + theta;
    let h01 = -2.0 * theta3 + 3.0 * theta2;
    let h11 = theta3 - theta2;
    for i in 0..y0.len() {
        out.push(h00 * y0[i] + h10 * dt * f0[i] + h01 * y1[i] + h11 * dt * f1[i]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::TimeGrid;
    use crate::traits::Scalar;

    struct Decay;

    impl<T: Scalar> ParametricSystem<T> for Decay {
        fn dimension(&self) -> usize {
            1
        }
        fn parameter_count(&self) -> usize {
            1
        }
        fn apply(&self, _t: T, x: &[T], p: &[T], out: &mut [T]) {
            out[0] = -p[0] * x[0];
        }
    }

    /// dx/dt = x², which blows up at t = 1 / x0.
    struct Blowup;

    impl<T: Scalar> ParametricSystem<T> for Blowup {
        fn dimension(&self) -> usize {
            1
        }
        fn parameter_count(&self) -> usize {
            0
        }
        fn apply(&self, _t: T, x: &[T], _p: &[T], out: &mut [T]) {
            out[0] = x[0] * x[0];
        }
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn tsit5_tracks_exponential_decay() {
        let problem =
            InitialValueProblem::uniformly_sampled(vec![1.0], (0.0, 2.0), 0.25).expect("problem");
        let traj = Simulator::default()
            .solve(&Decay, &problem, &[1.5])
            .expect("solve should succeed");
        assert_eq!(traj.len(), 9);
        for (k, &t) in traj.times.iter().enumerate() {
            let exact = (-1.5 * t).exp();
            assert!(
                (traj.state(k)[0] - exact).abs() < 1e-6,
                "t = {t}: {} vs {exact}",
                traj.state(k)[0]
            );
        }
    }

    #[test]
    fn sampling_at_span_start_returns_initial_state() {
        let grid = TimeGrid::new(vec![0.0]).expect("grid");
        let problem = InitialValueProblem::new(vec![3.0], (0.0, 1.0), grid).expect("problem");
        let traj = Simulator::default()
            .solve(&Decay, &problem, &[1.0])
            .expect("solve");
        assert_eq!(traj.states, vec![3.0]);
    }

    #[test]
    fn sensitivities_match_analytic_derivative() {
        // x(t) = x0 exp(-p t) -> dx/dp = -t x(t)
        let problem =
            InitialValueProblem::uniformly_sampled(vec![2.0], (0.0, 1.0), 0.5).expect("problem");
        let result = Simulator::default()
            .solve_with_sensitivities(&Decay, &problem, &[0.7])
            .expect("sensitivity solve");
        for (k, &t) in result.trajectory.times.iter().enumerate() {
            let x = 2.0 * (-0.7 * t).exp();
            assert!((result.sensitivity(k, 0, 0) + t * x).abs() < 1e-6);
        }
    }

    #[test]
    fn sensitivity_solve_reproduces_plain_trajectory() {
        let problem =
            InitialValueProblem::uniformly_sampled(vec![1.0], (0.0, 3.0), 0.1).expect("problem");
        let simulator = Simulator::default();
        let plain = simulator.solve(&Decay, &problem, &[0.9]).expect("plain");
        let sens = simulator
            .solve_with_sensitivities(&Decay, &problem, &[0.9])
            .expect("sensitivity");
        assert_eq!(plain, sens.trajectory);
    }

    #[test]
    fn blowup_surfaces_integration_failure() {
        let problem =
            InitialValueProblem::uniformly_sampled(vec![1.0], (0.0, 2.0), 0.5).expect("problem");
        let err = Simulator::default()
            .solve(&Blowup, &problem, &[])
            .expect_err("integration should fail");
        assert!(matches!(err, UdeError::Integration { .. }), "got {err}");
    }

    #[test]
    fn solve_rejects_mismatched_parameters() {
        let problem =
            InitialValueProblem::uniformly_sampled(vec![1.0], (0.0, 1.0), 0.5).expect("problem");
        assert_err_contains(
            Simulator::default().solve(&Decay, &problem, &[1.0, 2.0]),
            "parameter dimension mismatch",
        );
    }

    #[test]
    fn settings_validation_rejects_bad_tolerances() {
        let settings = SolverSettings {
            rtol: 0.0,
            ..SolverSettings::default()
        };
        assert_err_contains(Simulator::new(settings), "rtol and atol");
        let settings = SolverSettings {
            max_steps: 0,
            ..SolverSettings::default()
        };
        assert_err_contains(Simulator::new(settings), "max_steps");
    }
}
