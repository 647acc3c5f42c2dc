use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use udefit_core::training::{LossTrace, PhaseReport};

/// Fitted and true trajectories beyond the training span.
#[derive(Debug, Clone, Serialize)]
pub struct Extrapolation {
    pub times: Vec<f64>,
    pub truth: Vec<Vec<f64>>,
    pub fitted: Vec<Vec<f64>>,
}

/// Learned network output next to the term it replaces, sampled along the
/// fitted trajectory.
#[derive(Debug, Clone, Serialize)]
pub struct MissingTerm {
    pub states: Vec<[f64; 2]>,
    pub learned: Vec<[f64; 2]>,
    pub truth: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub model: String,
    pub noise_magnitude: f64,
    pub seed: u64,
    pub parameter_names: Vec<String>,
    pub true_parameters: Vec<f64>,
    pub initial_parameters: Vec<f64>,
    pub fitted_parameters: Vec<f64>,
    pub initial_loss: f64,
    pub final_loss: f64,
    pub times: Vec<f64>,
    pub reference: Vec<Vec<f64>>,
    pub observations: Vec<Vec<f64>>,
    pub fitted: Vec<Vec<f64>>,
    pub trace: LossTrace,
    pub phases: Vec<PhaseReport>,
    pub extrapolation: Option<Extrapolation>,
    pub missing_term: Option<MissingTerm>,
}

impl ScenarioReport {
    pub fn file_name(&self) -> String {
        format!("{}_noise_{}.json", self.scenario, self.noise_magnitude)
    }
}

/// Writes `report` under `dir`, creating the directory if needed.
pub fn write(dir: &Path, report: &ScenarioReport) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create results directory {}", dir.display()))?;
    let path = dir.join(report.file_name());
    let file = File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)
        .with_context(|| format!("failed to serialize results to {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(path)
}
