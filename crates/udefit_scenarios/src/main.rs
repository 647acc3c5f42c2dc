//! Fits Lotka-Volterra models to noisy synthetic data.
//!
//! Every scenario runs once per noise magnitude and writes
//! `results/{scenario}_noise_{magnitude}.json`. Log verbosity follows
//! `RUST_LOG` (default `info`).

mod results;
mod scenarios;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

const RESULTS_DIR: &str = "results";
const NOISE_MAGNITUDES: [f64; 3] = [0.0, 0.05, 0.1];

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dir = Path::new(RESULTS_DIR);
    for noise in NOISE_MAGNITUDES {
        let report = scenarios::run_parameter_fit(noise)
            .with_context(|| format!("parameter fit failed at noise magnitude {noise}"))?;
        let path = results::write(dir, &report)?;
        info!(path = %path.display(), "wrote results");

        let report = scenarios::run_missing_physics(noise)
            .with_context(|| format!("missing-physics fit failed at noise magnitude {noise}"))?;
        let path = results::write(dir, &report)?;
        info!(path = %path.display(), "wrote results");
    }
    Ok(())
}
