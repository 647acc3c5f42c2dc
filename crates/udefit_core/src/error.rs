use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, UdeError>;

/// Failures surfaced by simulation, differentiation and training.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum UdeError {
    /// The integrator could not complete the requested interval.
    #[error("integration failed at t = {t}: {reason}")]
    Integration { t: f64, reason: String },

    /// Sensitivities or gradient components were not finite.
    #[error("gradient computation failed: {0}")]
    Gradient(String),

    #[error("{what} dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("invalid time grid: {0}")]
    InvalidTimeGrid(String),

    /// Parse or compile failure in the equation engine.
    #[error("equation error: {0}")]
    Equation(String),
}

impl UdeError {
    pub fn integration(t: f64, reason: impl Into<String>) -> Self {
        UdeError::Integration {
            t,
            reason: reason.into(),
        }
    }

    /// True for failures that belong to a single candidate parameter vector
    /// rather than to the configuration of the run.
    pub fn is_candidate_failure(&self) -> bool {
        matches!(self, UdeError::Integration { .. } | UdeError::Gradient(_))
    }
}

/// Checks that a slice has the length a model or problem expects.
pub fn ensure_dimension(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(UdeError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_error_formats_time_and_reason() {
        let err = UdeError::integration(2.5, "step size collapsed");
        assert_eq!(
            format!("{err}"),
            "integration failed at t = 2.5: step size collapsed"
        );
        assert!(err.is_candidate_failure());
    }

    #[test]
    fn ensure_dimension_reports_mismatch() {
        assert!(ensure_dimension("parameter", 4, 4).is_ok());
        let err = ensure_dimension("parameter", 4, 3).expect_err("expected mismatch");
        assert_eq!(
            format!("{err}"),
            "parameter dimension mismatch: expected 4, got 3"
        );
        assert!(!err.is_candidate_failure());
    }
}
