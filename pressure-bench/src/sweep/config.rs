//! Sweep profile configuration.

use std::path::{Path, PathBuf};

use clap::Args;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pressure profile for one sweep: ascending steps, then descending steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Setpoints visited in the ascending phase, in order
    pub increasing_steps: Vec<f64>,
    /// Setpoints visited in the descending phase, in order
    pub decreasing_steps: Vec<f64>,
    /// Maximum |measured - target| accepted at each setpoint
    pub tolerance_absolute: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            increasing_steps: vec![5.0, 10.0, 15.0, 20.0, 25.0],
            decreasing_steps: vec![20.0, 15.0, 10.0, 5.0],
            tolerance_absolute: 0.5,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SweepConfigError {
    #[error("sweep has no increasing steps")]
    MissingIncreasingSteps,

    #[error("sweep has no decreasing steps")]
    MissingDecreasingSteps,

    #[error("{phase} step {index} has invalid pressure {value}")]
    InvalidPressure {
        phase: &'static str,
        index: usize,
        value: f64,
    },

    #[error("tolerance must be positive, got {0}")]
    InvalidTolerance(f64),
}

impl SweepConfig {
    pub fn total_steps(&self) -> usize {
        self.increasing_steps.len() + self.decreasing_steps.len()
    }

    /// Both phases must be non-empty and every setpoint finite and non-negative.
    pub fn validate(&self) -> Result<(), SweepConfigError> {
        if self.increasing_steps.is_empty() {
            return Err(SweepConfigError::MissingIncreasingSteps);
        }
        if self.decreasing_steps.is_empty() {
            return Err(SweepConfigError::MissingDecreasingSteps);
        }

        let phases = [
            ("increasing", &self.increasing_steps),
            ("decreasing", &self.decreasing_steps),
        ];
        for (phase, steps) in phases {
            for (index, &value) in steps.iter().enumerate() {
                if !value.is_finite() || value < 0.0 {
                    return Err(SweepConfigError::InvalidPressure {
                        phase,
                        index,
                        value,
                    });
                }
            }
        }

        if !self.tolerance_absolute.is_finite() || self.tolerance_absolute <= 0.0 {
            return Err(SweepConfigError::InvalidTolerance(self.tolerance_absolute));
        }
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Command-line arguments describing the sweep profile.
///
/// Use with `#[command(flatten)]` in your CLI args struct.
#[derive(Args, Debug, Clone)]
pub struct SweepArgs {
    #[arg(
        long,
        help = "JSON sweep profile file",
        long_help = "Path to a JSON file with `increasing_steps`, `decreasing_steps` and \
            `tolerance_absolute`. When given, the step and tolerance flags are ignored."
    )]
    pub profile: Option<PathBuf>,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "5,10,15,20,25",
        help = "Comma-separated ascending setpoints"
    )]
    pub increasing: Vec<f64>,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "20,15,10,5",
        help = "Comma-separated descending setpoints"
    )]
    pub decreasing: Vec<f64>,

    #[arg(
        long,
        default_value = "0.5",
        help = "Accepted deviation of the reference from each setpoint",
        long_help = "Maximum absolute difference between the pressure reference reading and \
            the commanded setpoint after it settles. A larger deviation fails the session."
    )]
    pub tolerance: f64,
}

impl SweepArgs {
    /// Build and validate the sweep configuration.
    pub fn to_config(&self) -> anyhow::Result<SweepConfig> {
        let config = match &self.profile {
            Some(path) => SweepConfig::load_from_file(path)
                .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?,
            None => SweepConfig {
                increasing_steps: self.increasing.clone(),
                decreasing_steps: self.decreasing.clone(),
                tolerance_absolute: self.tolerance,
            },
        };
        config.validate()?;
        Ok(config)
    }
}
