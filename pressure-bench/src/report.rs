//! Per-sensor calibration records and where they are stored.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::sweep::{Phase, SweepConfig};

/// Readings taken once a sweep step has settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMeasurement {
    pub index: usize,
    pub phase: Phase,
    /// Commanded setpoint
    pub nominal: f64,
    /// Pressure reference reading
    pub reference: f64,
    /// Sensor reading, if the sensor answered
    pub sensor: Option<f64>,
}

impl StepMeasurement {
    /// Sensor minus reference.
    pub fn deviation(&self) -> Option<f64> {
        self.sensor.map(|sensor| sensor - self.reference)
    }
}

/// Calibration result for one sensor over one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub device_id: String,
    pub display_name: String,
    pub firmware_version: Option<String>,
    pub reference_identity: String,
    pub sweep: SweepConfig,
    pub steps: Vec<StepMeasurement>,
}

impl CalibrationRecord {
    /// Largest |sensor - reference| over all answered steps.
    pub fn max_deviation(&self) -> Option<f64> {
        self.steps
            .iter()
            .filter_map(StepMeasurement::deviation)
            .map(f64::abs)
            .reduce(f64::max)
    }

    /// Descending minus ascending sensor reading at each setpoint visited in both phases.
    pub fn hysteresis(&self) -> Vec<(f64, f64)> {
        let rising = self.steps.iter().filter(|s| s.phase == Phase::Increasing);
        rising
            .filter_map(|up| {
                let down = self
                    .steps
                    .iter()
                    .find(|s| s.phase == Phase::Decreasing && s.nominal == up.nominal)?;
                Some((up.nominal, down.sensor? - up.sensor?))
            })
            .collect()
    }

    pub fn answered_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.sensor.is_some()).count()
    }
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serializing record for {device_id}: {source}")]
    Serialize {
        device_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Destination for finished calibration records.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, record: &CalibrationRecord) -> Result<(), ReportError>;
}

/// Writes one pretty-printed JSON file per sensor into a directory.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a record for `device_id` is written to.
    pub fn path_for(&self, device_id: &str) -> PathBuf {
        let stem: String = device_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("calibration_{stem}.json"))
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn store(&self, record: &CalibrationRecord) -> Result<(), ReportError> {
        let path = self.path_for(&record.device_id);
        let json =
            serde_json::to_string_pretty(record).map_err(|source| ReportError::Serialize {
                device_id: record.device_id.clone(),
                source,
            })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| ReportError::Io {
                path: self.dir.clone(),
                source,
            })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|source| ReportError::Io {
                path: path.clone(),
                source,
            })?;

        info!("Saved calibration for {} to {}", record.device_id, path.display());
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<CalibrationRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CalibrationRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn store(&self, record: &CalibrationRecord) -> Result<(), ReportError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
