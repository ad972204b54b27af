//! Normalized printer status.
//!
//! Every adapter folds its protocol-specific status document into this shape
//! before publishing it, so downstream consumers never see wire formats.

use serde::{Deserialize, Serialize};

/// Connectivity and job flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFlags {
    pub connected: bool,
    pub operational: bool,
    pub printing: bool,
    pub paused: bool,
    pub error: bool,
    pub ready: bool,
}

/// One heater reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    /// Heater name (`tool0`, `bed`, `chamber`)
    pub name: String,
    pub actual: Option<f64>,
    pub target: Option<f64>,
}

impl TemperatureReading {
    pub fn new(name: impl Into<String>, actual: Option<f64>, target: Option<f64>) -> Self {
        Self {
            name: name.into(),
            actual,
            target,
        }
    }
}

/// Progress of the active job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub file_name: Option<String>,
    /// Completion in percent (0-100)
    pub completion: Option<f64>,
    /// Seconds spent printing
    pub print_time: Option<u64>,
    /// Estimated seconds remaining
    pub print_time_left: Option<u64>,
}

/// Current status of one printer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterStatus {
    /// Human-readable state text as reported by the device
    pub state_text: String,
    pub flags: StatusFlags,
    pub temperatures: Vec<TemperatureReading>,
    pub progress: Option<JobProgress>,
    /// Unix millis when the update was received
    pub received_at: i64,
}

impl PrinterStatus {
    /// Create a status stamped with the current time.
    pub fn new(state_text: impl Into<String>) -> Self {
        Self {
            state_text: state_text.into(),
            received_at: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// Add a heater reading, skipping heaters that report nothing.
    pub fn with_temperature(
        mut self,
        name: impl Into<String>,
        actual: Option<f64>,
        target: Option<f64>,
    ) -> Self {
        if actual.is_some() || target.is_some() {
            self.temperatures
                .push(TemperatureReading::new(name, actual, target));
        }
        self
    }

    /// Look up a heater reading by name.
    pub fn temperature(&self, name: &str) -> Option<&TemperatureReading> {
        self.temperatures.iter().find(|t| t.name == name)
    }

    /// Name of the file the device is printing or last printed, if any.
    pub fn job_file(&self) -> Option<&str> {
        self.progress
            .as_ref()
            .and_then(|p| p.file_name.as_deref())
            .filter(|name| !name.is_empty())
    }
}
