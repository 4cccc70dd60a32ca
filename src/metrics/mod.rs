//! Metric value types produced by a poll cycle.
//!
//! A successful poll yields a [`MetricSnapshot`] holding one [`DeviceMetrics`]
//! per physical GPU; a failed poll yields a [`PollError`]. Both are immutable
//! value objects created fresh per poll. Numeric fields the tool could not
//! report are `None` rather than a magic number.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::parser::ParseError;
use crate::runner::RunError;

/// Metrics for a single physical GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// Device index as reported by the tool, unique within a snapshot
    pub index: u32,
    /// Display name of the device
    pub name: String,
    /// Core temperature in Celsius
    pub temperature_c: Option<i64>,
    /// Core utilization percentage (0-100)
    pub utilization_pct: Option<u8>,
    /// Used framebuffer memory in MiB
    pub memory_used_mb: Option<u64>,
    /// Total framebuffer memory in MiB
    pub memory_total_mb: Option<u64>,
    /// Power draw in watts
    pub power_w: Option<f64>,
}

impl DeviceMetrics {
    /// Creates a record with every metric field unavailable.
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            temperature_c: None,
            utilization_pct: None,
            memory_used_mb: None,
            memory_total_mb: None,
            power_w: None,
        }
    }

    /// Returns memory usage as a percentage (0-100).
    ///
    /// Yields 0.0 when either side of the ratio is unavailable.
    pub fn memory_percent(&self) -> f64 {
        match (self.memory_used_mb, self.memory_total_mb) {
            (Some(used), Some(total)) if total > 0 => (used as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// Returns true when both memory readings are present.
    pub fn has_memory(&self) -> bool {
        self.memory_used_mb.is_some() && self.memory_total_mb.is_some()
    }
}

/// One complete set of per-device metrics from a single poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Capture time
    pub timestamp: SystemTime,
    /// Per-device metrics, in the tool's output order (ascending index)
    pub devices: Vec<DeviceMetrics>,
    /// The raw tool output this snapshot was parsed from, kept for display
    pub raw_output: String,
}

impl MetricSnapshot {
    /// Creates a snapshot stamped with the current time.
    pub fn new(devices: Vec<DeviceMetrics>, raw_output: impl Into<String>) -> Self {
        Self { timestamp: SystemTime::now(), devices, raw_output: raw_output.into() }
    }

    /// Number of devices captured in this snapshot.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Looks up a device by its tool-reported index.
    pub fn device(&self, index: u32) -> Option<&DeviceMetrics> {
        self.devices.iter().find(|d| d.index == index)
    }

    /// Renders the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Classification of a failed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollErrorKind {
    /// The diagnostic tool executable could not be invoked
    ToolNotFound,
    /// The tool did not finish within the deadline
    ToolTimeout,
    /// The tool ran but exited with a non-zero status
    ToolNonZeroExit,
    /// The tool produced output with no usable device records
    ParseFailure,
}

impl fmt::Display for PollErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollErrorKind::ToolNotFound => write!(f, "tool not found"),
            PollErrorKind::ToolTimeout => write!(f, "tool timed out"),
            PollErrorKind::ToolNonZeroExit => write!(f, "tool exited with an error"),
            PollErrorKind::ParseFailure => write!(f, "output could not be parsed"),
        }
    }
}

/// A failed poll, delivered to subscribers as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollError {
    /// What went wrong
    pub kind: PollErrorKind,
    /// Captured tool output, possibly empty, kept for diagnostic display
    pub raw_output: String,
    /// Human-readable failure detail
    pub message: String,
}

impl PollError {
    pub(crate) fn from_run(err: RunError) -> Self {
        let kind = match &err {
            RunError::NotFound | RunError::Spawn(_) => PollErrorKind::ToolNotFound,
            RunError::Timeout { .. } => PollErrorKind::ToolTimeout,
            RunError::NonZeroExit { .. } => PollErrorKind::ToolNonZeroExit,
        };
        let raw_output = match &err {
            RunError::NonZeroExit { output, .. } => output.clone(),
            _ => String::new(),
        };
        Self { kind, raw_output, message: err.to_string() }
    }

    pub(crate) fn from_parse(err: ParseError, raw_output: String) -> Self {
        Self { kind: PollErrorKind::ParseFailure, raw_output, message: err.to_string() }
    }
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sample_device() -> DeviceMetrics {
        DeviceMetrics {
            index: 0,
            name: "NVIDIA A100".to_string(),
            temperature_c: Some(45),
            utilization_pct: Some(12),
            memory_used_mb: Some(1024),
            memory_total_mb: Some(40960),
            power_w: Some(70.5),
        }
    }

    #[test]
    fn memory_percent_is_a_ratio_of_present_fields() {
        let mut device = sample_device();
        device.memory_used_mb = Some(4096);
        device.memory_total_mb = Some(8192);
        assert!((device.memory_percent() - 50.0).abs() < f64::EPSILON);

        device.memory_total_mb = None;
        assert_eq!(device.memory_percent(), 0.0);

        device.memory_total_mb = Some(0);
        assert_eq!(device.memory_percent(), 0.0);
    }

    #[test]
    fn snapshot_lookup_by_device_index() {
        let mut second = sample_device();
        second.index = 1;
        second.name = "NVIDIA A100 (1)".to_string();
        let snapshot = MetricSnapshot::new(vec![sample_device(), second], "");

        assert_eq!(snapshot.device_count(), 2);
        assert_eq!(snapshot.device(1).unwrap().name, "NVIDIA A100 (1)");
        assert!(snapshot.device(7).is_none());
    }

    #[test]
    fn snapshot_serialises_to_json() {
        let snapshot = MetricSnapshot::new(vec![sample_device()], "0, NVIDIA A100, ...");
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("NVIDIA A100"));
        assert!(json.contains("memory_total_mb"));
    }

    #[test]
    fn run_errors_map_to_the_expected_kinds() {
        let err = PollError::from_run(RunError::NotFound);
        assert_eq!(err.kind, PollErrorKind::ToolNotFound);
        assert!(err.raw_output.is_empty());

        let err = PollError::from_run(RunError::Timeout { timeout: Duration::from_secs(5) });
        assert_eq!(err.kind, PollErrorKind::ToolTimeout);

        let status = std::process::Command::new("false").status().unwrap();
        let err = PollError::from_run(RunError::NonZeroExit {
            status,
            output: "NVIDIA-SMI has failed".to_string(),
        });
        assert_eq!(err.kind, PollErrorKind::ToolNonZeroExit);
        assert_eq!(err.raw_output, "NVIDIA-SMI has failed");
    }

    #[test]
    fn parse_errors_keep_the_raw_output() {
        let err = PollError::from_parse(ParseError::NoValidRecords, "garbage".to_string());
        assert_eq!(err.kind, PollErrorKind::ParseFailure);
        assert_eq!(err.raw_output, "garbage");
        assert!(!err.message.is_empty());
    }
}
