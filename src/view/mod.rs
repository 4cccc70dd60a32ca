//! Text rendering for the three presentation views.
//!
//! The windowing layer proper (widgets, tabs, buttons) lives outside this
//! crate; what it binds to is here: plain-text renderings of a snapshot for
//! the summary and detailed views, and a [`ViewModel`] that subscribes to a
//! poller, keeps the last-known-good snapshot, and serves all three view
//! texts plus a status line.

use std::fmt;

use parking_lot::RwLock;

use crate::metrics::{MetricSnapshot, PollError};
use crate::poller::Subscriber;

/// Temperature at or above which a device reading is flagged as high.
pub const TEMP_HIGH_C: i64 = 80;

/// Temperature at or above which a device reading is flagged as warm.
pub const TEMP_WARM_C: i64 = 70;

/// Display classification for a device temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureLevel {
    Nominal,
    Warm,
    High,
    /// No reading available
    Unknown,
}

impl TemperatureLevel {
    pub fn classify(temperature_c: Option<i64>) -> Self {
        match temperature_c {
            None => TemperatureLevel::Unknown,
            Some(t) if t >= TEMP_HIGH_C => TemperatureLevel::High,
            Some(t) if t >= TEMP_WARM_C => TemperatureLevel::Warm,
            Some(_) => TemperatureLevel::Nominal,
        }
    }
}

impl fmt::Display for TemperatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemperatureLevel::Nominal => write!(f, "nominal"),
            TemperatureLevel::Warm => write!(f, "warm"),
            TemperatureLevel::High => write!(f, "high"),
            TemperatureLevel::Unknown => write!(f, "unknown"),
        }
    }
}

const NO_DATA: &str = "No GPU data available";

fn fmt_opt<T: fmt::Display>(value: Option<T>, unit: &str) -> String {
    match value {
        Some(v) => format!("{v}{unit}"),
        None => "N/A".to_string(),
    }
}

/// Renders the compact per-device text for the summary view.
pub fn render_summary(snapshot: &MetricSnapshot) -> String {
    if snapshot.devices.is_empty() {
        return NO_DATA.to_string();
    }

    let mut out = String::from("GPU Summary:\n");
    out.push_str(&"=".repeat(50));
    out.push_str("\n\n");
    for device in &snapshot.devices {
        out.push_str(&format!("GPU {}: {}\n", device.index, device.name));
        out.push_str(&format!("  Temperature: {}\n", fmt_opt(device.temperature_c, "°C")));
        out.push_str(&format!("  Utilization: {}\n", fmt_opt(device.utilization_pct, "%")));
        out.push_str(&format!(
            "  Memory: {} / {}\n",
            fmt_opt(device.memory_used_mb, "MB"),
            fmt_opt(device.memory_total_mb, "MB")
        ));
        out.push_str(&format!("  Power: {}\n\n", fmt_opt(device.power_w, "W")));
    }
    out
}

/// Renders the verbose per-device text for the detailed view.
pub fn render_detailed(snapshot: &MetricSnapshot) -> String {
    if snapshot.devices.is_empty() {
        return NO_DATA.to_string();
    }

    let mut out = String::new();
    for device in &snapshot.devices {
        let level = TemperatureLevel::classify(device.temperature_c);
        out.push_str(&format!("GPU {}: {}\n", device.index, device.name));
        out.push_str(&format!(
            "  Temperature:  {} ({level})\n",
            fmt_opt(device.temperature_c, "°C")
        ));
        out.push_str(&format!("  Utilization:  {}\n", fmt_opt(device.utilization_pct, "%")));
        out.push_str(&format!(
            "  Memory:       {} / {} ({:.0}%)\n",
            fmt_opt(device.memory_used_mb, " MB"),
            fmt_opt(device.memory_total_mb, " MB"),
            device.memory_percent()
        ));
        out.push_str(&format!("  Power draw:   {}\n\n", fmt_opt(device.power_w, " W")));
    }
    out
}

/// Last-known-good cache backing the three views.
///
/// Register an `Arc<ViewModel>` with a poller and read the rendered texts
/// from the presentation thread at any time. A failed poll updates the
/// status and raw text but never the last-known-good snapshot.
#[derive(Default)]
pub struct ViewModel {
    last_snapshot: RwLock<Option<MetricSnapshot>>,
    last_error: RwLock<Option<PollError>>,
    last_raw: RwLock<Option<String>>,
}

impl ViewModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text for the summary view, rendered from the last good snapshot.
    pub fn summary_text(&self) -> String {
        match &*self.last_snapshot.read() {
            Some(snapshot) => render_summary(snapshot),
            None => NO_DATA.to_string(),
        }
    }

    /// Text for the detailed view, rendered from the last good snapshot.
    pub fn detailed_text(&self) -> String {
        match &*self.last_snapshot.read() {
            Some(snapshot) => render_detailed(snapshot),
            None => "No detailed data available".to_string(),
        }
    }

    /// Raw tool output from the most recent completed poll, good or failed.
    pub fn raw_text(&self) -> String {
        match &*self.last_raw.read() {
            Some(raw) => raw.clone(),
            None => "No raw data available".to_string(),
        }
    }

    /// One-line status reflecting the most recent poll.
    pub fn status_line(&self) -> String {
        if let Some(error) = &*self.last_error.read() {
            return format!("Last poll failed: {error}");
        }
        match &*self.last_snapshot.read() {
            Some(snapshot) => format!("Monitoring {} device(s)", snapshot.device_count()),
            None => "Ready".to_string(),
        }
    }

    /// The retained snapshot, if any poll has succeeded yet.
    pub fn last_known_good(&self) -> Option<MetricSnapshot> {
        self.last_snapshot.read().clone()
    }
}

impl Subscriber for ViewModel {
    fn on_snapshot(&self, snapshot: &MetricSnapshot) {
        *self.last_raw.write() = Some(snapshot.raw_output.clone());
        *self.last_snapshot.write() = Some(snapshot.clone());
        *self.last_error.write() = None;
    }

    fn on_error(&self, error: &PollError) {
        *self.last_raw.write() = Some(error.raw_output.clone());
        *self.last_error.write() = Some(error.clone());
    }
}
