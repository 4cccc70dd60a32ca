//! Parsing of the tool's delimited query output.
//!
//! The query mode emits one comma-separated line per device with exactly the
//! seven fields the runner requests, no header row and no units. Parsing is
//! deliberately tolerant: a field the tool reports as `N/A` (or any other
//! unparseable token) becomes the unavailable sentinel for that field, and a
//! malformed line drops only that record. The whole poll fails only when not
//! a single line parses.

use tracing::warn;

use crate::metrics::DeviceMetrics;
use crate::runner::QUERY_FIELDS;

/// Number of fields expected per device line.
pub const FIELD_COUNT: usize = QUERY_FIELDS.len();

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("no valid device records in tool output")]
    NoValidRecords,
}

/// Parses raw query output into per-device records, preserving line order.
///
/// Blank lines are skipped. Lines with the wrong field count, or whose index
/// field is not a non-negative integer, are dropped with a warning.
pub fn parse(raw: &str) -> Result<Vec<DeviceMetrics>, ParseError> {
    let mut devices = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(device) => devices.push(device),
            None => warn!("dropping malformed device record: {line:?}"),
        }
    }

    if devices.is_empty() {
        return Err(ParseError::NoValidRecords);
    }
    Ok(devices)
}

fn parse_line(line: &str) -> Option<DeviceMetrics> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return None;
    }

    // A record without a device index is not addressable at all.
    let index = fields[0].parse::<u32>().ok()?;

    let mut device = DeviceMetrics::new(index, fields[1]);
    device.temperature_c = parse_field::<i64>(fields[2]);
    device.utilization_pct = parse_field::<u8>(fields[3]).filter(|pct| *pct <= 100);
    device.memory_used_mb = parse_field::<u64>(fields[4]);
    device.memory_total_mb = parse_field::<u64>(fields[5]);
    device.power_w = parse_field::<f64>(fields[6]).filter(|w| *w >= 0.0);

    // A reversed pair means at least one of the two numbers is wrong, with no
    // way to tell which; neither is trustworthy.
    if let (Some(used), Some(total)) = (device.memory_used_mb, device.memory_total_mb) {
        if used > total {
            warn!("device {index}: used memory {used} MiB exceeds total {total} MiB, flagging both unavailable");
            device.memory_used_mb = None;
            device.memory_total_mb = None;
        }
    }

    Some(device)
}

/// The tool reports unavailable numerics as `N/A`, `[N/A]` or
/// `[Not Supported]`; anything that fails to parse maps to the sentinel.
fn parse_field<T: std::str::FromStr>(field: &str) -> Option<T> {
    field.parse::<T>().ok()
}
