//! Human-readable sizes for progress output.

const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

/// Format a byte count with one decimal place, e.g. `1.5 GB`. Units are
/// powers of 1024.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
