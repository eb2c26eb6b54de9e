//! NMEA-style coordinate fields.
//!
//! Delimited-text trackers report latitude as `ddmm.mmmm` (9 chars) and
//! longitude as `dddmm.mmmm` (10 chars): whole degrees followed by decimal
//! minutes.

/// Parse a 9-character `ddmm.mmmm` latitude into decimal degrees.
pub fn parse_latitude(field: &str) -> Option<f64> {
    if field.len() != 9 {
        return None;
    }
    let deg: f64 = field[..2].parse().ok()?;
    let min: f64 = field[2..].parse().ok()?;
    Some(deg + min / 60.0)
}

/// Parse a 10-character `dddmm.mmmm` longitude into decimal degrees.
pub fn parse_longitude(field: &str) -> Option<f64> {
    if field.len() != 10 {
        return None;
    }
    let deg: f64 = field[..3].parse().ok()?;
    let min: f64 = field[3..].parse().ok()?;
    Some(deg + min / 60.0)
}

/// Format decimal degrees the way the storage layer expects (6 decimals).
pub fn format_degrees(v: f64) -> String {
    format!("{v:.6}")
}
