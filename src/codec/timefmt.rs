//! Compact digit-string timestamps.
//!
//! Trackers report time as a run of decimal digits, `YYYYMMDDHHMMSS` or the
//! century-less `YYMMDDHHMMSS`, always UTC. Device clocks drift and some
//! units report garbage after a battery reset, so anything unparsable or
//! further than [`MAX_SKEW_SECS`] from the gateway clock is replaced with
//! the arrival time.

use chrono::{DateTime, NaiveDate, Utc};

/// Reports further than this from "now" are treated as clock garbage.
pub const MAX_SKEW_SECS: i64 = 15 * 60;

/// Parse a compact digit timestamp into epoch milliseconds.
///
/// 12-digit input is given a `20` century prefix. Falls back to `now` on
/// any parse failure or excessive skew.
pub fn parse_compact_utc(digits: &str) -> i64 {
    let now = Utc::now();
    match parse_strict(digits) {
        Some(t) if (t.timestamp() - now.timestamp()).abs() <= MAX_SKEW_SECS => {
            t.timestamp_millis()
        }
        _ => now.timestamp_millis(),
    }
}

fn parse_strict(digits: &str) -> Option<DateTime<Utc>> {
    let full;
    let d = match digits.len() {
        14 => digits,
        12 => {
            full = format!("20{digits}");
            &full
        }
        _ => return None,
    };
    if !d.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let num = |r: std::ops::Range<usize>| d[r].parse::<u32>().ok();
    let date = NaiveDate::from_ymd_opt(num(0..4)? as i32, num(4..6)?, num(6..8)?)?;
    let time = date.and_hms_opt(num(8..10)?, num(10..12)?, num(12..14)?)?;
    Some(time.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_current_time_exact() {
        let now = Utc::now().with_nanosecond(0).unwrap();
        let digits = now.format("%Y%m%d%H%M%S").to_string();
        assert_eq!(parse_compact_utc(&digits), now.timestamp_millis());
    }

    #[test]
    fn test_parse_twelve_digit_gets_century() {
        let now = Utc::now().with_nanosecond(0).unwrap();
        let digits = now.format("%y%m%d%H%M%S").to_string();
        assert_eq!(digits.len(), 12);
        assert_eq!(parse_compact_utc(&digits), now.timestamp_millis());
    }

    #[test]
    fn test_stale_clock_clamps_to_now() {
        let before = Utc::now().timestamp_millis();
        let got = parse_compact_utc("20150612193050");
        let after = Utc::now().timestamp_millis();
        assert!(got >= before && got <= after);
    }

    #[test]
    fn test_garbage_clamps_to_now() {
        let before = Utc::now().timestamp_millis();
        assert!(parse_compact_utc("not-a-time-at-all") >= before);
        assert!(parse_compact_utc("1234") >= before);
        assert!(parse_compact_utc("20159999999999") >= before);
    }
}
