pub mod commands;
pub mod runtime;

use chronicle_core::{Timestamp, LIFE_OPEN};

pub use runtime::Runtime;

/// Accepts epoch milliseconds or an RFC 3339 instant.
pub fn parse_instant(raw: &str) -> Result<Timestamp, String> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("'{raw}' is neither epoch millis nor RFC 3339: {e}"))
}

pub fn format_instant(ts: Timestamp) -> String {
    if ts == LIFE_OPEN {
        return "open".to_string();
    }
    match chrono::DateTime::from_timestamp_millis(ts) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        None => ts.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instants_parse_from_millis_or_rfc3339() {
        assert_eq!(parse_instant("1500"), Ok(1500));
        assert_eq!(parse_instant("1970-01-01T00:00:02Z"), Ok(2000));
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn open_end_is_printed_as_open() {
        assert_eq!(format_instant(LIFE_OPEN), "open");
        assert_eq!(format_instant(0), "1970-01-01T00:00:00Z");
    }
}
