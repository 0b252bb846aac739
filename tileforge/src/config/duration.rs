//! Human-readable duration parsing (e.g. "10s", "2m", "500ms").

use std::time::Duration;

/// Parse a duration string. Supports `ms`, `s`, `m`, `h` suffixes; a bare
/// number is seconds. Case-insensitive, whitespace tolerant.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let lower = s.to_ascii_lowercase();
    let (number, unit_ms) = if let Some(n) = lower.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = lower.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = lower.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (lower.as_str(), 1_000)
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("cannot parse duration '{}'", s))?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration '{}' overflows", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixes() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_bare_number_is_seconds() {
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
    }

    #[test]
    fn test_tolerates_case_and_whitespace() {
        assert_eq!(parse_duration(" 10S ").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }
}
