use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Duration;

/// Parses a duration string in the format "500ms", "30s", "10m", "5h", "3d".
///
/// Supported units:
/// - `ms` for milliseconds
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
/// - `d` for days
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    let Some(unit_char) = s.chars().last() else {
        return Err("Duration string cannot be empty".to_string());
    };

    if let Some(value_str) = s.strip_suffix("ms") {
        return parse_value(value_str).map(Duration::from_millis);
    }

    let value_str = &s[..s.len() - unit_char.len_utf8()];
    let value = parse_value(value_str)?;

    let seconds_per_unit: u64 = match unit_char {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => {
            return Err(format!(
                "Unknown duration unit: '{}'. Use 'ms', 's', 'm', 'h', or 'd'.",
                unit_char
            ))
        }
    };

    value
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("Duration value too large: '{}'", s))
}

fn parse_value(value_str: &str) -> Result<u64, String> {
    u64::from_str(value_str)
        .map_err(|_| format!("Invalid numeric value in duration: '{}'", value_str))
}

/// Current wall-clock time as a Unix timestamp in microseconds.
pub fn unix_micros_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}

/// Microseconds in `d`, saturating at `i64::MAX`.
pub fn duration_micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- parse_duration_string tests ---

    mod duration {
        use super::*;

        #[test]
        fn parse_minutes() {
            assert_eq!(
                parse_duration_string("10m").unwrap(),
                Duration::from_secs(600)
            );
        }

        #[test]
        fn parse_hours() {
            assert_eq!(
                parse_duration_string("5h").unwrap(),
                Duration::from_secs(18000)
            );
        }

        #[test]
        fn parse_days() {
            assert_eq!(
                parse_duration_string("3d").unwrap(),
                Duration::from_secs(259200)
            );
        }

        #[test]
        fn parse_one_minute() {
            assert_eq!(
                parse_duration_string("1m").unwrap(),
                Duration::from_secs(60)
            );
        }

        #[test]
        fn parse_zero_minutes() {
            assert_eq!(parse_duration_string("0m").unwrap(), Duration::from_secs(0));
        }

        #[test]
        fn parse_large_value() {
            assert_eq!(
                parse_duration_string("365d").unwrap(),
                Duration::from_secs(365 * 86400)
            );
        }

        #[test]
        fn overflowing_value_errors() {
            let err = parse_duration_string("999999999999999999d").unwrap_err();
            assert!(err.contains("too large"), "unexpected error: {}", err);
            assert!(parse_duration_string("18446744073709551615h").is_err());
            assert_eq!(
                parse_duration_string("18446744073709551615s").unwrap(),
                Duration::from_secs(u64::MAX)
            );
        }

        #[test]
        fn trims_whitespace() {
            assert_eq!(
                parse_duration_string("  10m  ").unwrap(),
                Duration::from_secs(600)
            );
        }

        #[test]
        fn empty_string_errors() {
            let err = parse_duration_string("").unwrap_err();
            assert!(err.contains("empty"), "error was: {}", err);
        }

        #[test]
        fn whitespace_only_errors() {
            let err = parse_duration_string("   ").unwrap_err();
            assert!(err.contains("empty"), "error was: {}", err);
        }

        #[test]
        fn unknown_suffix_errors() {
            let err = parse_duration_string("10x").unwrap_err();
            assert!(err.contains("Unknown duration unit"), "error was: {}", err);
        }

        #[test]
        fn parse_milliseconds() {
            assert_eq!(
                parse_duration_string("250ms").unwrap(),
                Duration::from_millis(250)
            );
        }

        #[test]
        fn multibyte_suffix_errors() {
            let err = parse_duration_string("5µ").unwrap_err();
            assert!(err.contains("Unknown duration unit"), "error was: {}", err);
        }

        #[test]
        fn parse_seconds() {
            assert_eq!(
                parse_duration_string("30s").unwrap(),
                Duration::from_secs(30)
            );
        }

        #[test]
        fn no_suffix_errors() {
            let err = parse_duration_string("10").unwrap_err();
            assert!(err.contains("Unknown duration unit"), "error was: {}", err);
        }

        #[test]
        fn no_number_errors() {
            let err = parse_duration_string("m").unwrap_err();
            assert!(err.contains("Invalid numeric"), "error was: {}", err);
        }

        #[test]
        fn fractional_number_errors() {
            let err = parse_duration_string("5.5h").unwrap_err();
            assert!(err.contains("Invalid numeric"), "error was: {}", err);
        }

        #[test]
        fn negative_number_errors() {
            let err = parse_duration_string("-5m").unwrap_err();
            assert!(err.contains("Invalid numeric"), "error was: {}", err);
        }

        #[test]
        fn letters_as_number_errors() {
            let err = parse_duration_string("abcm").unwrap_err();
            assert!(err.contains("Invalid numeric"), "error was: {}", err);
        }
    }

    #[test]
    fn unix_micros_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(unix_micros_now() > 1_577_836_800_000_000);
    }

    #[test]
    fn duration_micros_converts() {
        assert_eq!(duration_micros(Duration::from_millis(3)), 3000);
        assert_eq!(duration_micros(Duration::MAX), i64::MAX);
    }
}
