// src/utils/time.rs

//! Timestamp normalization.
//!
//! Upstreams disagree on how they encode creation time: epoch seconds,
//! epoch milliseconds, RFC 3339, `+0000` offsets, the Twitter export form
//! and naive local strings. Everything is normalized to a UTC instant;
//! naive inputs are read as UTC and flagged as approximate.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// A normalized creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTime {
    pub instant: DateTime<Utc>,
    /// The source carried no offset
    pub approximate: bool,
}

impl ParsedTime {
    fn exact(instant: DateTime<Utc>) -> Self {
        Self {
            instant,
            approximate: false,
        }
    }

    fn naive(naive: NaiveDateTime) -> Self {
        Self {
            instant: Utc.from_utc_datetime(&naive),
            approximate: true,
        }
    }
}

// Offsets above this are milliseconds (year 33658 in seconds).
const EPOCH_MILLIS_THRESHOLD: f64 = 1e12;

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%z",
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%d %H:%M:%S %z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%a %b %d %H:%M:%S %z %Y",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

/// Convert an epoch value in seconds or milliseconds.
pub fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = if value >= EPOCH_MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis.round() as i64)
}

/// Parse any supported timestamp representation.
pub fn parse_timestamp(raw: &str) -> Option<ParsedTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return raw
            .parse::<f64>()
            .ok()
            .and_then(from_epoch)
            .map(ParsedTime::exact);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(ParsedTime::exact(dt.with_timezone(&Utc)));
    }

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Some(ParsedTime::exact(dt.with_timezone(&Utc)));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ParsedTime::naive(naive));
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(ParsedTime::naive)
}

/// Fixed-width representation used in the database, sortable as text.
pub fn to_storage(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Inverse of [`to_storage`].
pub fn from_storage(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_epoch_seconds_and_millis() {
        let expected = utc(2025, 1, 1, 0, 0, 0);
        assert_eq!(parse_timestamp("1735689600").unwrap().instant, expected);
        assert_eq!(parse_timestamp("1735689600000").unwrap().instant, expected);
        assert_eq!(parse_timestamp("1735689600.0").unwrap().instant, expected);
        assert!(!parse_timestamp("1735689600").unwrap().approximate);
    }

    #[test]
    fn test_offset_aware_formats() {
        let expected = utc(2025, 1, 1, 0, 0, 0);
        for raw in [
            "2025-01-01T00:00:00Z",
            "2025-01-01T00:00:00.000Z",
            "2025-01-01T08:00:00+08:00",
            "2025-01-01 00:00:00+0000",
            "Wed Jan 01 00:00:00 +0000 2025",
        ] {
            let parsed = parse_timestamp(raw).unwrap_or_else(|| panic!("failed: {raw}"));
            assert_eq!(parsed.instant, expected, "{raw}");
            assert!(!parsed.approximate, "{raw}");
        }
    }

    #[test]
    fn test_naive_formats_are_approximate() {
        let parsed = parse_timestamp("2025-01-01 12:30:00").unwrap();
        assert_eq!(parsed.instant, utc(2025, 1, 1, 12, 30, 0));
        assert!(parsed.approximate);

        let date_only = parse_timestamp("2025-03-04").unwrap();
        assert_eq!(date_only.instant, utc(2025, 3, 4, 0, 0, 0));
        assert!(date_only.approximate);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_timestamp("not-a-date").is_none());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("1.2.3").is_none());
    }

    #[test]
    fn test_storage_round_trip_sorts_as_text() {
        let early = utc(2025, 1, 1, 0, 0, 0);
        let late = utc(2025, 1, 1, 0, 0, 1);
        assert!(to_storage(&early) < to_storage(&late));
        assert_eq!(from_storage(&to_storage(&early)), Some(early));
    }
}
