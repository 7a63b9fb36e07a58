//! Expiry date parsing.
//!
//! Expiry values are stored as entered. They are parsed against a fixed
//! list of formats, in order; the first match wins, so an ambiguous
//! `03/04/2025` reads as March 4th. Date-only values mean midnight.

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

/// Accepted date-only formats, tried in order.
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"];

/// Accepted date-time formats, tried in order.
const DATETIME_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

/// Why an expiry could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpiryError {
    /// No expiry is set.
    #[error("no expiry set")]
    Missing,

    /// The stored value matches none of the accepted formats.
    #[error("unrecognized expiry format: {0}")]
    InvalidFormat(String),
}

/// Parse an optional stored expiry.
pub fn parse_expiry(raw: Option<&str>) -> Result<NaiveDateTime, ExpiryError> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty());
    let Some(raw) = raw else {
        return Err(ExpiryError::Missing);
    };

    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(parsed);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(midnight);
            }
        }
    }

    Err(ExpiryError::InvalidFormat(raw.to_string()))
}

/// Render an expiry the way clients receive it.
pub fn format_expiry(expires: &NaiveDateTime) -> String {
    expires.format("%Y-%m-%d").to_string()
}
