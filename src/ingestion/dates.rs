use chrono::{DateTime, NaiveDate, NaiveDateTime};

const STORAGE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y%m%d",
    "%m/%d/%y",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%d-%b-%Y",
    "%d %b %Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Parse a refresh timestamp in any of the accepted textual forms. Date-only
/// input is taken as midnight; the time of day is kept when present so that
/// same-day refreshes stay ordered.
///
/// Returns `None` for blank or unrecognised input; callers keep the row.
pub fn parse_refresh_time(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(dt);
        }
    }
    DateTime::parse_from_rfc3339(trimmed).ok().map(|dt| dt.naive_utc())
}

/// Storage form: sorts chronologically as text and reads back as a
/// `NaiveDateTime` through rusqlite.
pub fn to_storage_text(time: &NaiveDateTime) -> String {
    time.format(STORAGE_FORMAT).to_string()
}
