//! Ingestion - per-site report extracts into canonical record sets
//!
//! - Site id resolution from report file names
//! - Text decoding with an ordered encoding fallback
//! - Tolerant date parsing
//! - Case-insensitive column matching and count coercion

pub mod dates;
pub mod decode;
pub mod report_loader;
pub mod site_id;

pub use dates::{parse_refresh_time, to_storage_text};
pub use decode::decode_text;
pub use report_loader::{discover_reports, ReportLoader, ReportRecord, SiteReport};
pub use site_id::ReportFileName;

/// Position of each named column in a header row, matched case-insensitively.
pub(crate) fn column_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim().trim_start_matches('\u{feff}').eq_ignore_ascii_case(name.trim()))
}
