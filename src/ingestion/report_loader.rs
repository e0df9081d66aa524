//! Report Loader - one per-site extract into (path, date, count, site) records

use crate::config::{ReportColumns, WarehouseConfig};
use crate::error::{Result, WarehouseError};
use crate::ingestion::column_index;
use crate::ingestion::dates::parse_refresh_time;
use crate::ingestion::decode::read_text;
use crate::ingestion::site_id::ReportFileName;
use chrono::NaiveDateTime;
use csv::ReaderBuilder;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One row of a site report after coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRecord {
    pub path: String,
    /// `None` when the source date could not be parsed.
    pub refresh_date: Option<NaiveDateTime>,
    /// `None` when the source count was not numeric.
    pub count: Option<f64>,
}

/// All records of one report file, tagged with the resolved site.
#[derive(Debug, Clone)]
pub struct SiteReport {
    pub site: String,
    pub source: PathBuf,
    pub records: Vec<ReportRecord>,
    pub coerced_counts: usize,
    pub coerced_dates: usize,
}

impl SiteReport {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct ReportLoader<'a> {
    columns: &'a ReportColumns,
    encodings: &'a [String],
}

impl<'a> ReportLoader<'a> {
    pub fn new(columns: &'a ReportColumns, encodings: &'a [String]) -> Self {
        Self { columns, encodings }
    }

    pub fn from_config(config: &'a WarehouseConfig) -> Self {
        Self::new(&config.report_columns, &config.encodings)
    }

    /// Load a report file. The site id comes from the file name.
    pub fn load(&self, source: &Path) -> Result<SiteReport> {
        let name = ReportFileName::parse(source)?;
        let text = read_text(source, self.encodings)?;
        let report = self.parse(&name.site, source, &text)?;
        info!(
            "Loaded {} records for site {} from {}",
            report.len(),
            report.site,
            name.file_name
        );
        Ok(report)
    }

    /// Parse already-decoded report text.
    pub fn parse(&self, site: &str, source: &Path, text: &str) -> Result<SiteReport> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers = rdr
            .headers()
            .map_err(|e| WarehouseError::input_format(source, format!("unreadable header: {}", e)))?
            .clone();

        let path_idx = self.require(&headers, &self.columns.path, source)?;
        let date_idx = self.require(&headers, &self.columns.date, source)?;
        let count_idx = self.require(&headers, &self.columns.count, source)?;

        let mut records = Vec::new();
        let mut coerced_counts = 0;
        let mut coerced_dates = 0;

        for result in rdr.records() {
            let record = result.map_err(|e| {
                WarehouseError::input_format(source, format!("unreadable record: {}", e))
            })?;

            let raw_date = record.get(date_idx).unwrap_or("");
            let refresh_date = parse_refresh_time(raw_date);
            if refresh_date.is_none() {
                coerced_dates += 1;
                debug!("Unparsable date {:?} in {}", raw_date, source.display());
            }

            let count = coerce_count(record.get(count_idx).unwrap_or(""));
            if count.is_none() {
                coerced_counts += 1;
            }

            records.push(ReportRecord {
                path: record.get(path_idx).unwrap_or("").to_string(),
                refresh_date,
                count,
            });
        }

        if coerced_counts > 0 || coerced_dates > 0 {
            warn!(
                "{}: {} non-numeric counts and {} unparsable dates kept as missing values",
                source.display(),
                coerced_counts,
                coerced_dates
            );
        }

        Ok(SiteReport {
            site: site.to_string(),
            source: source.to_path_buf(),
            records,
            coerced_counts,
            coerced_dates,
        })
    }

    fn require(&self, headers: &csv::StringRecord, name: &str, source: &Path) -> Result<usize> {
        column_index(headers, name).ok_or_else(|| {
            WarehouseError::input_format(source, format!("missing required column '{}'", name))
        })
    }
}

/// Numeric coercion; anything that is not a finite number becomes `None`.
pub fn coerce_count(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Report files in `dir` with the given extension, sorted by file name.
pub fn discover_reports(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
