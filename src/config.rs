//! Build configuration
//!
//! Defaults, then an optional JSON file, then `TOTALNUM_*` environment
//! variables. The binary applies CLI flags last.

use crate::error::{Result, WarehouseError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Column names expected in a per-site report (matched case-insensitively).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportColumns {
    pub path: String,
    pub date: String,
    pub count: String,
}

impl Default for ReportColumns {
    fn default() -> Self {
        Self {
            path: "c_fullname".to_string(),
            date: "agg_date".to_string(),
            count: "agg_count".to_string(),
        }
    }
}

/// Column names of the reference taxonomy file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReferenceColumns {
    pub path: String,
    pub name: String,
    pub depth: String,
    pub visual_attributes: String,
    pub tooltip: String,
}

impl Default for ReferenceColumns {
    fn default() -> Self {
        Self {
            path: "c_fullname".to_string(),
            name: "c_name".to_string(),
            depth: "c_hlevel".to_string(),
            visual_attributes: "c_visualattributes".to_string(),
            tooltip: "c_tooltip".to_string(),
        }
    }
}

/// A path pattern that overrides positional domain inference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainRuleConfig {
    /// Regular expression searched anywhere in the path.
    pub pattern: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub reports_dir: PathBuf,
    pub reference_file: PathBuf,
    pub warehouse_path: PathBuf,
    pub report_extension: String,
    pub report_columns: ReportColumns,
    pub reference_columns: ReferenceColumns,
    /// Text encodings tried in order (WHATWG labels).
    pub encodings: Vec<String>,
    pub delimiter: char,
    /// Path segment used as the domain when no rule matches.
    pub domain_segment: usize,
    pub domain_rules: Vec<DomainRuleConfig>,
    /// Concept whose latest count is each site's denominator.
    pub denominator_path: Option<String>,
    pub skip_malformed_reports: bool,
    pub outlier_threshold: f64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            reports_dir: PathBuf::from("reports"),
            reference_file: PathBuf::from("reference_paths.csv"),
            warehouse_path: PathBuf::from("reports/totalnums.db"),
            report_extension: "csv".to_string(),
            report_columns: ReportColumns::default(),
            reference_columns: ReferenceColumns::default(),
            encodings: vec!["utf-8".to_string(), "windows-1252".to_string()],
            delimiter: '\\',
            domain_segment: 2,
            domain_rules: vec![DomainRuleConfig {
                pattern: "PCORI_MOD".to_string(),
                label: "MODIFIER".to_string(),
            }],
            denominator_path: None,
            skip_malformed_reports: false,
            outlier_threshold: 1.0,
        }
    }
}

impl WarehouseConfig {
    /// Load defaults, overlay an optional JSON file and the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WarehouseError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("TOTALNUM_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TOTALNUM_REFERENCE_FILE") {
            self.reference_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TOTALNUM_WAREHOUSE") {
            self.warehouse_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TOTALNUM_DENOMINATOR_PATH") {
            if !v.is_empty() {
                self.denominator_path = Some(v);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let columns = [
            &self.report_columns.path,
            &self.report_columns.date,
            &self.report_columns.count,
            &self.reference_columns.path,
            &self.reference_columns.name,
        ];
        if columns.iter().any(|c| c.trim().is_empty()) {
            return Err(WarehouseError::Config(
                "Required column names must not be empty".to_string(),
            ));
        }
        if self.encodings.is_empty() {
            return Err(WarehouseError::Config(
                "At least one text encoding is required".to_string(),
            ));
        }
        if let Some(bad) = self
            .encodings
            .iter()
            .find(|label| encoding_rs::Encoding::for_label(label.as_bytes()).is_none())
        {
            return Err(WarehouseError::Config(format!("Unknown encoding: {}", bad)));
        }
        if !self.outlier_threshold.is_finite() || self.outlier_threshold < 0.0 {
            return Err(WarehouseError::Config(format!(
                "Outlier threshold must be a non-negative number, got {}",
                self.outlier_threshold
            )));
        }
        for rule in &self.domain_rules {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                WarehouseError::Config(format!("Invalid domain pattern {}: {}", rule.pattern, e))
            })?;
        }
        Ok(())
    }
}
