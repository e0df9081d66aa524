//! Report file name contract: `<prefix>_<siteid>_<anything>`.

use crate::error::{Result, WarehouseError};
use regex::Regex;
use std::path::Path;

const SITE_PATTERN: &str = r"^[^_]*_([^_]+)_";

/// A parsed report file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFileName {
    pub file_name: String,
    pub site: String,
}

impl ReportFileName {
    /// The site is the token after the first `_` of the bare file name, up to
    /// the next `_`.
    pub fn parse(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WarehouseError::SiteId(path.display().to_string()))?;

        let pattern = Regex::new(SITE_PATTERN)
            .map_err(|e| WarehouseError::Config(format!("Failed to create regex: {}", e)))?;
        let site = pattern
            .captures(file_name)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| WarehouseError::SiteId(file_name.to_string()))?;

        Ok(Self {
            file_name: file_name.to_string(),
            site,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_site_after_first_underscore() {
        let parsed = ReportFileName::parse(&PathBuf::from("/data/reports/report_MGB_2020-05.csv")).unwrap();
        assert_eq!(parsed.site, "MGB");
        assert_eq!(parsed.file_name, "report_MGB_2020-05.csv");
    }

    #[test]
    fn test_directory_underscores_are_ignored() {
        let parsed = ReportFileName::parse(&PathBuf::from("/tmp/my_dir_x/report_UPMC_v2_final.csv")).unwrap();
        assert_eq!(parsed.site, "UPMC");
    }

    #[test]
    fn test_missing_pattern_fails() {
        for name in ["report.csv", "report_MGB.csv", "report__x.csv"] {
            let err = ReportFileName::parse(&PathBuf::from(name)).unwrap_err();
            assert!(matches!(err, WarehouseError::SiteId(_)), "{}", name);
            assert!(err.is_input_format());
        }
    }
}
