//! Fact Table Builder
//!
//! Joins every site report against the dictionary by exact path, replacing
//! paths with surrogate keys. Rows whose path is not in the dictionary are
//! dropped; that is the join policy, not an error.

use crate::dictionary::PathDictionary;
use crate::error::Result;
use crate::ingestion::{to_storage_text, SiteReport};
use crate::warehouse::Warehouse;
use polars::prelude::*;
use rusqlite::params;
use tracing::{info, warn};

/// Outcome of a fact build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactBuildStats {
    pub records_in: usize,
    pub facts_out: usize,
    pub dropped_unmatched: usize,
}

pub struct FactTableBuilder<'a> {
    dictionary: &'a PathDictionary,
}

impl<'a> FactTableBuilder<'a> {
    pub fn new(dictionary: &'a PathDictionary) -> Self {
        Self { dictionary }
    }

    /// Long-format frame of all records: path, refresh_date, agg_count, site.
    pub fn records_frame(reports: &[SiteReport]) -> Result<DataFrame> {
        let total: usize = reports.iter().map(|r| r.len()).sum();
        let mut paths = Vec::with_capacity(total);
        let mut dates: Vec<Option<String>> = Vec::with_capacity(total);
        let mut counts: Vec<Option<f64>> = Vec::with_capacity(total);
        let mut sites = Vec::with_capacity(total);

        for report in reports {
            for record in &report.records {
                paths.push(record.path.clone());
                dates.push(record.refresh_date.as_ref().map(to_storage_text));
                counts.push(record.count);
                sites.push(report.site.clone());
            }
        }

        Ok(df!(
            "path" => paths,
            "refresh_date" => dates,
            "agg_count" => counts,
            "site" => sites
        )?)
    }

    /// Inner join against the dictionary, projected to
    /// (concept_key, refresh_date, agg_count, site).
    pub fn join(&self, reports: &[SiteReport]) -> Result<(DataFrame, FactBuildStats)> {
        let records = Self::records_frame(reports)?;
        let records_in = records.height();

        let facts = records
            .lazy()
            .join(
                self.dictionary.key_frame()?.lazy(),
                [col("path")],
                [col("path")],
                JoinArgs::new(JoinType::Inner),
            )
            .select([
                col("concept_key"),
                col("refresh_date"),
                col("agg_count"),
                col("site"),
            ])
            .collect()?;

        let stats = FactBuildStats {
            records_in,
            facts_out: facts.height(),
            dropped_unmatched: records_in.saturating_sub(facts.height()),
        };
        if stats.dropped_unmatched > 0 {
            warn!(
                "Dropped {} of {} records with paths absent from the dictionary",
                stats.dropped_unmatched, records_in
            );
        }
        Ok((facts, stats))
    }

    /// Full replace of the `facts` table from a joined frame.
    pub fn persist(warehouse: &mut Warehouse, facts: &DataFrame) -> Result<usize> {
        let keys = facts.column("concept_key")?.i64()?;
        let dates = facts.column("refresh_date")?.str()?;
        let counts = facts.column("agg_count")?.f64()?;
        let sites = facts.column("site")?.str()?;

        let tx = warehouse.transaction()?;
        tx.execute("DELETE FROM facts", [])?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO facts (concept_key, site, refresh_date, agg_count) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (((key, date), count), site) in keys
                .into_iter()
                .zip(dates.into_iter())
                .zip(counts.into_iter())
                .zip(sites.into_iter())
            {
                let (Some(key), Some(site)) = (key, site) else {
                    continue;
                };
                stmt.execute(params![key, site, date, count])?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Join and persist in one step.
    pub fn build(&self, warehouse: &mut Warehouse, reports: &[SiteReport]) -> Result<FactBuildStats> {
        let (facts, stats) = self.join(reports)?;
        let written = Self::persist(warehouse, &facts)?;
        info!("Wrote {} facts from {} reports", written, reports.len());
        Ok(FactBuildStats {
            facts_out: written,
            ..stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WarehouseConfig;
    use crate::dictionary::{DomainRules, ReferenceEntry};
    use crate::ingestion::ReportRecord;
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn dictionary(paths: &[&str]) -> PathDictionary {
        let rules = DomainRules::from_config(&WarehouseConfig::default()).unwrap();
        let entries = paths
            .iter()
            .map(|p| ReferenceEntry {
                path: p.to_string(),
                name: p.to_string(),
                ..Default::default()
            })
            .collect();
        PathDictionary::build(entries, &rules, '\\')
    }

    fn report(site: &str, rows: &[(&str, Option<f64>)]) -> SiteReport {
        SiteReport {
            site: site.to_string(),
            source: PathBuf::from(format!("report_{}_x.csv", site)),
            records: rows
                .iter()
                .map(|(path, count)| ReportRecord {
                    path: path.to_string(),
                    refresh_date: NaiveDate::from_ymd_opt(2020, 5, 1)
                        .and_then(|d| d.and_hms_opt(9, 30, 0)),
                    count: *count,
                })
                .collect(),
            coerced_counts: 0,
            coerced_dates: 0,
        }
    }

    #[test]
    fn test_unmatched_paths_are_dropped() {
        let dict = dictionary(&["\\A\\", "\\A\\B\\"]);
        let reports = vec![
            report("S1", &[("\\A\\", Some(10.0)), ("\\Z\\", Some(3.0))]),
            report("S2", &[("\\A\\B\\", None)]),
        ];
        let (facts, stats) = FactTableBuilder::new(&dict).join(&reports).unwrap();
        assert_eq!(stats.records_in, 3);
        assert_eq!(stats.facts_out, 2);
        assert_eq!(stats.dropped_unmatched, 1);
        assert_eq!(
            facts.get_column_names(),
            &["concept_key", "refresh_date", "agg_count", "site"]
        );
    }

    #[test]
    fn test_persisted_keys_exist_in_dictionary() {
        let dict = dictionary(&["\\A\\", "\\A\\B\\"]);
        let reports = vec![report("S1", &[("\\A\\B\\", Some(4.0)), ("\\nope\\", Some(1.0))])];
        let mut wh = Warehouse::open_in_memory().unwrap();
        dict.persist(&mut wh).unwrap();
        let stats = FactTableBuilder::new(&dict).build(&mut wh, &reports).unwrap();
        assert_eq!(stats.facts_out, 1);

        let orphans: i64 = wh
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM facts f WHERE NOT EXISTS (SELECT 1 FROM concepts c WHERE c.concept_key = f.concept_key)",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);

        let (key, date, count): (i64, String, Option<f64>) = wh
            .connection()
            .query_row("SELECT concept_key, refresh_date, agg_count FROM facts", [], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .unwrap();
        assert_eq!(key, 1);
        assert_eq!(date, "2020-05-01 09:30:00");
        assert_eq!(count, Some(4.0));
    }

    #[test]
    fn test_no_reports_gives_empty_facts() {
        let dict = dictionary(&["\\A\\"]);
        let mut wh = Warehouse::open_in_memory().unwrap();
        let stats = FactTableBuilder::new(&dict).build(&mut wh, &[]).unwrap();
        assert_eq!(stats, FactBuildStats::default());
        assert_eq!(wh.row_count("facts").unwrap(), 0);
    }
}
