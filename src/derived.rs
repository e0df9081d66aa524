//! Derived View / Statistics Engine
//!
//! Every output is recomputed from `concepts` and `facts` alone. Percent and
//! outlier statistics read `latest_per_site`, so it is always built first.

use crate::error::Result;
use crate::reducer::{reduce_groups, OnlineVariance};
use crate::warehouse::Warehouse;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

/// Counts at or below this value are "not reported" and never enter statistics.
pub const NOT_REPORTED: f64 = -1.0;

const DERIVED_SCHEMA: &str = r#"
DROP VIEW IF EXISTS joined;
DROP TABLE IF EXISTS latest_per_site;
DROP TABLE IF EXISTS denominators;
DROP TABLE IF EXISTS percent_per_site;
DROP TABLE IF EXISTS site_stats;
DROP TABLE IF EXISTS site_stats_pct;
DROP TABLE IF EXISTS site_deviation;
DROP TABLE IF EXISTS site_deviation_pct;
DROP TABLE IF EXISTS missingness;

CREATE VIEW joined AS
SELECT c.concept_key, c.path, c.name, c.depth, c.domain, c.visual_attributes,
       c.tooltip, c.is_leaf, c.is_hidden, f.site, f.refresh_date, f.agg_count
FROM concepts c
LEFT JOIN facts f ON f.concept_key = c.concept_key;

CREATE TABLE latest_per_site (
    concept_key INTEGER NOT NULL,
    site TEXT NOT NULL,
    refresh_date TEXT,
    agg_count REAL
);
CREATE TABLE denominators (
    site TEXT NOT NULL,
    denominator REAL
);
CREATE TABLE percent_per_site (
    concept_key INTEGER NOT NULL,
    site TEXT NOT NULL,
    refresh_date TEXT,
    agg_count REAL,
    pct REAL
);
CREATE TABLE site_stats (
    concept_key INTEGER PRIMARY KEY,
    mean REAL NOT NULL,
    stdev REAL NOT NULL,
    sample_size INTEGER NOT NULL
);
CREATE TABLE site_stats_pct (
    concept_key INTEGER PRIMARY KEY,
    mean REAL NOT NULL,
    stdev REAL NOT NULL,
    sample_size INTEGER NOT NULL
);
CREATE TABLE site_deviation (
    concept_key INTEGER NOT NULL,
    site TEXT NOT NULL,
    value REAL NOT NULL,
    mean REAL NOT NULL,
    stdev REAL NOT NULL
);
CREATE TABLE site_deviation_pct (
    concept_key INTEGER NOT NULL,
    site TEXT NOT NULL,
    value REAL NOT NULL,
    mean REAL NOT NULL,
    stdev REAL NOT NULL
);
CREATE TABLE missingness (
    site TEXT NOT NULL,
    concept_key INTEGER NOT NULL,
    reported_elsewhere INTEGER NOT NULL
);
"#;

/// Latest fact per (concept, site). Among rows sharing the maximum date the
/// surviving row is whichever the window function yields first.
const LATEST_PER_SITE: &str = r#"
INSERT INTO latest_per_site (concept_key, site, refresh_date, agg_count)
SELECT concept_key, site, refresh_date, agg_count FROM (
    SELECT concept_key, site, refresh_date, agg_count,
           ROW_NUMBER() OVER (PARTITION BY concept_key, site ORDER BY refresh_date DESC) AS rn
    FROM facts
) WHERE rn = 1
"#;

const DENOMINATORS: &str = r#"
INSERT INTO denominators (site, denominator)
SELECT l.site, l.agg_count
FROM latest_per_site l
JOIN concepts c ON c.concept_key = l.concept_key
WHERE c.path = ?1
"#;

const MISSINGNESS: &str = r#"
INSERT INTO missingness (site, concept_key, reported_elsewhere)
SELECT s.site, c.concept_key,
       EXISTS (SELECT 1 FROM latest_per_site o WHERE o.concept_key = c.concept_key)
FROM (SELECT DISTINCT site FROM facts) s
CROSS JOIN concepts c
WHERE c.is_leaf = 0 AND c.is_hidden = 0
  AND NOT EXISTS (
      SELECT 1 FROM latest_per_site l
      WHERE l.concept_key = c.concept_key AND l.site = s.site
  )
"#;

// Each index is created as soon as its table is filled, before the next
// step reads it.
const LATEST_INDEX: &str =
    "CREATE INDEX idx_latest_key_site ON latest_per_site(concept_key, site)";
const PERCENT_INDEX: &str =
    "CREATE INDEX idx_percent_key_site ON percent_per_site(concept_key, site)";
const MISSINGNESS_INDEX: &str = "CREATE INDEX idx_missingness_site ON missingness(site)";

/// Absolute counts or denominator-normalized percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    Absolute,
    Percent,
}

impl Scale {
    pub fn source_table(&self) -> &'static str {
        match self {
            Scale::Absolute => "latest_per_site",
            Scale::Percent => "percent_per_site",
        }
    }

    pub fn value_column(&self) -> &'static str {
        match self {
            Scale::Absolute => "agg_count",
            Scale::Percent => "pct",
        }
    }

    pub fn stats_table(&self) -> &'static str {
        match self {
            Scale::Absolute => "site_stats",
            Scale::Percent => "site_stats_pct",
        }
    }

    pub fn deviation_table(&self) -> &'static str {
        match self {
            Scale::Absolute => "site_deviation",
            Scale::Percent => "site_deviation_pct",
        }
    }
}

/// `floor(count / denominator * 100)`; undefined without a usable denominator.
pub fn percent_of(count: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    let denominator = denominator.filter(|d| *d != 0.0)?;
    count.map(|c| (c / denominator * 100.0).floor())
}

/// Outlier test against a cross-site mean and deviation.
pub fn is_outlier(value: f64, mean: f64, stdev: f64, threshold: f64) -> bool {
    (value - mean).abs() > threshold * stdev
}

/// Row counts of everything the engine produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedSummary {
    pub latest_rows: usize,
    pub denominators: usize,
    pub percent_rows: usize,
    pub stats_rows: usize,
    pub stats_pct_rows: usize,
    pub missingness_rows: usize,
}

pub struct DerivedViewEngine<'a> {
    warehouse: &'a mut Warehouse,
    denominator_path: Option<&'a str>,
}

impl<'a> DerivedViewEngine<'a> {
    pub fn new(warehouse: &'a mut Warehouse, denominator_path: Option<&'a str>) -> Self {
        Self {
            warehouse,
            denominator_path,
        }
    }

    /// Rebuild every derived structure.
    pub fn run(&mut self) -> Result<DerivedSummary> {
        self.warehouse.connection().execute_batch(DERIVED_SCHEMA)?;

        let latest_rows = self.build_latest()?;
        let denominators = self.build_denominators()?;
        let percent_rows = self.build_percent()?;
        let stats_rows = self.build_stats(Scale::Absolute)?;
        let stats_pct_rows = self.build_stats(Scale::Percent)?;
        let missingness_rows = self.build_missingness()?;

        let summary = DerivedSummary {
            latest_rows,
            denominators,
            percent_rows,
            stats_rows,
            stats_pct_rows,
            missingness_rows,
        };
        info!("Derived views rebuilt: {:?}", summary);
        Ok(summary)
    }

    fn build_latest(&mut self) -> Result<usize> {
        let conn = self.warehouse.connection();
        let rows = conn.execute(LATEST_PER_SITE, [])?;
        conn.execute(LATEST_INDEX, [])?;
        Ok(rows)
    }

    fn build_denominators(&mut self) -> Result<usize> {
        let Some(path) = self.denominator_path else {
            warn!("No denominator concept configured; percent views will be empty");
            return Ok(0);
        };
        let rows = self.warehouse.connection().execute(DENOMINATORS, [path])?;
        if rows == 0 {
            warn!("No site reported the denominator concept {}", path);
        }
        Ok(rows)
    }

    fn build_percent(&mut self) -> Result<usize> {
        let denominators: HashMap<String, Option<f64>> = {
            let conn = self.warehouse.connection();
            let mut stmt = conn.prepare("SELECT site, denominator FROM denominators")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if denominators.is_empty() {
            self.warehouse.connection().execute(PERCENT_INDEX, [])?;
            return Ok(0);
        }

        let latest: Vec<(i64, String, Option<String>, Option<f64>)> = {
            let conn = self.warehouse.connection();
            let mut stmt = conn.prepare(
                "SELECT concept_key, site, refresh_date, agg_count FROM latest_per_site ORDER BY concept_key, site",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let tx = self.warehouse.transaction()?;
        let mut written = 0;
        let mut unusable = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO percent_per_site (concept_key, site, refresh_date, agg_count, pct) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (key, site, date, count) in &latest {
                let Some(denominator) = denominators.get(site) else {
                    continue;
                };
                if denominator.map_or(true, |d| d == 0.0) {
                    unusable += 1;
                    continue;
                }
                stmt.execute(params![key, site, date, count, percent_of(*count, *denominator)])?;
                written += 1;
            }
        }
        tx.execute(PERCENT_INDEX, [])?;
        tx.commit()?;
        if unusable > 0 {
            warn!("{} rows skipped for sites with a zero or missing denominator", unusable);
        }
        Ok(written)
    }

    /// Per-concept mean/stdev over sites with a reported value, then the
    /// per-site deviation rows the outlier queries read.
    fn build_stats(&mut self, scale: Scale) -> Result<usize> {
        let values: Vec<(i64, Option<f64>)> = {
            let conn = self.warehouse.connection();
            let sql = format!(
                "SELECT concept_key, {col} FROM {table} WHERE {col} > ?1 ORDER BY concept_key, site",
                col = scale.value_column(),
                table = scale.source_table()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([NOT_REPORTED], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let groups: BTreeMap<i64, OnlineVariance> = reduce_groups(values);
        let undefined = groups.values().filter(|g| g.summary().is_none()).count();

        let tx = self.warehouse.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (concept_key, mean, stdev, sample_size) VALUES (?1, ?2, ?3, ?4)",
                scale.stats_table()
            ))?;
            for (key, acc) in &groups {
                if let Some(s) = acc.summary() {
                    stmt.execute(params![key, s.mean, s.stdev, s.sample_size as i64])?;
                    written += 1;
                }
            }
        }
        tx.execute(
            &format!(
                r#"
                INSERT INTO {dev} (concept_key, site, value, mean, stdev)
                SELECT v.concept_key, v.site, v.{col}, s.mean, s.stdev
                FROM {src} v
                JOIN {stats} s ON s.concept_key = v.concept_key
                WHERE v.{col} > ?1
                "#,
                dev = scale.deviation_table(),
                col = scale.value_column(),
                src = scale.source_table(),
                stats = scale.stats_table()
            ),
            [NOT_REPORTED],
        )?;
        tx.commit()?;

        if undefined > 0 {
            info!(
                "{} concepts on the {:?} scale have fewer than 3 reporting sites; no statistics",
                undefined, scale
            );
        }
        Ok(written)
    }

    fn build_missingness(&mut self) -> Result<usize> {
        let conn = self.warehouse.connection();
        let rows = conn.execute(MISSINGNESS, [])?;
        conn.execute(MISSINGNESS_INDEX, [])?;
        Ok(rows)
    }
}
