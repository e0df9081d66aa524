//! Read-only queries for presentation layers.
//!
//! The reader never writes; it opens the published warehouse read-only.

use crate::derived::{is_outlier, Scale};
use crate::error::{Result, WarehouseError};
use crate::reducer::register_sql_aggregates;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConceptRow {
    pub concept_key: i64,
    pub path: String,
    pub name: String,
    pub depth: i64,
    pub domain: String,
    pub visual_attributes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactRow {
    pub refresh_date: Option<NaiveDateTime>,
    pub count: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestRow {
    pub concept_key: i64,
    pub site: String,
    pub refresh_date: Option<NaiveDateTime>,
    pub count: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutlierRow {
    pub concept_key: i64,
    pub path: String,
    pub name: String,
    pub site: String,
    pub value: f64,
    pub mean: f64,
    pub stdev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingConcept {
    pub concept_key: i64,
    pub path: String,
    pub name: String,
    pub depth: i64,
    pub tooltip: String,
    pub reported_elsewhere: bool,
}

/// One line of the indented missingness outline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutlineLine {
    pub indent: usize,
    pub label: String,
    /// False for lines that only show hierarchy context.
    pub missing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub name: String,
    pub count: Option<f64>,
}

pub struct WarehouseReader {
    conn: Connection,
    delimiter: char,
}

impl WarehouseReader {
    pub fn open(path: &Path, delimiter: char) -> Result<Self> {
        if !path.exists() {
            return Err(WarehouseError::Config(format!(
                "Warehouse not found: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        register_sql_aggregates(&conn)?;
        Ok(Self { conn, delimiter })
    }

    /// Ad-hoc access for callers that need raw SQL (read-only).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Distinct sites over facts.
    pub fn sites(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT site FROM facts ORDER BY site")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn concept_by_path(&self, path: &str) -> Result<Option<ConceptRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT concept_key, path, name, depth, domain, visual_attributes FROM concepts WHERE path = ?1 ORDER BY concept_key LIMIT 1",
        )?;
        let mut rows = stmt.query_map([path], concept_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Concepts one level below `path`, by stored depth. Empty when `path`
    /// is not in the dictionary.
    pub fn children(&self, path: &str) -> Result<Vec<ConceptRow>> {
        let Some(parent) = self.concept_by_path(path)? else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            r#"
            SELECT concept_key, path, name, depth, domain, visual_attributes
            FROM concepts
            WHERE depth = ?1 AND substr(path, 1, length(?2)) = ?2
            ORDER BY path
            "#,
        )?;
        let rows = stmt.query_map(params![parent.depth + 1, path], concept_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// All refreshes of a concept at a site, oldest first.
    pub fn history(&self, concept_key: i64, site: &str) -> Result<Vec<FactRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT refresh_date, agg_count FROM facts WHERE concept_key = ?1 AND site = ?2 ORDER BY refresh_date ASC",
        )?;
        let rows = stmt.query_map(params![concept_key, site], |row| {
            Ok(FactRow {
                refresh_date: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn latest(&self, concept_key: i64) -> Result<Vec<LatestRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT concept_key, site, refresh_date, agg_count FROM latest_per_site WHERE concept_key = ?1 ORDER BY site",
        )?;
        let rows = stmt.query_map([concept_key], |row| {
            Ok(LatestRow {
                concept_key: row.get(0)?,
                site: row.get(1)?,
                refresh_date: row.get(2)?,
                count: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Concepts where `site` deviates from the cross-site mean by more than
    /// `threshold` standard deviations.
    pub fn site_outliers(&self, site: &str, threshold: f64, scale: Scale) -> Result<Vec<OutlierRow>> {
        let sql = format!(
            r#"
            SELECT d.concept_key, c.path, c.name, d.site, d.value, d.mean, d.stdev
            FROM {} d
            JOIN concepts c ON c.concept_key = d.concept_key
            WHERE d.site = ?1
            ORDER BY c.path
            "#,
            scale.deviation_table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([site], |row| {
            Ok(OutlierRow {
                concept_key: row.get(0)?,
                path: row.get(1)?,
                name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                site: row.get(3)?,
                value: row.get(4)?,
                mean: row.get(5)?,
                stdev: row.get(6)?,
            })
        })?;
        let all: Vec<OutlierRow> = rows.collect::<rusqlite::Result<_>>()?;
        Ok(all
            .into_iter()
            .filter(|r| is_outlier(r.value, r.mean, r.stdev, threshold))
            .collect())
    }

    /// Non-leaf, non-hidden concepts the site never reported, ordered by path.
    pub fn missingness(&self, site: &str) -> Result<Vec<MissingConcept>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT c.concept_key, c.path, c.name, c.depth, c.tooltip, m.reported_elsewhere
            FROM missingness m
            JOIN concepts c ON c.concept_key = m.concept_key
            WHERE m.site = ?1
            ORDER BY c.path
            "#,
        )?;
        let rows = stmt.query_map([site], |row| {
            Ok(MissingConcept {
                concept_key: row.get(0)?,
                path: row.get(1)?,
                name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                depth: row.get(3)?,
                tooltip: row.get(4)?,
                reported_elsewhere: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Indented outline of missing branches for concepts another site reports.
    pub fn missingness_outline(&self, site: &str) -> Result<Vec<OutlineLine>> {
        let missing: Vec<MissingConcept> = self
            .missingness(site)?
            .into_iter()
            .filter(|m| m.reported_elsewhere)
            .collect();
        Ok(build_outline(&missing, self.delimiter))
    }

    /// Latest counts for a site's concepts shallower than `max_depth`.
    pub fn summary(&self, site: &str, max_depth: i64) -> Result<Vec<SummaryRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT c.name, l.agg_count
            FROM latest_per_site l
            JOIN concepts c ON c.concept_key = l.concept_key
            WHERE c.depth < ?1 AND l.site = ?2
            ORDER BY c.path
            "#,
        )?;
        let rows = stmt.query_map(params![max_depth, site], |row| {
            Ok(SummaryRow {
                name: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                count: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

fn concept_row(row: &Row<'_>) -> rusqlite::Result<ConceptRow> {
    Ok(ConceptRow {
        concept_key: row.get(0)?,
        path: row.get(1)?,
        name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        depth: row.get(3)?,
        domain: row.get(4)?,
        visual_attributes: row.get(5)?,
    })
}

/// Segments after the first two of each tooltip (or path) become outline
/// lines; a segment already printed for the previous row is not repeated,
/// and only the last segment of a row is marked missing.
pub fn build_outline(missing: &[MissingConcept], delimiter: char) -> Vec<OutlineLine> {
    let mut lines = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for concept in missing {
        let source = if concept.tooltip.is_empty() {
            concept.path.as_str()
        } else {
            concept.tooltip.as_str()
        };
        let segments: Vec<&str> = source.trim_end_matches(delimiter).split(delimiter).collect();
        if segments.len() <= 2 {
            continue;
        }
        let tail = &segments[2..];
        for (i, segment) in tail.iter().enumerate() {
            if !current.contains(segment) {
                lines.push(OutlineLine {
                    indent: i + 1,
                    label: segment.to_string(),
                    missing: i + 1 == tail.len(),
                });
            }
        }
        current = segments;
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing(path: &str, tooltip: &str) -> MissingConcept {
        MissingConcept {
            concept_key: 0,
            path: path.to_string(),
            name: String::new(),
            depth: 0,
            tooltip: tooltip.to_string(),
            reported_elsewhere: true,
        }
    }

    #[test]
    fn test_outline_marks_last_segment() {
        let rows = vec![
            missing("\\ACT\\Lab\\Chem", "ACT\\Root\\Lab\\Chemistry"),
            missing("\\ACT\\Lab\\Heme", "ACT\\Root\\Lab\\Hematology"),
        ];
        let lines = build_outline(&rows, '\\');
        assert_eq!(
            lines,
            vec![
                OutlineLine { indent: 1, label: "Lab".to_string(), missing: false },
                OutlineLine { indent: 2, label: "Chemistry".to_string(), missing: true },
                OutlineLine { indent: 2, label: "Hematology".to_string(), missing: true },
            ]
        );
    }

    #[test]
    fn test_outline_falls_back_to_path() {
        let rows = vec![missing("\\ACT\\Dx\\Asthma\\", "")];
        let lines = build_outline(&rows, '\\');
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].label, "Dx");
        assert!(!lines[0].missing);
        assert_eq!(lines[1].label, "Asthma");
        assert!(lines[1].missing);
    }

    #[test]
    fn test_open_missing_file_fails() {
        assert!(WarehouseReader::open(Path::new("/nonexistent/totalnums.db"), '\\').is_err());
    }
}
