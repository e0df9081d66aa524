//! Path Dictionary Builder
//!
//! Reads the reference taxonomy, derives depth and domain from each path and
//! assigns dense surrogate keys in input order. Keys are order-stable, not
//! content-stable: reordering the reference file reassigns them.

use crate::config::{ReferenceColumns, WarehouseConfig};
use crate::error::{Result, WarehouseError};
use crate::ingestion::column_index;
use crate::ingestion::decode::read_text;
use crate::warehouse::Warehouse;
use csv::ReaderBuilder;
use polars::prelude::*;
use regex::Regex;
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConceptNode {
    pub key: i64,
    pub path: String,
    pub name: String,
    pub depth: i64,
    pub domain: String,
    pub visual_attributes: String,
    pub tooltip: String,
}

impl ConceptNode {
    /// `L` in the first visual attribute position, either case.
    pub fn is_leaf(&self) -> bool {
        self.attribute_is(0, 'L')
    }

    /// `H` in the second visual attribute position, either case.
    pub fn is_hidden(&self) -> bool {
        self.attribute_is(1, 'H')
    }

    fn attribute_is(&self, position: usize, flag: char) -> bool {
        self.visual_attributes
            .chars()
            .nth(position)
            .map_or(false, |c| c.eq_ignore_ascii_case(&flag))
    }
}

/// Number of hierarchy delimiters in a path.
pub fn hierarchy_depth(path: &str, delimiter: char) -> i64 {
    path.matches(delimiter).count() as i64
}

/// Ordered pattern → label rules, falling back to a positional path segment.
#[derive(Debug, Clone)]
pub struct DomainRules {
    rules: Vec<(Regex, String)>,
    segment: usize,
    delimiter: char,
}

impl DomainRules {
    pub fn new(rules: Vec<(Regex, String)>, segment: usize, delimiter: char) -> Self {
        Self {
            rules,
            segment,
            delimiter,
        }
    }

    pub fn from_config(config: &WarehouseConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.domain_rules.len());
        for rule in &config.domain_rules {
            let pattern = Regex::new(&rule.pattern).map_err(|e| {
                WarehouseError::Config(format!("Invalid domain pattern {}: {}", rule.pattern, e))
            })?;
            rules.push((pattern, rule.label.clone()));
        }
        Ok(Self::new(rules, config.domain_segment, config.delimiter))
    }

    /// First matching rule wins; otherwise the configured segment, or an
    /// empty domain when the path is too shallow.
    pub fn domain_of(&self, path: &str) -> String {
        if let Some((_, label)) = self.rules.iter().find(|(re, _)| re.is_match(path)) {
            return label.clone();
        }
        path.split(self.delimiter)
            .nth(self.segment)
            .unwrap_or("")
            .to_string()
    }
}

/// One row of the reference file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceEntry {
    pub path: String,
    pub name: String,
    pub depth: Option<i64>,
    pub visual_attributes: String,
    pub tooltip: String,
}

pub struct PathDictionary {
    nodes: Vec<ConceptNode>,
    by_path: HashMap<String, i64>,
}

impl PathDictionary {
    /// Build from entries in their input order.
    pub fn build(entries: Vec<ReferenceEntry>, rules: &DomainRules, delimiter: char) -> Self {
        let mut nodes = Vec::with_capacity(entries.len());
        let mut by_path = HashMap::with_capacity(entries.len());
        let mut duplicates = 0usize;

        for (position, entry) in entries.into_iter().enumerate() {
            let key = position as i64;
            let depth = entry
                .depth
                .unwrap_or_else(|| hierarchy_depth(&entry.path, delimiter));
            let domain = rules.domain_of(&entry.path);

            if by_path.contains_key(&entry.path) {
                duplicates += 1;
            } else {
                by_path.insert(entry.path.clone(), key);
            }

            nodes.push(ConceptNode {
                key,
                path: entry.path,
                name: entry.name,
                depth,
                domain,
                visual_attributes: entry.visual_attributes,
                tooltip: entry.tooltip,
            });
        }

        if duplicates > 0 {
            warn!("{} duplicate reference paths; facts join to the first occurrence", duplicates);
        }

        Self { nodes, by_path }
    }

    /// Load and build from the configured reference file.
    pub fn load(config: &WarehouseConfig) -> Result<Self> {
        let text = read_text(&config.reference_file, &config.encodings)?;
        let entries = parse_reference(&config.reference_file, &text, &config.reference_columns)?;
        let rules = DomainRules::from_config(config)?;
        let dictionary = Self::build(entries, &rules, config.delimiter);
        info!(
            "Built dictionary of {} concepts from {}",
            dictionary.len(),
            config.reference_file.display()
        );
        Ok(dictionary)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ConceptNode] {
        &self.nodes
    }

    pub fn key_of(&self, path: &str) -> Option<i64> {
        self.by_path.get(path).copied()
    }

    /// `path` → `concept_key` lookup frame, one row per distinct path.
    pub fn key_frame(&self) -> Result<DataFrame> {
        let mut paths = Vec::with_capacity(self.by_path.len());
        let mut keys = Vec::with_capacity(self.by_path.len());
        for node in &self.nodes {
            if self.by_path.get(&node.path) == Some(&node.key) {
                paths.push(node.path.clone());
                keys.push(node.key);
            }
        }
        Ok(df!(
            "path" => paths,
            "concept_key" => keys
        )?)
    }

    /// Full replace of the `concepts` table.
    pub fn persist(&self, warehouse: &mut Warehouse) -> Result<usize> {
        let tx = warehouse.transaction()?;
        tx.execute("DELETE FROM concepts", [])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO concepts
                (concept_key, path, name, depth, domain, visual_attributes, tooltip, is_leaf, is_hidden)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )?;
            for node in &self.nodes {
                stmt.execute(params![
                    node.key,
                    node.path,
                    node.name,
                    node.depth,
                    node.domain,
                    node.visual_attributes,
                    node.tooltip,
                    node.is_leaf(),
                    node.is_hidden(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(self.nodes.len())
    }
}

/// Parse reference text. Path and name columns are required; depth, visual
/// attributes and tooltip are optional.
pub fn parse_reference(
    source: &Path,
    text: &str,
    columns: &ReferenceColumns,
) -> Result<Vec<ReferenceEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = rdr
        .headers()
        .map_err(|e| WarehouseError::input_format(source, format!("unreadable header: {}", e)))?
        .clone();

    let path_idx = column_index(&headers, &columns.path).ok_or_else(|| {
        WarehouseError::input_format(source, format!("missing required column '{}'", columns.path))
    })?;
    let name_idx = column_index(&headers, &columns.name).ok_or_else(|| {
        WarehouseError::input_format(source, format!("missing required column '{}'", columns.name))
    })?;
    let depth_idx = column_index(&headers, &columns.depth);
    let visual_idx = column_index(&headers, &columns.visual_attributes);
    let tooltip_idx = column_index(&headers, &columns.tooltip);

    let mut entries = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(|e| {
            WarehouseError::input_format(source, format!("unreadable record: {}", e))
        })?;
        let cell = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("").to_string();

        entries.push(ReferenceEntry {
            path: cell(Some(path_idx)),
            name: cell(Some(name_idx)),
            depth: depth_idx
                .and_then(|i| record.get(i))
                .and_then(|s| s.trim().parse::<i64>().ok()),
            visual_attributes: cell(visual_idx).trim().to_string(),
            tooltip: cell(tooltip_idx),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> DomainRules {
        DomainRules::from_config(&WarehouseConfig::default()).unwrap()
    }

    fn entry(path: &str, attrs: &str) -> ReferenceEntry {
        ReferenceEntry {
            path: path.to_string(),
            name: path.to_string(),
            visual_attributes: attrs.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_depth_counts_delimiters() {
        assert_eq!(hierarchy_depth("\\ACT\\Diagnosis\\ICD10\\", '\\'), 4);
        assert_eq!(hierarchy_depth("", '\\'), 0);
    }

    #[test]
    fn test_domain_is_third_segment() {
        let rules = rules();
        assert_eq!(rules.domain_of("\\ACT\\Diagnosis\\ICD10\\"), "Diagnosis");
        assert_eq!(rules.domain_of("\\ACT\\"), "");
    }

    #[test]
    fn test_modifier_marker_overrides_position() {
        assert_eq!(rules().domain_of("\\ACT\\PCORI_MOD\\PDX\\"), "MODIFIER");
        assert_eq!(rules().domain_of("\\ACT\\Lab\\PCORI_MOD_X\\"), "MODIFIER");
    }

    #[test]
    fn test_dense_keys_in_input_order() {
        let dict = PathDictionary::build(
            vec![entry("\\A\\", "FA"), entry("\\A\\B\\", "LA"), entry("\\A\\C\\", "FH")],
            &rules(),
            '\\',
        );
        let keys: Vec<i64> = dict.nodes().iter().map(|n| n.key).collect();
        assert_eq!(keys, vec![0, 1, 2]);
        assert_eq!(dict.key_of("\\A\\B\\"), Some(1));
        assert!(dict.nodes()[1].is_leaf());
        assert!(dict.nodes()[2].is_hidden());
        assert!(!dict.nodes()[0].is_leaf() && !dict.nodes()[0].is_hidden());
    }

    #[test]
    fn test_attribute_flags_ignore_case() {
        let dict = PathDictionary::build(
            vec![entry("\\A\\", "la"), entry("\\A\\B\\", "fh"), entry("\\A\\C\\", "fa")],
            &rules(),
            '\\',
        );
        assert!(dict.nodes()[0].is_leaf());
        assert!(dict.nodes()[1].is_hidden());
        assert!(!dict.nodes()[1].is_leaf());
        assert!(!dict.nodes()[2].is_leaf() && !dict.nodes()[2].is_hidden());
    }

    #[test]
    fn test_reordering_reassigns_keys() {
        let a = PathDictionary::build(vec![entry("\\X\\", ""), entry("\\Y\\", "")], &rules(), '\\');
        let b = PathDictionary::build(vec![entry("\\Y\\", ""), entry("\\X\\", "")], &rules(), '\\');
        assert_ne!(a.key_of("\\X\\"), b.key_of("\\X\\"));
    }

    #[test]
    fn test_duplicate_paths_map_to_first() {
        let dict = PathDictionary::build(vec![entry("\\X\\", ""), entry("\\X\\", "")], &rules(), '\\');
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.key_of("\\X\\"), Some(0));
        assert_eq!(dict.key_frame().unwrap().height(), 1);
    }

    #[test]
    fn test_parse_reference_optional_columns() {
        let text = "C_FULLNAME,c_name,c_hlevel\n\\A\\B\\,Bee,7\n\\A\\C\\,Cee,\n";
        let entries = parse_reference(Path::new("ref.csv"), text, &ReferenceColumns::default()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].depth, Some(7));
        assert_eq!(entries[1].depth, None);
        assert_eq!(entries[1].visual_attributes, "");

        let dict = PathDictionary::build(entries, &rules(), '\\');
        assert_eq!(dict.nodes()[0].depth, 7);
        assert_eq!(dict.nodes()[1].depth, 3);
    }

    #[test]
    fn test_parse_reference_requires_name() {
        let err = parse_reference(Path::new("ref.csv"), "c_fullname\n\\A\\\n", &ReferenceColumns::default())
            .unwrap_err();
        assert!(err.is_input_format());
    }

    #[test]
    fn test_persist_full_replace() {
        let mut wh = Warehouse::open_in_memory().unwrap();
        let dict = PathDictionary::build(vec![entry("\\A\\", "FA"), entry("\\A\\B\\", "LA")], &rules(), '\\');
        dict.persist(&mut wh).unwrap();
        dict.persist(&mut wh).unwrap();
        assert_eq!(wh.row_count("concepts").unwrap(), 2);

        let leaf: i64 = wh
            .connection()
            .query_row("SELECT is_leaf FROM concepts WHERE concept_key = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(leaf, 1);
    }
}
