//! Warehouse handle
//!
//! Every component receives the handle explicitly. A build writes into a
//! staging file beside the target and `publish` renames it into place, so
//! readers only ever see a completed warehouse.

use crate::error::{Result, WarehouseError};
use crate::reducer::register_sql_aggregates;
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const BASE_SCHEMA: &str = r#"
CREATE TABLE concepts (
    concept_key INTEGER NOT NULL,
    path TEXT NOT NULL,
    name TEXT,
    depth INTEGER NOT NULL,
    domain TEXT NOT NULL,
    visual_attributes TEXT NOT NULL DEFAULT '',
    tooltip TEXT NOT NULL DEFAULT '',
    is_leaf INTEGER NOT NULL DEFAULT 0,
    is_hidden INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE facts (
    concept_key INTEGER NOT NULL,
    site TEXT NOT NULL,
    refresh_date TEXT,
    agg_count REAL
);
"#;

const REQUIRED_INDEXES: &[(&str, &str)] = &[
    ("idx_concepts_depth", "CREATE INDEX idx_concepts_depth ON concepts(depth)"),
    ("idx_concepts_key", "CREATE INDEX idx_concepts_key ON concepts(concept_key)"),
    ("idx_facts_key", "CREATE INDEX idx_facts_key ON facts(concept_key)"),
];

#[derive(Debug)]
struct Staging {
    staging: PathBuf,
    target: PathBuf,
}

pub struct Warehouse {
    conn: Connection,
    staging: Option<Staging>,
}

impl Warehouse {
    /// Open a fresh staging warehouse that will replace `target` on publish.
    pub fn stage(target: &Path) -> Result<Self> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let staging = staging_path(target);
        if staging.exists() {
            warn!("Removing stale staging warehouse {}", staging.display());
            std::fs::remove_file(&staging)?;
        }

        let conn = Connection::open(&staging)?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        let warehouse = Self::init(
            conn,
            Some(Staging {
                staging,
                target: target.to_path_buf(),
            }),
        )?;
        info!("Staging warehouse for {}", target.display());
        Ok(warehouse)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, staging: Option<Staging>) -> Result<Self> {
        register_sql_aggregates(&conn)?;
        conn.execute_batch(BASE_SCHEMA)?;
        Ok(Self { conn, staging })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    /// Indexes that every downstream point/range query relies on.
    pub fn create_indexes(&self) -> Result<()> {
        for (name, sql) in REQUIRED_INDEXES {
            self.conn.execute(sql, [])?;
            info!("Created index {}", name);
        }
        Ok(())
    }

    pub fn has_index(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(WarehouseError::Config(format!("Invalid table name: {}", table)));
        }
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Atomically move the staged warehouse over the target.
    pub fn publish(self) -> Result<PathBuf> {
        let Self { conn, staging } = self;
        conn.close().map_err(|(_, e)| e)?;
        match staging {
            Some(Staging { staging, target }) => {
                std::fs::rename(&staging, &target)?;
                info!("Published warehouse {}", target.display());
                Ok(target)
            }
            None => Err(WarehouseError::Config(
                "In-memory warehouse cannot be published".to_string(),
            )),
        }
    }

    /// Drop a failed build without touching the published warehouse.
    pub fn discard(self) -> Result<()> {
        let Self { conn, staging } = self;
        conn.close().map_err(|(_, e)| e)?;
        if let Some(Staging { staging, .. }) = staging {
            if staging.exists() {
                std::fs::remove_file(&staging)?;
            }
            warn!("Discarded staging warehouse {}", staging.display());
        }
        Ok(())
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "warehouse.db".to_string());
    target.with_file_name(format!("{}.staging", file_name))
}
