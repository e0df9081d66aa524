use polars::prelude::PolarsError;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("Input format error in {file}: {reason}")]
    InputFormat { file: String, reason: String },

    #[error("Cannot resolve site id from file name: {0}")]
    SiteId(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: &'static str,
        source: Box<WarehouseError>,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WarehouseError {
    pub fn input_format(file: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        WarehouseError::InputFormat {
            file: file.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    /// True for failures caused by a single malformed input file.
    pub fn is_input_format(&self) -> bool {
        match self {
            WarehouseError::InputFormat { .. } | WarehouseError::SiteId(_) => true,
            WarehouseError::Csv(_) => true,
            WarehouseError::Stage { source, .. } => source.is_input_format(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WarehouseError>;
