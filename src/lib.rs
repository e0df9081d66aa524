pub mod config;
pub mod derived;
pub mod dictionary;
pub mod error;
pub mod facts;
pub mod ingestion;
pub mod pipeline;
pub mod query;
pub mod reducer;
pub mod warehouse;

pub use config::WarehouseConfig;
pub use derived::{DerivedSummary, DerivedViewEngine, Scale, NOT_REPORTED};
pub use dictionary::{ConceptNode, DomainRules, PathDictionary};
pub use error::{Result, WarehouseError};
pub use facts::{FactBuildStats, FactTableBuilder};
pub use ingestion::{ReportLoader, SiteReport};
pub use pipeline::{BuildPipeline, BuildStage, BuildSummary};
pub use query::WarehouseReader;
pub use reducer::{OnlineVariance, StreamingReducer, VarianceSummary};
pub use warehouse::Warehouse;
