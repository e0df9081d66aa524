//! Build pipeline
//!
//! INIT → LOAD_REPORTS → BUILD_DICTIONARY → BUILD_FACTS → INDEX →
//! DERIVE_VIEWS → DONE. Every run is a full recomputation into a staging
//! warehouse; a failed stage discards it and the published warehouse is left
//! as it was.

use crate::config::WarehouseConfig;
use crate::derived::{DerivedSummary, DerivedViewEngine};
use crate::dictionary::PathDictionary;
use crate::error::{Result, WarehouseError};
use crate::facts::FactTableBuilder;
use crate::ingestion::{discover_reports, ReportLoader, SiteReport};
use crate::warehouse::Warehouse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStage {
    Init,
    LoadReports,
    BuildDictionary,
    BuildFacts,
    Index,
    DeriveViews,
    Done,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::Init => "INIT",
            BuildStage::LoadReports => "LOAD_REPORTS",
            BuildStage::BuildDictionary => "BUILD_DICTIONARY",
            BuildStage::BuildFacts => "BUILD_FACTS",
            BuildStage::Index => "INDEX",
            BuildStage::DeriveViews => "DERIVE_VIEWS",
            BuildStage::Done => "DONE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: BuildStage,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedReport {
    pub file: PathBuf,
    pub reason: String,
}

/// Result of a successful build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub run_id: String,
    pub warehouse: PathBuf,
    pub files_loaded: usize,
    pub files_skipped: Vec<SkippedReport>,
    pub records_loaded: usize,
    pub records_dropped: usize,
    pub coerced_counts: usize,
    pub coerced_dates: usize,
    pub concepts: usize,
    pub facts: usize,
    pub sites: Vec<String>,
    pub derived: DerivedSummary,
    pub stages: Vec<StageTiming>,
}

pub struct BuildPipeline {
    config: WarehouseConfig,
}

impl BuildPipeline {
    pub fn new(config: WarehouseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run a full build and publish the warehouse.
    pub fn run(&self) -> Result<BuildSummary> {
        let run_id = Uuid::new_v4().to_string();
        info!("Build {} starting", run_id);

        let mut stages = Vec::new();
        let started = Instant::now();
        let mut warehouse = Warehouse::stage(&self.config.warehouse_path)
            .map_err(|e| stage_error(BuildStage::Init, e))?;
        stages.push(timing(BuildStage::Init, started));

        match self.build_into(&mut warehouse, run_id.clone(), stages) {
            Ok(mut summary) => {
                summary.warehouse = warehouse.publish()?;
                info!("Build {} done", summary.run_id);
                Ok(summary)
            }
            Err(e) => {
                error!("Build {} aborted: {}", run_id, e);
                if let Err(cleanup) = warehouse.discard() {
                    warn!("Failed to discard staging warehouse: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    /// Every stage after INIT, against an already-open warehouse.
    pub fn build_into(
        &self,
        warehouse: &mut Warehouse,
        run_id: String,
        mut stages: Vec<StageTiming>,
    ) -> Result<BuildSummary> {
        let started = Instant::now();
        let (reports, skipped) = self
            .load_reports()
            .map_err(|e| stage_error(BuildStage::LoadReports, e))?;
        stages.push(timing(BuildStage::LoadReports, started));

        let started = Instant::now();
        let dictionary = PathDictionary::load(&self.config)
            .and_then(|d| d.persist(warehouse).map(|_| d))
            .map_err(|e| stage_error(BuildStage::BuildDictionary, e))?;
        stages.push(timing(BuildStage::BuildDictionary, started));

        let started = Instant::now();
        let fact_stats = FactTableBuilder::new(&dictionary)
            .build(warehouse, &reports)
            .map_err(|e| stage_error(BuildStage::BuildFacts, e))?;
        stages.push(timing(BuildStage::BuildFacts, started));

        let started = Instant::now();
        warehouse
            .create_indexes()
            .map_err(|e| stage_error(BuildStage::Index, e))?;
        stages.push(timing(BuildStage::Index, started));

        let started = Instant::now();
        let derived = DerivedViewEngine::new(warehouse, self.config.denominator_path.as_deref())
            .run()
            .map_err(|e| stage_error(BuildStage::DeriveViews, e))?;
        stages.push(timing(BuildStage::DeriveViews, started));
        stages.push(StageTiming {
            stage: BuildStage::Done,
            elapsed_ms: 0,
        });

        let sites: BTreeSet<String> = reports.iter().map(|r| r.site.clone()).collect();
        Ok(BuildSummary {
            run_id,
            warehouse: self.config.warehouse_path.clone(),
            files_loaded: reports.len(),
            files_skipped: skipped,
            records_loaded: fact_stats.records_in,
            records_dropped: fact_stats.dropped_unmatched,
            coerced_counts: reports.iter().map(|r| r.coerced_counts).sum(),
            coerced_dates: reports.iter().map(|r| r.coerced_dates).sum(),
            concepts: dictionary.len(),
            facts: fact_stats.facts_out,
            sites: sites.into_iter().collect(),
            derived,
            stages,
        })
    }

    fn load_reports(&self) -> Result<(Vec<SiteReport>, Vec<SkippedReport>)> {
        let files = discover_reports(&self.config.reports_dir, &self.config.report_extension)?;
        info!(
            "Found {} report files in {}",
            files.len(),
            self.config.reports_dir.display()
        );

        let loader = ReportLoader::from_config(&self.config);
        let mut reports = Vec::with_capacity(files.len());
        let mut skipped = Vec::new();
        for file in files {
            match loader.load(&file) {
                Ok(report) => reports.push(report),
                Err(e) if self.config.skip_malformed_reports && e.is_input_format() => {
                    warn!("Skipping {}: {}", file.display(), e);
                    skipped.push(SkippedReport {
                        file,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok((reports, skipped))
    }
}

fn stage_error(stage: BuildStage, source: WarehouseError) -> WarehouseError {
    WarehouseError::Stage {
        stage: stage.as_str(),
        source: Box::new(source),
    }
}

fn timing(stage: BuildStage, started: Instant) -> StageTiming {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!("{} finished in {} ms", stage.as_str(), elapsed_ms);
    StageTiming { stage, elapsed_ms }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(BuildStage::LoadReports.as_str(), "LOAD_REPORTS");
        assert_eq!(
            serde_json::to_string(&BuildStage::DeriveViews).unwrap(),
            "\"DERIVE_VIEWS\""
        );
    }

    #[test]
    fn test_stage_error_keeps_input_format_kind() {
        let err = stage_error(
            BuildStage::LoadReports,
            WarehouseError::input_format("report_x.csv", "missing required column"),
        );
        assert!(err.is_input_format());
        assert!(err.to_string().contains("LOAD_REPORTS"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = WarehouseConfig::default();
        config.outlier_threshold = f64::NAN;
        assert!(BuildPipeline::new(config).is_err());
    }
}
