use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use totalnum_warehouse::query::WarehouseReader;
use totalnum_warehouse::{BuildPipeline, Scale, WarehouseConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "totalnum-build")]
#[command(about = "Cross-site patient-count warehouse builder")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of per-site report files
    #[arg(long)]
    reports_dir: Option<PathBuf>,

    /// Reference taxonomy CSV
    #[arg(long)]
    reference_file: Option<PathBuf>,

    /// Warehouse file to build or query
    #[arg(long)]
    warehouse: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the warehouse from scratch
    Build {
        /// Concept path whose latest count is each site's denominator
        #[arg(long)]
        denominator_path: Option<String>,

        /// Skip malformed report files instead of aborting
        #[arg(long)]
        skip_malformed: bool,
    },
    /// List sites present in the warehouse
    Sites,
    /// Concepts where a site deviates from the cross-site mean
    Outliers {
        site: String,

        /// Standard deviations from the mean (default from config)
        #[arg(long)]
        threshold: Option<f64>,

        /// Compare percent-of-denominator values instead of raw counts
        #[arg(long)]
        percent: bool,
    },
    /// Branches a site does not report
    Missing {
        site: String,

        /// Print an indented outline instead of JSON rows
        #[arg(long)]
        outline: bool,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = WarehouseConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(dir) = args.reports_dir {
        config.reports_dir = dir;
    }
    if let Some(file) = args.reference_file {
        config.reference_file = file;
    }
    if let Some(path) = args.warehouse {
        config.warehouse_path = path;
    }

    match args.command {
        Commands::Build {
            denominator_path,
            skip_malformed,
        } => {
            if denominator_path.is_some() {
                config.denominator_path = denominator_path;
            }
            config.skip_malformed_reports |= skip_malformed;
            run_build(config)
        }
        Commands::Sites => {
            let reader = WarehouseReader::open(&config.warehouse_path, config.delimiter)?;
            print_json(&reader.sites()?)
        }
        Commands::Outliers {
            site,
            threshold,
            percent,
        } => {
            let reader = WarehouseReader::open(&config.warehouse_path, config.delimiter)?;
            let scale = if percent { Scale::Percent } else { Scale::Absolute };
            let threshold = threshold.unwrap_or(config.outlier_threshold);
            print_json(&reader.site_outliers(&site, threshold, scale)?)
        }
        Commands::Missing { site, outline } => {
            let reader = WarehouseReader::open(&config.warehouse_path, config.delimiter)?;
            if outline {
                for line in reader.missingness_outline(&site)? {
                    let marker = if line.missing { "*" } else { "" };
                    println!("{}{}{}", "  ".repeat(line.indent), line.label, marker);
                }
                Ok(())
            } else {
                print_json(&reader.missingness(&site)?)
            }
        }
    }
}

fn run_build(config: WarehouseConfig) -> Result<()> {
    info!(
        "Building {} from {}",
        config.warehouse_path.display(),
        config.reports_dir.display()
    );
    let pipeline = BuildPipeline::new(config)?;
    let summary = pipeline.run().context("Warehouse build failed")?;
    print_json(&summary)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
