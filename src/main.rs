use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nav_returns::analysis::alignment::NavGrid;
use nav_returns::analysis::returns::ReturnCalculator;
use nav_returns::config::Config;
use nav_returns::data::ledger::NavLedger;
use nav_returns::data::normalizer::{BatchSchema, Normalizer};
use nav_returns::data::report::{report_path, write_report};

#[derive(Parser)]
#[command(
    name = "nav-returns",
    version,
    about = "Maintain the NAV ledger and compute trailing returns"
)]
struct Cli {
    /// Path to the YAML config
    #[arg(long, default_value = "config/nav_returns.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Commit a daily vendor snapshot to the ledger
    Ingest {
        #[arg(long)]
        file: PathBuf,
        /// Nominal snapshot date; defaults to today minus the reference offset
        #[arg(long)]
        snapshot_date: Option<NaiveDate>,
    },
    /// Commit historical dumps (files or directories of them) as a single batch
    Import {
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },
    /// Compute the returns report from the ledger
    Returns {
        /// Reference date; defaults to today minus the reference offset
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Ingest a daily snapshot, then compute the returns report
    Run {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        snapshot_date: Option<NaiveDate>,
    },
    /// Show the ledger cursor and row count
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let delimiter = config.delimiter_byte()?;
    let ledger = NavLedger::open(&config.paths.ledger_dir, delimiter)
        .context("opening NAV ledger")?;
    let today = Local::now().date_naive() - Duration::days(config.reference_offset_days);

    match cli.command {
        Commands::Ingest {
            file,
            snapshot_date,
        } => ingest(&config, &ledger, &file, snapshot_date.unwrap_or(today)),
        Commands::Import { paths } => import(&config, &ledger, &paths),
        Commands::Returns { as_of } => returns(&config, &ledger, as_of.unwrap_or(today)),
        Commands::Run {
            file,
            snapshot_date,
        } => {
            let snapshot_date = snapshot_date.unwrap_or(today);
            ingest(&config, &ledger, &file, snapshot_date)?;
            returns(&config, &ledger, snapshot_date)
        }
        Commands::Status => {
            let status = ledger.status().context("reading ledger status")?;
            match status.cursor {
                Some(cursor) => println!("last committed batch: {}", cursor),
                None => println!("last committed batch: none"),
            }
            println!("ledger rows: {}", status.rows);
            Ok(())
        }
    }
}

fn normalizer(config: &Config) -> Result<Normalizer> {
    Ok(Normalizer::new(BatchSchema::from_config(config)?))
}

fn ingest(config: &Config, ledger: &NavLedger, file: &Path, snapshot_date: NaiveDate) -> Result<()> {
    let batch = normalizer(config)?
        .normalize_path(file)
        .with_context(|| format!("normalizing {}", file.display()))?;
    let outcome = ledger
        .ingest_snapshot(snapshot_date, &batch)
        .with_context(|| format!("committing snapshot {}", snapshot_date))?;

    if outcome.commit.applied {
        info!(
            %snapshot_date,
            business_date = %outcome.business_date,
            rows = outcome.commit.rows_written,
            "snapshot ingested"
        );
    } else {
        info!(%snapshot_date, "skipping update, already applied for this date");
    }
    Ok(())
}

fn import(config: &Config, ledger: &NavLedger, paths: &[PathBuf]) -> Result<()> {
    let batch = normalizer(config)?
        .normalize_paths(paths)
        .context("normalizing historical dumps")?;
    let Some(batch_date) = batch.latest_date() else {
        info!(inputs = paths.len(), "no valid observations to import");
        return Ok(());
    };
    let outcome = ledger
        .commit(batch_date, &batch.observations)
        .with_context(|| format!("committing history dated {}", batch_date))?;
    info!(%batch_date, applied = outcome.applied, rows = outcome.rows_written, "history imported");
    Ok(())
}

fn returns(config: &Config, ledger: &NavLedger, reference_date: NaiveDate) -> Result<()> {
    let calculator = ReturnCalculator::new(&config.horizons)?;
    let contents = ledger.read_all().context("reading NAV ledger")?;
    let grid = NavGrid::from_observations(&contents.observations);
    info!(
        dates = grid.dates().len(),
        instruments = grid.instruments().len(),
        last_date = ?grid.last_date(),
        "built NAV grid"
    );

    let report = calculator.compute(&grid, reference_date);
    let path = report_path(&config.paths.returns_dir, &report);
    write_report(&path, &report, config.delimiter_byte()?)
        .with_context(|| format!("writing report {}", path.display()))?;
    Ok(())
}
