use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gnavi_core::default_org_directory;
use gnavi_scrape::{FetchConfig, Scraper, TargetRegistry};
use gnavi_sync::{audit, PgGrantStore, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gnavi")]
#[command(about = "Grant Navi command-line interface")]
struct Cli {
    /// Path to the scrape target registry.
    #[arg(long, default_value = "sources.yaml")]
    sources: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch grant listings for one target group and write them to CSV.
    Scrape { group: ScrapeGroup },
    /// Reconcile all fetched CSV files into the database, then sweep.
    Sync,
    /// Collapse duplicate titles already persisted in the database.
    Sweep,
    /// Report data-quality anomalies without changing anything.
    Audit,
    /// Apply pending database migrations.
    Migrate,
    /// Run the web UI.
    Serve,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScrapeGroup {
    National,
    Prefecture,
    City,
}

impl ScrapeGroup {
    fn registry_name(self) -> &'static str {
        match self {
            ScrapeGroup::National => "national",
            ScrapeGroup::Prefecture => "prefecture",
            ScrapeGroup::City => "city",
        }
    }

    fn output_file(self) -> &'static str {
        match self {
            ScrapeGroup::National => "fetched_national_grants.csv",
            ScrapeGroup::Prefecture => "fetched_pref_yamagata.csv",
            ScrapeGroup::City => "fetched_city_yamagata.csv",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Scrape { group } => scrape(&cli.sources, group).await,
        Commands::Sync => sync().await,
        Commands::Sweep => sweep().await,
        Commands::Audit => audit_cmd().await,
        Commands::Migrate => migrate().await,
        Commands::Serve => gnavi_web::serve_from_env().await,
    }
}

async fn scrape(sources: &PathBuf, group: ScrapeGroup) -> Result<()> {
    let registry = TargetRegistry::load(sources)
        .with_context(|| format!("loading targets from {}", sources.display()))?;
    let targets = registry.group(group.registry_name());
    anyhow::ensure!(
        !targets.is_empty(),
        "no targets in group '{}'",
        group.registry_name()
    );

    let scraper = Scraper::new(FetchConfig::default())?;
    let drafts = scraper.run(targets).await;

    let data_dir = std::env::var("GNAVI_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {data_dir}"))?;
    let out_path = PathBuf::from(data_dir).join(group.output_file());
    gnavi_scrape::write_drafts_csv(&out_path, &drafts)?;
    info!(
        "scrape complete: group={} grants={} output={}",
        group.registry_name(),
        drafts.len(),
        out_path.display()
    );
    Ok(())
}

async fn sync() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = PgGrantStore::connect(&config.database_url).await?;
    store.migrate().await?;
    let pipeline = SyncPipeline::new(store, default_org_directory());
    let summary = pipeline.run(&config.default_sources()).await;
    for source in &summary.sources {
        println!("{}: {} ({})", source.label, source.status, source.message);
    }
    println!("duplicates removed: {}", summary.deleted_duplicates);
    Ok(())
}

async fn sweep() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = PgGrantStore::connect(&config.database_url).await?;
    let pipeline = SyncPipeline::new(store, default_org_directory());
    let deleted = pipeline.sweep().await?;
    println!("duplicates removed: {deleted}");
    Ok(())
}

async fn audit_cmd() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = PgGrantStore::connect(&config.database_url).await?;
    let report = audit(&store).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn migrate() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = PgGrantStore::connect(&config.database_url).await?;
    store.migrate().await?;
    println!("migrations applied");
    Ok(())
}
