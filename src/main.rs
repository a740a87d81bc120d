//! Catalog Crawler command-line front end

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use catalog_crawler::crawling::{PipelineOrchestrator, RunSummary, discover, read_seed_file, seed_urls};
use catalog_crawler::domain::NaturalKey;
use catalog_crawler::infrastructure::browser::{SessionPool, build_driver};
use catalog_crawler::infrastructure::catalog_repository::{CatalogStore, SqliteCatalogStore};
use catalog_crawler::infrastructure::config::AppConfig;
use catalog_crawler::infrastructure::database_connection::DatabaseConnection;
use catalog_crawler::infrastructure::export::write_csv;
use catalog_crawler::infrastructure::logging::{init_logging_with_config, log_system_info};

#[derive(Parser)]
#[command(name = "catalog-crawler")]
#[command(about = "Browser-driven product catalog crawler")]
#[command(version)]
struct Cli {
    /// Config file (TOML, JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl product pages into the catalog
    Crawl {
        /// Product page URLs
        urls: Vec<String>,

        /// File with one URL per line (`#` starts a comment)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Search query run against each source's site search
        #[arg(short, long)]
        search: Vec<String>,

        /// Restrict search to one source
        #[arg(long)]
        source: Option<String>,
    },

    /// Write catalog entries as CSV
    Export {
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        source: Option<String>,

        /// Include soft-expired entries
        #[arg(long)]
        include_expired: bool,
    },

    /// Print one catalog entry
    Show { source: String, sku: String },

    /// Print the change history of one entry
    Changes { source: String, sku: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = run().await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging_with_config(&config.logging).context("Failed to initialize logging")?;
    log_system_info();

    let db = DatabaseConnection::with_max_connections(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?;
    db.migrate().await.context("Failed to create catalog schema")?;
    let store = Arc::new(SqliteCatalogStore::new(db.pool().clone()));

    match cli.command {
        Commands::Crawl {
            urls,
            file,
            search,
            source,
        } => crawl(&config, store, urls, file, search, source).await,
        Commands::Export {
            output,
            source,
            include_expired,
        } => export(store.as_ref(), output, source.as_deref(), include_expired).await,
        Commands::Show { source, sku } => {
            let key = NaturalKey::new(source, sku);
            let entry = store.find(&key).await?.with_context(|| format!("No catalog entry for {key}"))?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
        Commands::Changes { source, sku } => {
            let key = NaturalKey::new(source, sku);
            let changes = store.changes_for(&key).await?;
            if changes.is_empty() {
                println!("No changes recorded for {key}");
            }
            for change in changes {
                println!(
                    "rev {:>3}  {}  {}",
                    change.revision,
                    change.recorded_at.to_rfc3339(),
                    change.changed_fields.join(", ")
                );
            }
            Ok(())
        }
    }
}

async fn crawl(
    config: &AppConfig,
    store: Arc<SqliteCatalogStore>,
    mut urls: Vec<String>,
    file: Option<PathBuf>,
    search: Vec<String>,
    source: Option<String>,
) -> Result<()> {
    if config.rulesets.is_empty() {
        bail!("No rulesets configured; add at least one [[rulesets]] entry");
    }
    if let Some(path) = &file {
        let lines = read_seed_file(path)
            .await
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        urls.extend(lines);
    }

    let driver = build_driver(&config.browser).context("Failed to set up browser driver")?;
    let pool = SessionPool::new(driver, config.browser.max_sessions, config.browser.session_ttl());
    let orchestrator = PipelineOrchestrator::new(
        config.pipeline.clone(),
        &config.rulesets,
        &config.availability,
        pool.clone(),
        store.clone(),
        store,
    )?;

    let search_sources: Vec<&str> = match source.as_deref() {
        Some(source) => vec![source],
        None => config
            .rulesets
            .iter()
            .filter(|r| r.discovery.is_some())
            .map(|r| r.source.as_str())
            .collect(),
    };
    for query in &search {
        for source in &search_sources {
            match discover(&orchestrator, source, query).await {
                Ok(found) => urls.extend(found.into_iter().map(String::from)),
                Err(e) => warn!("Search '{}' on {} failed: {}", query, source, e),
            }
        }
    }

    let report = seed_urls(&orchestrator, &urls).await?;
    if report.queued() == 0 {
        warn!("Nothing to crawl");
        pool.shutdown().await;
        return Ok(());
    }

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping workers");
            cancel.cancel();
        }
    });

    let result = orchestrator.run().await;
    pool.shutdown().await;
    let summary = result?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let stats = &summary.stats;
    println!(
        "Processed {} tasks in {:.1}s: {} created, {} updated, {} unchanged, {} retries",
        stats.tasks_started,
        stats.elapsed.as_secs_f64(),
        stats.created,
        stats.updated,
        stats.unchanged,
        stats.retries
    );
    if summary.expired > 0 {
        println!("Soft-expired {} entries not seen this run", summary.expired);
    }
    for (label, tasks) in [
        ("Quarantined", &summary.quarantined),
        ("Failed", &summary.failed),
        ("Not processed", &summary.pending),
    ] {
        if tasks.is_empty() {
            continue;
        }
        println!("{label} ({}):", tasks.len());
        for task in tasks {
            println!(
                "  {} [retries: {}] {}",
                task.url,
                task.retry_count,
                task.last_error.as_deref().unwrap_or("-")
            );
        }
    }
    if summary.cancelled {
        println!("Run was cancelled before the queue drained");
    }
}

async fn export(
    store: &dyn CatalogStore,
    output: Option<PathBuf>,
    source: Option<&str>,
    include_expired: bool,
) -> Result<()> {
    let entries = store.list(source, include_expired).await?;
    let written = match &output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            write_csv(&entries, file)?
        }
        None => write_csv(&entries, std::io::stdout().lock())?,
    };
    info!("Exported {} entries", written);
    if let Some(path) = output {
        println!("Exported {written} entries to {}", path.display());
    }
    Ok(())
}
