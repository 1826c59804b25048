use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jdih_monitor::{write_report, Monitor, MonitorConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "jdih")]
#[command(about = "Monitors provincial JDIH portals for new minimum-wage decrees")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Flags that take precedence over the `JDIH_*` environment.
#[derive(Debug, Args)]
struct Overrides {
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    sources_file: Option<PathBuf>,
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[arg(long, global = true)]
    delay_ms: Option<u64>,
}

impl Overrides {
    fn apply(self, mut config: MonitorConfig) -> MonitorConfig {
        if let Some(path) = self.state_file {
            config.state_file = path;
        }
        if let Some(path) = self.download_dir {
            config.download_dir = path;
        }
        if let Some(path) = self.sources_file {
            config.sources_file = Some(path);
        }
        if let Some(path) = self.reports_dir {
            config.reports_dir = Some(path);
        }
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(ms) = self.delay_ms {
            config.request_delay = std::time::Duration::from_millis(ms);
        }
        config
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check sources once and report new documents.
    Check {
        /// Source code to check; repeatable. Defaults to every enabled source.
        #[arg(long = "province", short = 'p')]
        provinces: Vec<String>,
        /// Download files for newly found documents.
        #[arg(long)]
        download: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show per-source last check and ledger counts.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List configured sources.
    List,
    /// Download recorded documents whose file was never retrieved.
    RetryDownloads,
    /// Run checks on a cron schedule until interrupted.
    Watch {
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        download: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.overrides.apply(MonitorConfig::from_env());
    let monitor = Monitor::from_config(&config)?;

    match cli.command.unwrap_or(Commands::Check {
        provinces: Vec::new(),
        download: false,
        json: false,
    }) {
        Commands::Check {
            provinces,
            download,
            json,
        } => {
            let report = monitor.run(&provinces, download).await?;
            if let Some(dir) = &config.reports_dir {
                let written = write_report(&report, dir).await?;
                info!(path = %written.display(), "report written");
            }
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serializing run report")?
                );
            } else {
                print!("{}", report.to_markdown());
            }
        }
        Commands::Status { json } => {
            let status = monitor.status();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status).context("serializing status")?
                );
            } else {
                print!("{}", status.to_text());
            }
        }
        Commands::List => {
            for source in monitor.list() {
                println!(
                    "{:<10} {:<30} {:<12} {}{}",
                    source.code,
                    source.name,
                    source.crawlability.as_str(),
                    if source.enabled { "enabled" } else { "disabled" },
                    if source.implemented { "" } else { " (no adapter)" },
                );
                if let Some(notes) = &source.notes {
                    println!("{:<10} {notes}", "");
                }
            }
        }
        Commands::RetryDownloads => {
            let retry = monitor.retry_downloads().await?;
            println!(
                "retry complete: attempted={} downloaded={} unresolved={} failed={}",
                retry.attempted,
                retry.downloaded.len(),
                retry.unresolved.len(),
                retry.failed.len()
            );
            for failure in retry.unresolved.iter().chain(&retry.failed) {
                println!("  [{}] {}: {}", failure.document.source, failure.document.title, failure.reason);
            }
        }
        Commands::Watch { cron, download } => {
            let cron = cron.unwrap_or_else(|| config.scheduler_cron.clone());
            jdih_monitor::watch(Arc::new(monitor), &cron, download, config.reports_dir.clone()).await?;
        }
    }

    Ok(())
}
