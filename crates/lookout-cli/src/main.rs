use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use lookout_adapters::{CommandNotifier, HtmlListingExtractor, HttpPageFetcher, TracingNotifier};
use lookout_monitor::{MonitorConfig, MonitorLoop};
use lookout_storage::HttpClientConfig;

#[derive(Debug, Parser)]
#[command(name = "lookout")]
#[command(about = "Marketplace listing monitor and notifier")]
struct Cli {
    /// Path to the source/keyword registry file.
    #[arg(long, default_value = "lookout.yaml")]
    config: PathBuf,

    /// Log filter, e.g. "info" or "lookout_monitor=debug".
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log matches instead of raising desktop notifications.
    #[arg(long)]
    no_toast: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll sources repeatedly until Ctrl-C.
    Run,
    /// Run a single cycle and exit.
    Once,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = MonitorConfig::load(&cli.config)?;
    let fetcher = HttpPageFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let notifier: Box<dyn lookout_adapters::Notifier> = if cli.no_toast {
        Box::new(TracingNotifier)
    } else {
        Box::new(CommandNotifier)
    };

    let mut monitor = MonitorLoop::new(
        config,
        Box::new(fetcher),
        Box::new(HtmlListingExtractor),
        notifier,
    )
    .await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; shutting down after current source");
                    let _ = tx.send(true);
                }
            });
            monitor.run(rx).await?;
        }
        Commands::Once => {
            let (_tx, rx) = watch::channel(false);
            let summary = monitor.run_cycle(&rx).await;
            println!(
                "cycle complete: cycle_id={} sources={} failed={} candidates={} matches={}",
                summary.cycle_id,
                summary.sources_polled,
                summary.sources_failed,
                summary.candidates_extracted,
                summary.matches_found
            );
        }
    }

    Ok(())
}
