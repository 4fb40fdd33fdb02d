use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tubecrawl_core::new_task_token;
use tubecrawl_storage::{CrawlStore, PgStore};
use tubecrawl_sync::{build_queue, build_store, load_channel_registry, CrawlConfig, CrawlRequest, RunOutcome, TaskReport};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "tubecrawl")]
#[command(about = "Batched, fault-tolerant channel crawler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl a single channel URL.
    Crawl {
        url: String,
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=500))]
        max_items: Option<u64>,
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=100))]
        batch_size: Option<u64>,
        /// Fetch items one at a time instead of in parallel batches.
        #[arg(long)]
        sequential: bool,
        #[arg(long)]
        token: Option<String>,
    },
    /// Crawl every enabled channel in the registry file.
    CrawlMany {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print a task record as JSON.
    Status { token: String },
    /// Apply database migrations to `DATABASE_URL`.
    Migrate,
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current batch");
            trigger.cancel();
        }
    });
    cancel
}

fn print_report(report: &TaskReport) {
    match &report.outcome {
        RunOutcome::Completed(summary) => println!(
            "crawl complete: task={} channel={} scraped={}/{} runs={} elapsed={:.1}s",
            report.task_token,
            summary.channel_id,
            summary.items_scraped,
            summary.total_items,
            report.runs,
            summary.elapsed.as_secs_f64()
        ),
        RunOutcome::Failed { error } => println!(
            "crawl failed: task={} url={} runs={} error={}",
            report.task_token, report.source_url, report.runs, error
        ),
        RunOutcome::RetryRequested { .. } => {
            println!("crawl pending retry: task={}", report.task_token)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let cli = Cli::parse();
    let config = CrawlConfig::from_env()?;

    match cli.command.unwrap_or(Commands::CrawlMany { file: None }) {
        Commands::Crawl {
            url,
            max_items,
            batch_size,
            sequential,
            token,
        } => {
            let queue = build_queue(&config, cancel_on_ctrl_c()).await?;
            let mut request = CrawlRequest::new(token.unwrap_or_else(new_task_token), url)
                .with_max_items(max_items.map_or(config.max_items, |v| v as usize))
                .with_batch_size(batch_size.map_or(config.batch_size, |v| v as usize));
            if sequential {
                request = request.sequential();
            }
            let report = queue.submit(request).await?;
            print_report(&report);
            if !matches!(report.outcome, RunOutcome::Completed(_)) {
                bail!("task {} did not complete", report.task_token);
            }
        }
        Commands::CrawlMany { file } => {
            let path = file.unwrap_or_else(|| config.registry_path.clone());
            let entries = load_channel_registry(&path)?.group_entries(config.max_items);
            if entries.is_empty() {
                warn!(path = %path.display(), "no enabled channels in registry");
                return Ok(());
            }
            info!(channels = entries.len(), "dispatching channel group");
            let queue = build_queue(&config, cancel_on_ctrl_c()).await?;
            let mut failed = 0;
            for report in queue.dispatch_group(entries).await {
                match report {
                    Ok(report) => {
                        print_report(&report);
                        if !matches!(report.outcome, RunOutcome::Completed(_)) {
                            failed += 1;
                        }
                    }
                    Err(err) => {
                        eprintln!("task error: {err:#}");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} channel crawl(s) did not complete");
            }
        }
        Commands::Status { token } => {
            if config.database_url.is_none() {
                warn!("DATABASE_URL not set; the in-memory store holds no tasks from other runs");
            }
            let store = build_store(&config).await?;
            let task = store
                .get_task(&token)
                .await?
                .with_context(|| format!("task {token} not found"))?;
            let channel = match &task.channel_id {
                Some(channel_id) => store.get_channel(channel_id).await?,
                None => None,
            };
            let stored_items = match &task.channel_id {
                Some(channel_id) => store.list_items(channel_id).await?.len(),
                None => 0,
            };
            let view = serde_json::json!({
                "task": task,
                "channel": channel,
                "stored_items": stored_items,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url, config.db_max_connections).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
