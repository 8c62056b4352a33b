use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mediaflow::config::AppConfig;
use mediaflow::dead_letter::DeadLetterFilter;
use mediaflow::logging;
use mediaflow::services::ServiceContainer;

/// Inspect and repair the mediaflow job store.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SQLite database URL
    #[arg(long, env = "MEDIAFLOW_DATABASE_URL")]
    database_url: Option<String>,

    /// Output the result in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show persisted job counts, or the latest job of one item
    Status {
        /// Item to look up
        #[arg(long)]
        item: Option<String>,
    },
    /// Triage dead-lettered operations
    #[command(subcommand)]
    DeadLetters(DeadLetterCommand),
    /// Detect (and with --apply, repair) inconsistent persisted state
    Reconcile {
        /// Apply fixes instead of reporting them
        #[arg(long)]
        apply: bool,
        /// Seconds since the last update before an unfinished job counts as
        /// interrupted
        #[arg(long)]
        stale_after_secs: Option<u64>,
        /// Treat every unfinished job as interrupted, however recent. Only
        /// safe when no server is using the store.
        #[arg(long, conflicts_with = "stale_after_secs")]
        fail_untracked: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DeadLetterCommand {
    /// List dead letters, newest first
    List {
        #[arg(long)]
        item: Option<String>,
        #[arg(long)]
        operation: Option<String>,
        /// Include processed and archived records
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Archive processed dead letters older than the given age
    Archive {
        #[arg(long, default_value_t = 30)]
        older_than_days: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_env().context("Failed to load configuration")?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    // Offline maintenance: no background work.
    config.reconcile.enabled = false;
    config.dead_letter.auto_reprocess = false;
    if let Command::Reconcile {
        stale_after_secs,
        fail_untracked,
        ..
    } = &args.command
    {
        if *fail_untracked {
            config.reconcile.stale_after_secs = 0;
        } else if let Some(secs) = stale_after_secs {
            config.reconcile.stale_after_secs = *secs;
        }
    }

    let (_logging, _guard) = logging::init_logging(&config.logging)?;

    let services = ServiceContainer::builder()
        .config(config)
        .build()
        .await
        .context("Failed to open the job store")?;

    let result = run(&services, args.command, args.json).await;
    services.shutdown(Duration::from_secs(5)).await;
    result
}

async fn run(services: &ServiceContainer, command: Command, json: bool) -> anyhow::Result<()> {
    match command {
        Command::Status { item: Some(item) } => {
            let job = services
                .get_job_status(&item)
                .await
                .with_context(|| format!("No job found for item {item}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                println!("job:      {}", job.job_id);
                println!("item:     {}", job.item_id);
                println!("status:   {}", job.status);
                println!("stage:    {}", job.stage_label);
                println!("progress: {:.0}%", job.progress_percent);
                println!("message:  {}", job.message);
                for (stage, count) in &job.stage_counts {
                    println!("  {stage}: {count}");
                }
                if let Some(error) = &job.error {
                    println!("error:    {error}");
                }
            }
        }
        Command::Status { item: None } => {
            let counts = services.persisted_job_counts().await?;
            if json {
                let counts: serde_json::Map<String, serde_json::Value> = counts
                    .into_iter()
                    .map(|(status, count)| (status, serde_json::Value::from(count)))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else if counts.is_empty() {
                println!("No jobs recorded");
            } else {
                for (status, count) in counts {
                    println!("{status:<12}{count}");
                }
            }
        }
        Command::DeadLetters(DeadLetterCommand::List {
            item,
            operation,
            all,
            limit,
        }) => {
            let mut filter = if all {
                DeadLetterFilter {
                    include_archived: true,
                    ..Default::default()
                }
            } else {
                DeadLetterFilter::pending()
            };
            if let Some(item) = item {
                filter = filter.with_item(item);
            }
            if let Some(operation) = operation {
                filter = filter.with_operation(operation);
            }
            let records = services
                .get_dead_letter_items(&filter.with_limit(limit))
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No dead letters");
            } else {
                for record in records {
                    println!(
                        "{}  {}  {}  retries={}  processed={}  {}",
                        record.id,
                        record.item_id,
                        record.operation,
                        record.retry_count,
                        record.processed,
                        record.error_message
                    );
                }
            }
        }
        Command::DeadLetters(DeadLetterCommand::Archive { older_than_days }) => {
            let archived = services
                .dead_letters()
                .archive_processed(Duration::from_secs(older_than_days * 24 * 3600))
                .await?;
            println!("Archived {archived} dead letters");
        }
        Command::Reconcile { apply, .. } => {
            let report = services.reconciler().run(!apply).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} issues found, {} fixed{}",
                    report.issues_found,
                    report.fixes_applied,
                    if report.dry_run { " (dry run)" } else { "" }
                );
                for (kind, count) in &report.by_kind {
                    println!("  {kind}: {count}");
                }
            }
        }
    }
    Ok(())
}
