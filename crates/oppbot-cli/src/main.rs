use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oppbot_core::Category;
use oppbot_storage::{OpportunityStore, PgOpportunityStore};
use oppbot_sync::{build_pipeline, build_scheduler, StoreSettings, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "oppbot")]
#[command(about = "Collects entry-level tech opportunities and posts a daily digest")]
struct Cli {
    /// Drop postings older than this many days.
    #[arg(long, global = true)]
    days_needed: Option<u32>,

    /// Create the opportunities table and exit.
    #[arg(long, global = true)]
    create: bool,

    /// Use an in-memory store and log the digest instead of posting it.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect, filter, store and send one digest.
    Run,
    /// Print every stored opportunity.
    List,
    /// Mark processed opportunities unprocessed again.
    Reset {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Delete every opportunity of one category.
    Purge {
        #[arg(long)]
        category: Category,
    },
    /// Run on the configured cron schedule until Ctrl-C.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn database_store() -> Result<PgOpportunityStore> {
    let settings = StoreSettings::from_env()?;
    PgOpportunityStore::connect(&settings.database_url, &settings.table)
        .await
        .context("connecting to postgres")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let days_needed = cli.days_needed.map(i64::from);

    if cli.create {
        let store = database_store().await?;
        store.create_schema().await.context("creating schema")?;
        println!("table {} ready", store.table());
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = oppbot_sync::run_once_from_env(cli.dry_run, days_needed).await?;
            println!(
                "run complete: run_id={} candidates={} kept={} inserted={} dispatched={} delivered={}",
                summary.run_id,
                summary.candidates,
                summary.kept,
                summary.inserted,
                summary.dispatched,
                summary.delivered
            );
        }
        Commands::List => {
            let store = database_store().await?;
            for row in store.list_all().await? {
                let opp = &row.opportunity;
                println!(
                    "{:>6}  {:<11}  {:<5}  {} | {} | {} | {}",
                    row.id,
                    opp.category,
                    opp.processed,
                    opp.employer,
                    opp.title,
                    opp.location,
                    opp.url
                );
            }
        }
        Commands::Reset { limit } => {
            let store = database_store().await?;
            let reset = store.reset_processed(Some(limit)).await?;
            println!("reset {reset} opportunities to unprocessed");
        }
        Commands::Purge { category } => {
            let store = database_store().await?;
            let deleted = store.delete_category(category).await?;
            println!("deleted {deleted} {category} opportunities");
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env(cli.dry_run)?;
            let pipeline = Arc::new(build_pipeline(&config, days_needed).await?);
            let mut sched = build_scheduler(pipeline, &config.schedule_crons).await?;
            sched.start().await.context("starting scheduler")?;
            info!(jobs = config.schedule_crons.len(), "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
