use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use attendance_dispatch::client::{ApiClient, ApprovalService};
use attendance_dispatch::config;
use attendance_dispatch::driver::BatchDriver;
use attendance_dispatch::governor::PacingGovernor;
use attendance_dispatch::model::{Phase, WorkTarget};

#[derive(Debug, Parser)]
#[command(author, version, about = "Approve pending attendance sessions without tripping messaging rate limits")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Approve every pending session of a group on a date, pacing notifications
    Run {
        /// Session group identifier
        #[arg(long)]
        group: String,
        /// Session date (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,
    },
    /// Approve all pending sessions in one call, without pacing
    ApproveAll,
    /// Reject a single pending session
    Reject {
        #[arg(long)]
        target: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Print an example config file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    let client = Arc::new(ApiClient::from_config(&cfg)?);

    match args.command {
        Command::Run { group, date } => run(client, WorkTarget::new(group, date)).await,
        Command::ApproveAll => {
            let summary = client.approve_all_pending().await?;
            info!(
                approved = summary.approved_count,
                failed = summary.failed_count,
                "approve-all finished"
            );
            Ok(())
        }
        Command::Reject { target, reason } => {
            if client.reject(&target, reason.as_deref()).await? {
                info!(%target, "session rejected");
                Ok(())
            } else {
                Err(anyhow!("backend refused to reject {}", target))
            }
        }
        Command::ExampleConfig => Ok(()),
    }
}

async fn run(client: Arc<ApiClient>, target: WorkTarget) -> Result<()> {
    let mut driver = BatchDriver::new(client, PacingGovernor::uniform());
    let mut updates = driver.subscribe();
    driver.start(target)?;

    let reporter = tokio::spawn(async move {
        let mut last_phase = "";
        while updates.changed().await.is_ok() {
            let p = updates.borrow_and_update().clone();
            match &p.phase {
                // Log a cool-down once when it starts, then every 30s.
                Phase::Cooling { remaining_secs } => {
                    if last_phase != "cooling" || remaining_secs % 30 == 0 {
                        info!(remaining_secs, "cooling down");
                    }
                }
                phase => info!(
                    phase = phase.name(),
                    approved = p.total_approved,
                    sent = p.total_sent_messages,
                    skipped = p.total_skipped_messages,
                    offset = p.current_cursor.offset,
                    "progress"
                ),
            }
            last_phase = p.phase.name();
            if p.phase.is_terminal() {
                break;
            }
        }
    });

    let done = tokio::select! {
        done = driver.wait() => done?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received; cancelling run");
            driver.cancel();
            driver.wait().await?
        }
    };
    if let Err(err) = reporter.await {
        warn!(?err, "progress reporter task failed");
    }

    match done.phase {
        Phase::Completed | Phase::Cancelled => {
            info!(
                phase = done.phase.name(),
                approved = done.total_approved,
                sent = done.total_sent_messages,
                skipped = done.total_skipped_messages,
                steps = done.steps,
                pauses = done.pauses,
                "run finished"
            );
            Ok(())
        }
        Phase::Failed { reason } => Err(anyhow!(
            "run failed after approving {} sessions ({} messages sent, {} skipped): {}",
            done.total_approved,
            done.total_sent_messages,
            done.total_skipped_messages,
            reason
        )),
        other => Err(anyhow!("run ended in unexpected phase {}", other)),
    }
}
