//! `RelayGate` admin daemon
//!
//! Runs the content sync, payment, retention and grant expiry engines for a
//! self-hosted Nostr relay, or a single pass of one of them.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use relaygate_admin::storage::SyncStatus;
use relaygate_admin::sync::SyncRequest;
use relaygate_admin::{ServiceDeps, Services};
use relaygate_core::config::load_config;
use relaygate_core::tracing_init::{LogFormat, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "relaygate-admin")]
#[command(version, about = "RelayGate admin control plane for a self-hosted Nostr relay")]
struct Args {
    /// Config file (JSON), layered over ~/.config/relaygate/settings.json
    #[arg(long, env = "RELAYGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Admin database file path
    #[arg(long, env = "RELAYGATE_ADMIN_DB")]
    admin_db: Option<PathBuf>,

    /// Event database file path
    #[arg(long, env = "RELAYGATE_EVENTS_DB")]
    events_db: Option<PathBuf>,

    /// Log level for relaygate crates (overridden by `RUST_LOG`)
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every engine until Ctrl+C or SIGTERM (default)
    Serve,

    /// Mirror events of the given authors from peer relays, then exit
    Sync {
        /// Author pubkeys (hex or npub)
        #[arg(required = true)]
        pubkeys: Vec<String>,

        /// Peer relay URL; repeatable. Defaults to the configured relays.
        #[arg(long = "relay")]
        relays: Vec<String>,

        /// Event kind to fetch; repeatable. Defaults to all kinds.
        #[arg(long = "kind")]
        kinds: Vec<u16>,

        /// Only fetch events created at or after this unix timestamp
        #[arg(long)]
        since: Option<i64>,
    },

    /// Run one retention pass now
    RunRetention,

    /// Run one grant expiry pass now
    RunExpiry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if args.admin_db.is_some() {
        config.storage.admin_db_path.clone_from(&args.admin_db);
    }
    if args.events_db.is_some() {
        config.storage.events_db_path.clone_from(&args.events_db);
    }
    if args.log_level.is_some() {
        config.log_level.clone_from(&args.log_level);
    }

    init_tracing(
        "relaygate_admin=info",
        config.log_level.as_deref(),
        LogFormat::from_flag(args.log_json),
    )?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting relaygate-admin");

    let deps = ServiceDeps::open(&config).await?;
    let services = Services::new(deps, &config)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&services).await?,
        Command::Sync {
            pubkeys,
            relays,
            kinds,
            since,
        } => {
            let request = SyncRequest {
                pubkeys,
                relays,
                kinds,
                since,
            };
            run_sync(&services, request).await?;
        }
        Command::RunRetention => {
            let report = services.retention().run_once().await?;
            info!(
                deleted = report.expired_deleted,
                requests = report.requests_processed,
                requested_deleted = report.requested_deleted,
                "Retention pass finished"
            );
        }
        Command::RunExpiry => {
            let expired = services.expiry().run_once().await?;
            info!(expired, "Expiry pass finished");
        }
    }

    Ok(())
}

async fn serve(services: &Services) -> anyhow::Result<()> {
    services.start().await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    sd_notify::notify(false, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!("relaygate-admin ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    #[cfg(unix)]
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);

    services.stop().await;
    info!("relaygate-admin stopped");
    Ok(())
}

async fn run_sync(services: &Services, request: SyncRequest) -> anyhow::Result<()> {
    let sync = services.sync();
    // A `serve` process may own the running job; let the DB guard reject us.
    let job_id = sync.start_sync(request).await?;
    info!(job_id = %job_id, "Sync started");

    let interrupted = tokio::select! {
        () = sync.wait() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        info!(job_id = %job_id, "Cancelling sync");
        let _ = sync.cancel_sync().await;
        while sync.current_job_id().await.is_some() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let job = sync.get_job(&job_id).await?;
    info!(
        job_id = %job.id,
        status = job.status.as_str(),
        fetched = job.events_fetched,
        stored = job.events_stored,
        skipped = job.events_skipped,
        "Sync finished"
    );
    if job.status == SyncStatus::Failed {
        warn!(error = %job.error_message, "Sync failed");
        anyhow::bail!("sync job {} failed: {}", job.id, job.error_message);
    }
    Ok(())
}
