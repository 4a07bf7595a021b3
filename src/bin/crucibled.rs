//! Crucible worker daemon - executes work items for a controlling process.
//!
//! `crucibled` is spawned by the daemon starter, binds a Unix socket at the
//! path it was given, and serves exactly one controller connection. Requests
//! are executed one at a time by a single worker session; log output and
//! responses travel back on the same stream so log lines always precede the
//! outcome they belong to. The process exits when the session's termination
//! gate releases (a stop request, a run-then-stop request, or the controller
//! going away).
//!
//! ## Usage
//!
//! Typically launched by the starter, never by hand:
//! `crucibled --socket <path> --worker-id <id> --isolation <flat|hierarchical>`
//!
//! ## Files
//!
//! - `<socket>` - Unix socket the controller connects to
//! - `<log-dir>/<worker-id>.log` - worker log file

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crucible::daemon::relay::RelayLayer;
use crucible::daemon::{LogRelay, WorkerListener, WorkerSession, serve};
use crucible::isolation::{IsolationMode, resolver_for};
use crucible::retention::{LogRetention, prune_expired_logs};
use crucible::scope::ServiceScope;
use crucible::work::{DISPATCHER_KIND, builtin};
use crucible::{config, error::Result};

#[derive(Parser)]
#[command(name = "crucibled", version, about = "Crucible worker daemon")]
struct Args {
    /// Unix socket path to bind.
    #[arg(long)]
    socket: PathBuf,

    /// Identifier for this worker, used in log output and file names.
    #[arg(long, default_value_t = config::new_worker_id())]
    worker_id: String,

    /// How work kinds resolve: pre-declared at spawn time (flat) or declared
    /// on each request (hierarchical).
    #[arg(long, value_enum, default_value_t = IsolationMode::Hierarchical)]
    isolation: IsolationMode,

    /// Work kinds pre-declared into the shared namespace. Flat mode only.
    #[arg(long = "work")]
    work: Vec<String>,

    /// Directory for the worker log file. Defaults to the standard daemon
    /// log directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Bootstrap work kind the session instantiates at startup.
    #[arg(long, default_value = DISPATCHER_KIND)]
    bootstrap: String,

    /// Remove log files older than this many days on startup. 0 disables
    /// pruning.
    #[arg(long, default_value_t = 7)]
    log_retention_days: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_dir = match &args.log_dir {
        Some(dir) => dir.clone(),
        None => config::worker_log_dir(&config::daemon_dir()?),
    };
    std::fs::create_dir_all(&log_dir)?;

    let (sink, events) = mpsc::unbounded_channel();
    let relay = LogRelay::new(sink);
    let _guard = init_logging(&log_dir, &args.worker_id, relay.clone())?;

    tracing::info!(
        worker_id = %args.worker_id,
        "crucibled starting, version {}",
        env!("CARGO_PKG_VERSION")
    );

    let retention = if args.log_retention_days > 0 {
        LogRetention::days(args.log_retention_days)
    } else {
        LogRetention::Disabled
    };
    tracing::info!("log retention: {}", retention.describe());
    match prune_expired_logs(&log_dir, retention, chrono::Utc::now()) {
        Ok(removed) if removed > 0 => {
            tracing::info!("removed {removed} expired log files");
        }
        Err(e) => tracing::warn!("log cleanup failed: {e}"),
        _ => {}
    }

    let listener = WorkerListener::bind(&args.socket)?;
    tracing::info!(
        mode = %args.isolation,
        "crucibled listening on {:?}",
        listener.socket_path()
    );

    let resolver = resolver_for(
        args.isolation,
        builtin::bootstrap(),
        builtin::catalog(),
        &args.work,
    );
    let services = ServiceScope::root().build();
    let (session, released) =
        WorkerSession::initialize(&args.bootstrap, &services, resolver, relay);

    let stream = listener.accept().await?;
    tracing::debug!("controller connected");

    serve(Arc::clone(&session), stream, events, released).await?;

    tracing::info!("crucibled shutdown complete");
    Ok(())
}

/// Initialize logging: a non-blocking file layer for the worker's own log
/// file, plus the relay layer that forwards events to the controller.
///
/// The returned guard must be kept alive for the duration of the program so
/// buffered log output is flushed on exit.
fn init_logging(log_dir: &std::path::Path, worker_id: &str, relay: LogRelay) -> Result<WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let file_appender =
        tracing_appender::rolling::never(log_dir, format!("{worker_id}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .with(RelayLayer::new(relay))
        .init();

    Ok(guard)
}
