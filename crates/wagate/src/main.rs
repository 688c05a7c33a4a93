use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use wagate::attachment::AttachmentPipeline;
use wagate::auth::ApiKey;
use wagate::backend::SidecarBackend;
use wagate::config::Config;
use wagate::credentials::FileCredentialStore;
use wagate::dispatch::{DispatchQueue, SessionJobExecutor};
use wagate::relay::InboundRelay;
use wagate::request_throttle::RequestThrottle;
use wagate::server::{AppState, build_app};
use wagate::session::SessionManager;

const API_KEY_ENV: &str = "API_KEY";

#[derive(Parser)]
#[command(name = "wagate", version, about = "Multi-session messaging gateway")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(short, long, default_value = "wagate.yaml")]
    config: PathBuf,

    /// Key required on the send endpoints. Defaults to $API_KEY.
    #[arg(long)]
    api_key: Option<String>,

    /// Host to bind (overrides config value).
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config value).
    #[arg(long)]
    port: Option<u16>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable ANSI colours in log output.
    #[arg(long, default_value_t = false)]
    no_ansi: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .await
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let _log_guards = init_logging(&cli, &config.logging.dir)?;
    let api_key = cli
        .api_key
        .clone()
        .or_else(|| std::env::var(API_KEY_ENV).ok())
        .filter(|k| !k.trim().is_empty())
        .with_context(|| format!("{} is not set", API_KEY_ENV))?;

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    // Queue first: the relay enqueues auto replies, the executor drains it.
    let (queue, worker) = DispatchQueue::new(config.dispatch.interval());
    let relay = InboundRelay::new(http.clone(), &config.relay)
        .with_auto_reply(config.auto_reply.clone(), queue.clone());

    let sessions = SessionManager::new(
        config.sessions.clone(),
        Arc::new(
            SidecarBackend::new(config.sidecar.url.clone())
                .with_connect_timeout(config.sidecar.connect_timeout())
                .with_send_timeout(config.sidecar.send_timeout()),
        ),
        Arc::new(FileCredentialStore::new(config.credentials.path.clone())),
        config.session.reconnect_delay(),
    )
    .with_inbound_handler(Arc::new(relay));
    sessions.start_all();

    let shutdown = CancellationToken::new();
    let executor = Arc::new(SessionJobExecutor::new(
        sessions.clone(),
        AttachmentPipeline::new(http, &config.attachments),
    ));
    let worker_task = tokio::spawn(worker.run(executor, shutdown.clone()));

    let state = AppState {
        sessions: sessions.clone(),
        queue,
        api_key: ApiKey::new(api_key),
        throttle: RequestThrottle::new(&config.server.rate_limit),
    };
    let app = build_app(state, config.server.request_timeout_seconds);

    let host = cli.host.as_deref().unwrap_or(&config.server.host);
    let port = cli.port.unwrap_or(config.server.port);
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(addr = %addr, sessions = ?config.sessions, "Gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("Shutting down");
    shutdown.cancel();
    sessions.shutdown().await;
    let _ = worker_task.await;
    Ok(())
}

/// Stdout plus `<dir>/app.log` (everything) and `<dir>/error.log` (errors only).
///
/// The returned guards flush the file writers on drop and must outlive `main`'s work.
fn init_logging(cli: &Cli, dir: &Path) -> Result<[WorkerGuard; 2]> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let (app_writer, app_guard) = tracing_appender::non_blocking(log_file(dir, "app")?);
    let (error_writer, error_guard) = tracing_appender::non_blocking(log_file(dir, "error")?);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_ansi(!cli.no_ansi),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(app_writer),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(error_writer)
                .with_filter(LevelFilter::ERROR),
        )
        .init();

    Ok([app_guard, error_guard])
}

fn log_file(dir: &Path, name: &str) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("failed to open {}/{}.log", dir.display(), name))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
