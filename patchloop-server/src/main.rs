//! patchloop server - JSON API and event streams over a data directory, with
//! a background worker pool draining the task queue.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use patchloop::io::init::{DEFAULT_DATA_DIR, DataPaths};
use patchloop::service::Service;
use patchloop::worker::WorkerPool;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "patchloop-server")]
#[command(about = "HTTP API for submitting and following patchloop tasks")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Data directory created by `patchloop init`
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Worker threads (defaults to `workers` from config)
    #[arg(long)]
    workers: Option<usize>,

    /// Serve the API only; tasks are run by a separate `patchloop work`
    #[arg(long)]
    no_worker: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("patchloop_server=info".parse()?)
                .add_directive("patchloop=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let paths = DataPaths::new(&args.data_dir);
    let service = Service::open(&paths)?;
    info!(data_dir = %paths.root.display(), "starting patchloop-server");

    // Built up front so a missing API key fails startup, not every task.
    let worker = if args.no_worker {
        info!("worker disabled, API-only mode");
        None
    } else {
        let orchestrator = service.orchestrator(paths.artifacts_dir.clone())?;
        Some(orchestrator)
    };

    let stop = Arc::new(AtomicBool::new(false));
    let worker_handle = worker.map(|orchestrator| {
        let stop = Arc::clone(&stop);
        let workers = args.workers;
        thread::spawn(move || {
            let mut pool = WorkerPool::new(&orchestrator);
            if let Some(workers) = workers {
                pool = pool.with_workers(workers);
            }
            match pool.run_forever(&stop) {
                Ok(summary) => info!(
                    completed = summary.completed.len(),
                    failed = summary.failed.len(),
                    "worker pool stopped"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "worker pool failed"),
            }
        })
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .with_state(AppState::new(service));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = worker_handle {
        info!("waiting for in-flight tasks");
        if handle.join().is_err() {
            warn!("worker thread panicked");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
