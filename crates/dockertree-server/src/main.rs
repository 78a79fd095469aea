//! dockertree-server - RPC surface mirroring the CLI.
//!
//! Listens on a Unix socket for length-framed JSON requests (see
//! `dockertree_core::ipc`) and answers with the same envelope the CLI
//! emits under `--json`. Every request names an absolute working
//! directory; mutating operations require it to contain an initialized
//! project.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod handlers;

/// dockertree RPC server
#[derive(Parser, Debug)]
#[command(name = "dockertree-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the Unix socket
    #[arg(long, default_value = "/tmp/dockertree.sock")]
    socket: PathBuf,

    /// Refresh proxy routes every N seconds (0 disables the watcher)
    #[arg(long, default_value = "0")]
    watch_routes: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if cli.watch_routes > 0 {
        spawn_route_watcher(cli.watch_routes);
    }

    run(&cli.socket).await
}

/// Run the proxy route watcher on a blocking thread, discovering the
/// project from `DOCKERTREE_WORKING_DIR` or the server's own directory.
fn spawn_route_watcher(interval_secs: u64) {
    tokio::task::spawn_blocking(move || {
        let root = std::env::var_os("DOCKERTREE_WORKING_DIR")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok());
        let Some(root) = root else {
            warn!("route watcher disabled: no working directory");
            return;
        };
        let result = (|| -> Result<(), dockertree_core::error::Error> {
            let ctx = dockertree_core::paths::ProjectContext::discover(&root)?;
            let config = dockertree_core::config::ProjectConfig::load(&ctx.root)?;
            let runtime = dockertree_core::runtime::DockerRuntime::new()?;
            let mut coordinator =
                dockertree_core::proxy::ProxyCoordinator::new(&runtime, &config)?;
            let cancel = dockertree_core::orchestrator::CancellationToken::new();
            coordinator.watch(std::time::Duration::from_secs(interval_secs), &cancel);
            Ok(())
        })();
        if let Err(err) = result {
            warn!("route watcher disabled: {err}");
        }
    });
}

/// Bind the socket and serve until interrupted.
async fn run(socket_path: &std::path::Path) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create socket directory")?;
    }

    let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;
    info!("listening on {}", socket_path.display());

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream).await {
                                debug!("connection handler error: {e}");
                            }
                        });
                    },
                    Err(e) => warn!("failed to accept connection: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    Ok(())
}

/// Serve one client: read framed requests, dispatch, write framed
/// responses, until the peer closes.
async fn handle_connection(mut stream: UnixStream) -> Result<()> {
    debug!("new connection");
    loop {
        let Some(payload) = read_frame(&mut stream).await? else {
            debug!("connection closed");
            return Ok(());
        };

        let response = match serde_json::from_slice::<dockertree_core::ipc::IpcRequest>(&payload) {
            Ok(request) => {
                debug!(operation = request.operation(), "dispatching request");
                // Core operations block on external tools; keep the
                // accept loop responsive.
                tokio::task::spawn_blocking(move || handlers::dispatch(&request))
                    .await
                    .unwrap_or_else(|e| {
                        let err = dockertree_core::error::Error::Runtime {
                            tool: "dockertree-server".to_string(),
                            exit_code: None,
                            stderr: format!("handler panicked: {e}"),
                        };
                        dockertree_core::output::CommandOutput::err("server.dispatch", &err)
                    })
            },
            Err(e) => {
                let err = dockertree_core::error::Error::validation(format!(
                    "unparseable request: {e}"
                ));
                dockertree_core::output::CommandOutput::err("server.parse", &err)
            },
        };

        let rendered = serde_json::to_vec(&response).context("failed to render response")?;
        let framed = dockertree_core::ipc::frame_message(&rendered);
        stream
            .write_all(&framed)
            .await
            .context("failed to write response")?;
    }
}

/// Read one length-framed message. Returns `None` on clean EOF.
async fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame length"),
    }
    let length = dockertree_core::ipc::parse_frame_length(prefix)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let mut payload = vec![0u8; length];
    stream
        .read_exact(&mut payload)
        .await
        .context("failed to read frame payload")?;
    Ok(Some(payload))
}
