mod cgi;
mod config;
mod git;
mod hook;
mod http;
mod locks;
mod pattern;
mod validate;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::git::MirrorStore;
use crate::locks::RepoLocks;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "git-proxy", about = "Policy-enforcing git proxy")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pre-receive callback for a mirror.  Invoked by the hook
    /// wrapper installed in each mirror, not by operators.
    PreReceive { repo_name: String },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: MirrorStore,
    pub locks: RepoLocks,
    /// SSH overlay for every git invocation that may reach upstream.
    pub ssh_env: Arc<HashMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

async fn run_server() -> Result<()> {
    let runtime = config::RuntimeConfig::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(runtime.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(config_path = %runtime.config_path.display(), "starting git-proxy");

    let config = config::load_config(&runtime.config_path)?;
    let config = Arc::new(config);
    let ssh_env = Arc::new(config::ssh_env(&runtime, &config));

    // The backend must exist before we accept requests.
    let backend = cgi::backend_path().await?;
    tracing::info!(backend = %backend.display(), "located git-http-backend");

    // Bootstrap every configured mirror.
    let store = MirrorStore::new(&runtime.repos_dir);
    let hook_exe = std::env::current_exe().context("failed to resolve current executable")?;
    for (name, policy) in &config.repos {
        store
            .bootstrap(name, policy, &hook_exe)
            .await
            .with_context(|| format!("failed to bootstrap mirror for repo '{name}'"))?;
    }

    let state = AppState {
        config: Arc::clone(&config),
        store,
        locks: RepoLocks::new(),
        ssh_env,
    };
    let app = http::handler::create_router(Arc::new(state));

    let listen_addr = std::net::SocketAddr::from(([0, 0, 0, 0], runtime.http_port));
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, repos = config.repos.len(), "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("git-proxy shut down cleanly");
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::PreReceive { repo_name }) => {
            // Hook mode: stderr belongs to the git client channel, so no
            // tracing subscriber is installed here.
            let code = match hook::run(&repo_name).await {
                Ok(code) => code,
                Err(err) => {
                    eprintln!("pre-receive: {err:#}");
                    1
                }
            };
            std::process::exit(code);
        }
        None => {
            if let Err(err) = run_server().await {
                eprintln!("git-proxy: {err:#}");
                std::process::exit(1);
            }
        }
    }
}
