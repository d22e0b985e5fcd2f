//! Noesis server
//!
//! Boots the engine, wires every store into the shared context, and serves
//! the SSE chat API.

mod routes;
mod state;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::state::AppContext;

#[derive(Debug, Parser)]
#[command(name = "noesis-server", version, about = "Cognitive augmentation layer for LLM chat")]
struct Cli {
    /// Database path (defaults to the platform data directory)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1:8100")]
    bind: String,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "noesis_core=info,noesis_server=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let ctx = match AppContext::build(cli.db_path.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            // A failed integrity check at startup is fatal; a half-wired
            // engine must not serve traffic
            tracing::error!("Startup integrity check failed: {e}");
            std::process::exit(1);
        }
    };

    let app = routes::router(ctx);
    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    tracing::info!("noesis-server {} listening on {}", noesis_core::VERSION, cli.bind);
    axum::serve(listener, app).await?;
    Ok(())
}
