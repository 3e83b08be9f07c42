// Casework - human-gated consulting analysis pipeline
// Main entry point

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use casework::config::load_config;
use casework::server;

#[derive(Parser)]
#[command(name = "casework", about = "Human-gated consulting analysis pipeline server")]
struct Cli {
    /// Bind address, e.g. 127.0.0.1:3001
    #[arg(long)]
    bind: Option<String>,

    /// Path to the SQLite database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Default model identifier for agent calls
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "casework=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config()?;
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(model) = cli.model {
        config.default_model = model;
    }

    server::serve(config).await
}
