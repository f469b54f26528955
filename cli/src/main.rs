mod config;
mod logging;
mod server;

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use kundelik_core::auth::{MAX_TOKEN_TTL_DAYS, MIN_TOKEN_TTL_DAYS, TokenIssuer};
use kundelik_core::db::Database;

#[derive(Parser)]
#[command(
    name = "kundelik",
    version,
    about = "Pet registry and personal health tracker API"
)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Database file (default: kundelik.db in the data directory)
        #[arg(long, env = "KUNDELIK_DB")]
        db: Option<PathBuf>,
        /// Token signing secret (default: generated and stored in the data directory)
        #[arg(long, env = "KUNDELIK_JWT_SECRET", hide_env_values = true)]
        jwt_secret: Option<String>,
        /// Access token lifetime in days (1-7)
        #[arg(long, env = "KUNDELIK_TOKEN_TTL_DAYS", default_value = "7")]
        token_ttl_days: i64,
    },
    /// Replace the stored token signing secret, logging out every client
    RotateSecret,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_tracing(cli.debug) {
        eprintln!("Warning: failed to initialise logging: {e:#}");
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            db,
            jwt_secret,
            token_ttl_days,
        } => {
            let db_path = db.unwrap_or_else(|| config.db_path.clone());
            let db = Database::open(&db_path)
                .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

            let secret = match jwt_secret {
                Some(s) if !s.trim().is_empty() => s,
                _ => config.load_or_create_jwt_secret()?,
            };

            if !(MIN_TOKEN_TTL_DAYS..=MAX_TOKEN_TTL_DAYS).contains(&token_ttl_days) {
                tracing::warn!(
                    requested = token_ttl_days,
                    "token lifetime clamped to {MIN_TOKEN_TTL_DAYS}..={MAX_TOKEN_TTL_DAYS} days"
                );
            }
            let tokens = TokenIssuer::new(secret.as_bytes(), token_ttl_days);

            server::start_server(db, tokens, port, &bind).await
        }
        Commands::RotateSecret => {
            config.rotate_jwt_secret()?;
            eprintln!("JWT secret rotated. Restart the server; existing tokens are now invalid.");
            Ok(())
        }
    }
}
