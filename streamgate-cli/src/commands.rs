//! CLI command implementations

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use streamgate_core::config::GatewayConfig;
use streamgate_core::cookies::CookieStore;
use streamgate_web::run_server;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind to
        #[arg(short, long, default_value = "9000")]
        port: u16,
        /// Path to the JSON cookie file
        #[arg(long)]
        cookies: Option<PathBuf>,
    },
    /// Validate a cookie file and show what the store would load
    CheckCookies {
        /// Path to the JSON cookie file
        path: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            host,
            port,
            cookies,
        } => serve(host, port, cookies).await,
        Commands::CheckCookies { path } => check_cookies(path),
    }
}

async fn serve(host: String, port: u16, cookies: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = GatewayConfig::from_env();
    if cookies.is_some() {
        config.cookies.path = cookies;
    }

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))?;

    run_server(config, addr)
        .await
        .map_err(|error| anyhow::anyhow!("server failed: {error}"))
}

fn check_cookies(path: PathBuf) -> anyhow::Result<()> {
    let store = Arc::new(CookieStore::new());
    store
        .load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    println!("Loaded {}", path.display());
    for (service, count) in store.service_counts() {
        println!("  {service}: {count} cookie(s)");
    }

    let quarantined = store.quarantined_keys();
    if quarantined.is_empty() {
        println!("  no unrecognized entries");
    } else {
        println!("  unrecognized entries preserved verbatim:");
        for key in quarantined {
            println!("    {key}");
        }
    }

    Ok(())
}
