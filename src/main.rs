use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use palace::config::PalaceConfig;
use palace::server;

#[derive(Parser)]
#[command(
    name = "palace",
    version,
    about = "Memory Palace — persistent, auditable, searchable memory for AI agents over MCP"
)]
struct Cli {
    /// Path to a config file (default: ~/.palace/config.toml)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server on stdio
    Serve,
    /// Start the HTTP listener (MCP at /mcp + maintenance control plane)
    ServeHttp,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PalaceConfig::load_from(path)?,
        None => PalaceConfig::load()?,
    };

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => server::serve_stdio(config).await?,
        Command::ServeHttp => server::serve_http(config).await?,
    }

    Ok(())
}
