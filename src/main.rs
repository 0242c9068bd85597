use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod converters;
mod error;
mod headers;
mod jsonpath;
mod metrics;
mod pipeline;
mod resolver;
mod retry;
mod rewrite;
mod server;
mod upstream;

use config::{Logging, ProxyConfig, load_config};

#[derive(Parser)]
#[command(name = "babel", version, about = "Dialect-translating LLM reverse proxy")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Serve,
    /// Validate a configuration file and exit
    Check,
}

fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("babel").join("config.json");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("config.json")
}

fn init_tracing(logging: &Logging) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &logging.file {
        Some(file) => {
            let path = Path::new(file);
            let dir = path.parent().unwrap_or(Path::new("."));
            let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "babel.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn load(explicit: Option<PathBuf>) -> anyhow::Result<(PathBuf, ProxyConfig)> {
    let path = resolve_config_path(explicit);
    let config = load_config(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    Ok((path, config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => {
            let (path, config) = load(cli.config)?;
            let _guard = init_tracing(&config.logging);
            tracing::info!(
                "loaded {} route(s) from {}",
                config.routes.len(),
                path.display()
            );
            server::run_server(config).await
        }
        Commands::Check => {
            let (path, config) = load(cli.config)?;
            println!(
                "configuration OK: {} ({} route(s))",
                path.display(),
                config.routes.len()
            );
            Ok(())
        }
    }
}
