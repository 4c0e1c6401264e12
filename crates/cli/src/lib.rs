use anyhow::{Context as AnyhowContext, Result};
use clap::Parser;
use signal_indexer::{AnnotationService, JsonSignalLoader};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

pub mod config;
pub mod server;

pub use config::ServerConfig;

#[derive(Parser)]
#[command(name = "signal-annotator")]
#[command(about = "Annotation server for a watched directory of signal records", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the server configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the listen address from the config file
    #[arg(long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long)]
    quiet: bool,
}

pub async fn main_entry() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let config = ServerConfig::load(&cli.config)?;
    let listen = cli.listen.unwrap_or_else(|| config.listen.clone());

    let service = AnnotationService::open(config.service_config(), Arc::new(JsonSignalLoader))
        .await
        .context("Failed to start annotation service")?;
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;

    server::serve(listener, service).await
}
