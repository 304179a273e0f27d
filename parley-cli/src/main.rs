//! CLI entry point for parley

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use parley_core::config::{Config, ConfigLoader};
use parley_core::logging::init_logging;
use parley_providers::{ChatCompletionsClient, EchoProvider, LLMProvider};
use parley_server::{run_server, AppState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Metered question-and-answer sessions over WebSocket")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket server
    Serve {
        /// Bind address
        #[arg(long)]
        host: Option<String>,
        /// Bind port
        #[arg(short, long)]
        port: Option<u16>,
        /// Answer with the offline echo provider instead of a remote model
        #[arg(long)]
        echo: bool,
    },
    /// Print the effective configuration
    Config,
    /// Show status information
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = if let Some(dir) = cli.config_dir {
        ConfigLoader::with_dir(dir)
    } else {
        ConfigLoader::new()
    };

    match cli.command {
        Commands::Serve { host, port, echo } => run_serve(&config_loader, host, port, echo).await,
        Commands::Config => run_config(&config_loader),
        Commands::Status => run_status(&config_loader),
    }
}

async fn run_serve(
    loader: &ConfigLoader,
    host: Option<String>,
    port: Option<u16>,
    echo: bool,
) -> Result<()> {
    let mut config = loader.load().context("Failed to load configuration")?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.logging.dir = resolve_dir(loader.config_dir(), &config.logging.dir);
    config.recorder.dir = resolve_dir(loader.config_dir(), &config.recorder.dir);

    let _log_guard = init_logging(&config.logging);

    let provider: Arc<dyn LLMProvider> = if echo {
        Arc::new(EchoProvider::new())
    } else {
        if config.provider.api_key.is_empty() {
            anyhow::bail!(
                "No API key configured. Set OPENAI_API_KEY, add provider.api_key to {}, or run with --echo",
                loader.config_path().display()
            );
        }
        Arc::new(ChatCompletionsClient::from_config(&config.provider))
    };
    let recorder = parley_core::recorder::from_config(&config.recorder)
        .context("Failed to open the event recorder")?;

    println!("{}", style("Starting parley...").bold().cyan());
    println!("Model: {}", provider.get_default_model());
    println!(
        "Limits: {} questions / {}s per session",
        config.session.max_questions, config.session.time_limit_secs
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Bound {}", addr);

    let state = AppState::new(config, provider, recorder);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(run_server(state, listener, shutdown_rx));

    println!(
        "\n{}",
        style(format!("Listening on {}. Press Ctrl+C to stop.", addr)).green()
    );

    tokio::signal::ctrl_c().await?;
    println!("\n{}", style("Shutting down...").yellow());
    let _ = shutdown_tx.send(());

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
    }

    println!("{}", style("Server stopped.").green());
    Ok(())
}

fn run_config(loader: &ConfigLoader) -> Result<()> {
    let mut config = loader.load()?;
    config.provider.api_key = config.provider.masked_api_key();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn run_status(loader: &ConfigLoader) -> Result<()> {
    let config_path = loader.config_path();

    println!("{}", style("parley status").bold().cyan());
    println!("Version: {}\n", env!("CARGO_PKG_VERSION"));

    println!("{}", style("Configuration:").bold());
    let file_state = if config_path.exists() {
        style("found").green()
    } else {
        style("not found, using defaults").dim()
    };
    println!("  Config file: {} ({})", config_path.display(), file_state);

    let config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            println!("  {} {}", style("invalid:").red(), e);
            return Ok(());
        }
    };
    print_summary(&config);
    Ok(())
}

fn print_summary(config: &Config) {
    println!(
        "  Server: {}:{} ({:?})",
        config.server.host, config.server.port, config.server.mode
    );
    println!(
        "  Sessions: {} questions, {}s limit",
        config.session.max_questions, config.session.time_limit_secs
    );
    println!();

    println!("{}", style("Provider:").bold());
    println!("  API base: {}", config.provider.api_base);
    println!("  Model: {}", config.provider.model);
    let key_status = if config.provider.api_key.is_empty() {
        style("not configured").red()
    } else {
        style("configured").green()
    };
    println!("  API key: {}", key_status);
}

/// Anchor relative directories at the config directory
fn resolve_dir(base: &Path, dir: &str) -> String {
    let path = Path::new(dir);
    if path.is_absolute() {
        dir.to_string()
    } else {
        base.join(path).to_string_lossy().into_owned()
    }
}
