use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use warden::api::{serve, AppState};
use warden::storage::InMemoryStore;
use warden::validation::CodeValidator;
use warden::{Config, Orchestrator, Strictness};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Secure execution control plane for agent handler code", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane and its HTTP API
    Serve {
        #[arg(short, long, help = "Path to a TOML config file")]
        config: Option<PathBuf>,
        #[arg(short, long, help = "Port to listen on")]
        port: Option<u16>,
    },
    /// Validate a handler source file and print the report
    Validate {
        #[arg(help = "Handler source file")]
        file: PathBuf,
        #[arg(short, long, help = "basic, standard, strict or paranoid")]
        strictness: Option<String>,
        #[arg(short, long, help = "Handler name used in the report")]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port } => run_server(config, port).await?,
        Commands::Validate {
            file,
            strictness,
            name,
        } => validate_file(file, strictness, name).await?,
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load(&path)?;
            config.apply_overrides(|key| std::env::var(key).ok())?;
            Ok(config)
        }
        None => Config::from_env(),
    }
}

async fn run_server(config_path: Option<PathBuf>, port: Option<u16>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }

    let orchestrator = Orchestrator::from_config(&config)?;
    orchestrator.start().await;

    let state = AppState {
        orchestrator: orchestrator.clone(),
    };
    let result = tokio::select! {
        result = serve(state, &config.server.host, config.server.port) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupt received, stopping background tasks");
            Ok(())
        }
    };

    orchestrator.stop().await;
    result
}

async fn validate_file(file: PathBuf, strictness: Option<String>, name: Option<String>) -> Result<()> {
    let config = Config::from_env()?;
    let strictness = match strictness {
        Some(value) => value.parse::<Strictness>()?,
        None => config.validation.default_strictness,
    };
    let source = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "handler".to_string())
    });

    let validator = CodeValidator::new(Arc::new(InMemoryStore::new()), config.validation);
    let report = validator.validate(&source, &name, strictness).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.verdict.allows_execution() {
        std::process::exit(1);
    }
    Ok(())
}
