use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use server::config::{AppConfig, DEFAULT_CONFIG_FILE};
use server::{create_router, state::AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workers::ProcessLauncher;

#[derive(Parser)]
#[command(name = "insight-studio")]
#[command(about = "Supervised market research workflows over external analysis workers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample configuration file
    Init,
    /// Start the worker pool and the HTTP server
    Serve {
        /// Overrides `[server] port`
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate the configuration and print the stage order
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init) => init_config(&cli.config).await,
        Some(Commands::Serve { port }) => serve(&cli.config, port).await,
        Some(Commands::Check) => check(&cli.config).await,
        None => serve(&cli.config, None).await,
    }
}

async fn init_config(path: &Path) -> Result<()> {
    AppConfig::sample()
        .write_new(path)
        .await
        .with_context(|| format!("Failed to initialize {}", path.display()))?;

    println!("Wrote {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Point [[workers]] at your analysis worker executables");
    println!("  2. Run 'insight-studio check' to validate the configuration");
    println!("  3. Run 'insight-studio serve' to start the server");

    Ok(())
}

async fn check(path: &Path) -> Result<()> {
    let config = AppConfig::load(path)
        .await
        .context("Failed to load configuration")?;
    let registry = config.validate().context("Invalid configuration")?;
    let order = registry
        .topological_order()
        .context("Failed to order stages")?;

    println!("Configuration: {}", path.display());
    println!();
    println!("Stages ({}):", registry.len());
    for (position, stage_id) in order.iter().enumerate() {
        let def = registry.get(stage_id).context("Stage disappeared from registry")?;
        let deps = if def.depends_on.is_empty() {
            String::new()
        } else {
            format!(" <- {}", def.depends_on.join(", "))
        };
        println!(
            "  {}. {} [{}, {}]{}",
            position + 1,
            stage_id,
            def.required_capability,
            def.severity.as_str(),
            deps
        );
    }

    println!();
    println!("Workers ({}):", config.workers.len());
    for worker in &config.workers {
        let state = if worker.enabled { "enabled" } else { "disabled" };
        println!(
            "  {} ({}): {}",
            worker.name,
            state,
            worker.capabilities.join(", ")
        );
    }

    let uncovered = config.uncovered_capabilities(&registry);
    if !uncovered.is_empty() {
        println!();
        bail!(
            "No enabled worker provides: {}",
            uncovered.join(", ")
        );
    }

    println!();
    println!("Configuration OK");
    Ok(())
}

async fn serve(path: &Path, port: Option<u16>) -> Result<()> {
    init_tracing();

    let mut config = AppConfig::load(path)
        .await
        .context("Failed to load configuration")?;
    if let Some(port) = port {
        config.server.port = port;
    }
    let registry = config.validate().context("Invalid configuration")?;

    let uncovered = config.uncovered_capabilities(&registry);
    if !uncovered.is_empty() {
        tracing::warn!("No enabled worker provides: {}", uncovered.join(", "));
    }

    let state = AppState::from_config(&config, registry, Arc::new(ProcessLauncher::new()))
        .await
        .context("Failed to register workers")?;

    for (name, result) in state.pool.start_all().await {
        if let Err(e) = result {
            tracing::error!(worker = %name, "Failed to start worker: {}", e);
        }
    }
    if let Err(e) = state
        .pool
        .wait_until_ready(Some(state.pool.config().readiness_timeout()))
        .await
    {
        tracing::warn!("Serving before every worker is ready: {}", e);
    }

    let address = config.server.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    let app = create_router(state.clone());

    println!();
    println!("Insight Studio");
    println!("════════════════════════════════════════");
    println!();
    println!("  API Server:  http://{}", address);
    println!("  Swagger UI:  http://{}/swagger-ui", address);
    println!("  Workers:     {}", config.workers.len());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down worker pool");
    state.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received shutdown signal");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix;
        match unix::signal(unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                tracing::info!("Received TERM signal");
            }
            Err(e) => {
                tracing::error!("Failed to install TERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "insight_studio=info,server=info,orchestrator=info,workers=info,tower_http=info"
                    .into()
            }),
        )
        .init();
}
