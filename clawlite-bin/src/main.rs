use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use clawlite_config::ConfigLoader;
use clawlite_gateway::{build_router, GatewayState};
use clawlite_runtime::Runtime;

#[derive(Parser)]
#[command(name = "clawlite", version, about = "A long-running personal autonomous agent")]
struct Cli {
    /// Path to config.json (default: ~/.clawlite/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the runtime and gateway (default)
    Serve,
    /// Print the effective configuration and exit
    Config,
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    match format {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        "compact" => tracing_subscriber::fmt().with_env_filter(filter).compact().init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loader = ConfigLoader::load(cli.config.as_deref())?;
    let config = loader.get();
    init_tracing(&config.logging.level, &config.logging.format);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Serve => serve(loader).await,
    }
}

async fn serve(loader: ConfigLoader) -> anyhow::Result<()> {
    let config = loader.get();
    info!(
        model = %config.provider.model,
        workspace = %config.workspace_path.display(),
        "starting clawlite"
    );

    // Bearer token is generated and persisted on first run
    let token = loader.ensure_gateway_token()?;

    // Config hot-reload watcher, kept alive for the process lifetime
    let _watcher = match loader.watch() {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "config hot-reload disabled");
            None
        }
    };

    let runtime = Runtime::build(&loader)?;
    Arc::clone(&runtime).start().await?;

    let status_runtime = Arc::clone(&runtime);
    let state = GatewayState::new(
        Arc::clone(&runtime.engine),
        runtime.cron_handle.clone(),
        token,
        Arc::new(move || {
            serde_json::to_value(status_runtime.status()).unwrap_or_default()
        }),
    );
    let router = build_router(state);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    runtime.shutdown().await;
    Ok(())
}
