use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hub_config::{ConfigDiscovery, GatewaySettings};
use hub_mcp::Gateway;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "mcp-hub")]
#[command(about = "Serve many MCP tool providers through a single connection", long_about = None)]
struct Cli {
    /// Gateway settings file (defaults to ~/.mcp-hub/gateway.yaml when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Extra provider definition files, highest precedence last
    #[arg(short, long = "providers", value_name = "FILE")]
    providers: Vec<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, action = clap::ArgAction::SetTrue)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the aggregated catalog over stdin/stdout (default)
    Serve,

    /// Start every provider and print their states with discovery diagnostics
    Providers {
        /// How long to wait for providers to finish starting, in seconds
        #[arg(long, default_value_t = 15)]
        wait: u64,
    },

    /// Start every provider and print the aggregated tool list
    Tools {
        #[arg(long, default_value_t = 15)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let mut settings = load_settings(cli.config.as_ref())?;
    settings.provider_files.extend(cli.providers);

    let discovery = ConfigDiscovery::from_settings(&settings).discover();
    let diagnostics: Vec<String> = discovery.diagnostics.iter().map(ToString::to_string).collect();
    for diagnostic in &diagnostics {
        warn!("{}", diagnostic);
    }
    info!("Discovered {} provider(s)", discovery.providers.len());

    let gateway = Gateway::builder(settings)
        .with_providers(discovery.providers)
        .build()
        .context("Failed to assemble gateway")?;
    gateway.start().await;

    let outcome = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&gateway).await,
        Commands::Providers { wait } => {
            gateway.settle(Duration::from_secs(wait)).await;
            print_json(&serde_json::json!({
                "providers": gateway.statuses(),
                "diagnostics": diagnostics,
            }))
        }
        Commands::Tools { wait } => {
            let catalog = gateway.settle(Duration::from_secs(wait)).await;
            for collision in catalog.collisions() {
                warn!(
                    "{} from {} shadowed by {}",
                    collision.qualified_name, collision.dropped, collision.kept
                );
            }
            print_json(&catalog.tool_specs())
        }
    };

    gateway.shutdown().await;
    outcome
}

async fn serve(gateway: &Gateway) -> Result<()> {
    tokio::select! {
        served = gateway.serve_stdio() => served.context("Host session failed"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for interrupt")?;
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<GatewaySettings> {
    if let Some(path) = path {
        info!("Loading settings from: {:?}", path);
        return GatewaySettings::from_yaml(path)
            .with_context(|| format!("Failed to load {}", path.display()));
    }

    let default_path = GatewaySettings::default_config_path();
    if default_path.exists() {
        info!("Loading settings from: {:?}", default_path);
        Ok(GatewaySettings::from_yaml(&default_path)?)
    } else {
        info!("Using default settings");
        Ok(GatewaySettings::default())
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Logs go to stderr; stdout carries the protocol.
fn init_logging(verbose: u8, json: bool) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
