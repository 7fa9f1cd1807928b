//! Parody - CLI entry point.

use anyhow::Result;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use parody::{MockServer, MockSource, RequestOutcome, ServerConfig, ServerEvent};

#[derive(Parser, Debug)]
#[command(
    name = "parody",
    about = "File-driven mock HTTP server - glob-discovered mocks, live reload, and pass-through proxying",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "parody.yaml")]
    config: PathBuf,

    /// Listen port (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Additional mock glob patterns (repeatable)
    #[arg(short, long = "mock", value_name = "GLOB")]
    mocks: Vec<String>,

    /// Load mocks once and do not watch for changes
    #[arg(long)]
    no_watch: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print default config if requested
    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    // Load configuration
    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        ServerConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration");
        ServerConfig::default()
    };

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    for glob in &args.mocks {
        config.mocks.push(MockSource::Glob(glob.clone()));
    }
    if args.no_watch {
        config.watch = false;
    }

    // Validate and exit if requested
    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} mock sources defined)",
            config.mocks.len()
        );
        return Ok(());
    }

    let server = MockServer::new(config);
    let mut events = server.events();

    // Correlated request/lifecycle logging
    tokio::spawn(async move {
        let mut started: HashMap<Uuid, Instant> = HashMap::new();
        loop {
            match events.recv().await {
                Ok(ServerEvent::MockStart {
                    correlation_id,
                    method,
                    url,
                }) => {
                    started.insert(correlation_id, Instant::now());
                    info!(%correlation_id, %method, %url, "request received");
                }
                Ok(ServerEvent::MockEnd {
                    correlation_id,
                    outcome,
                    url,
                }) => {
                    let elapsed = started.remove(&correlation_id).map(|t| t.elapsed());
                    match outcome {
                        RequestOutcome::Finished => {
                            info!(%correlation_id, %url, ?elapsed, "request completed")
                        }
                        RequestOutcome::ClosedEarly => {
                            warn!(%correlation_id, %url, ?elapsed, "request closed before completing")
                        }
                    }
                }
                Ok(ServerEvent::MockUpdated(path)) => info!(%path, "mock updated"),
                Ok(ServerEvent::Loaded) => info!("mocks loaded"),
                Ok(ServerEvent::Error(err)) => tracing::error!(%err, "server error"),
                Ok(ServerEvent::MockGlobs(globs)) => debug!(?globs, "watching mock globs"),
                Ok(ServerEvent::ProxyResponse {
                    correlation_id,
                    status,
                }) => debug!(%correlation_id, status, "proxy response"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let handle = server.start().await?;
    info!("Listening on {}", handle.local_addr().port());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.shutdown();
    handle.wait().await;
    info!("Shutdown complete");

    Ok(())
}
