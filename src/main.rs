//! brickd
//!
//! Daemon serving the brick placement and pending-operation engine over
//! REST. Configuration comes from an optional YAML file; command line flags
//! and their environment variables override it.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use brickd::{
    ApiServer, ApiServerConfig, CmdExecutor, Db, Error, ExecutorKind, ExecutorRef, LocalTransport,
    MockExecutor, Orchestrator, OrchestratorConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// brickd - brick placement and pending-operation engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "BRICKD_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// YAML configuration file
    #[arg(long, short, env = "BRICKD_CONFIG")]
    config: Option<PathBuf>,

    /// Database snapshot file (overrides the configuration file)
    #[arg(long, env = "BRICKD_DB")]
    db: Option<PathBuf>,

    /// Executor driving the storage nodes (overrides the configuration file)
    #[arg(long, env = "BRICKD_EXECUTOR", value_enum)]
    executor: Option<ExecutorKind>,

    /// Concurrent operations (overrides the configuration file)
    #[arg(long, env = "BRICKD_WORKERS")]
    workers: Option<usize>,

    /// Allow cross-origin requests from any origin
    #[arg(long, env = "BRICKD_CORS")]
    cors: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;

    info!("Starting brickd");
    info!("  Version: {}", brickd::VERSION);
    info!("  REST API: {}", args.listen);
    info!("  Executor: {:?}", config.executor);
    info!("  Workers: {}", config.workers);

    let db = match &config.db_path {
        Some(path) => Db::open(path)?,
        None => {
            info!("No database file configured, state is kept in memory");
            Db::in_memory()
        }
    };

    let executor: ExecutorRef = match config.executor {
        ExecutorKind::Mock => MockExecutor::new(),
        ExecutorKind::Local => {
            std::sync::Arc::new(CmdExecutor::new(LocalTransport, config.cmdexec.clone()))
        }
    };

    let orchestrator = Orchestrator::new(config, db, executor);
    orchestrator.initialize()?;

    let api_config = ApiServerConfig {
        rest_addr: args
            .listen
            .parse::<SocketAddr>()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
        permissive_cors: args.cors,
        ..Default::default()
    };
    let api_server = ApiServer::new(api_config, orchestrator);

    let shutdown = api_server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, shutting down"),
            Err(e) => error!("Unable to listen for interrupt: {}", e),
        }
        shutdown.cancel();
    });

    api_server.run().await?;

    info!("brickd shutdown complete");
    Ok(())
}

/// Configuration file (or defaults) with command line overrides applied
fn load_config(args: &Args) -> Result<OrchestratorConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            OrchestratorConfig::from_yaml_file(path)?
        }
        None => OrchestratorConfig::default(),
    };

    if let Some(db) = &args.db {
        config.db_path = Some(db.clone());
    }
    if let Some(executor) = args.executor {
        config.executor = executor;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
