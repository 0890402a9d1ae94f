use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use semaforo::config::Config;
use semaforo::error::ConfigError;
use semaforo::Semaforo;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "semaforo")]
#[command(about = "A federated traffic control plane with pluggable load balancing and session affinity")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Semaforo Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the semaforo node
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_node(config).await?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn run_node(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config);

    info!("Starting semaforo v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Org: {}", config.node.org_id);
    info!("Node: {} ({})", config.node.node_name, config.node.node_url);
    info!("Listening on: {}", config.server.listen_addr);

    let node = Semaforo::new(config);
    node.run().await.context("semaforo node exited with error")?;

    Ok(())
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  semaforo run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Org: {}", config.node.org_id);
            println!(
                "  Node: {} ({})",
                config.node.node_name, config.node.node_url
            );
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Public origin: {}", config.server.public_origin);
            println!("  Max connections: {}", config.server.max_connections);
            println!(
                "  Heartbeat: every {}s, timeout {}s",
                config.federation.heartbeat_interval_sec, config.federation.heartbeat_timeout_sec
            );
            println!(
                "  Promotion deadline: {}s",
                config.federation.promotion_deadline_sec
            );
            if config.federation.sync_interval_sec == 0 {
                println!("  Scheduled sync: disabled");
            } else {
                println!(
                    "  Scheduled sync: every {}s",
                    config.federation.sync_interval_sec
                );
            }
            println!(
                "  Health checks: {} every {}s",
                config.health.mode, config.health.interval_sec
            );
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("semaforo v{}", env!("CARGO_PKG_VERSION"));
    println!("A federated traffic control plane");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Consistent-hash request routing across federated nodes");
    println!("  • Five load-balancing strategies with session affinity");
    println!("  • Four proxy modes with response rewriting");
    println!("  • Principle/Partner role handover with auto-promotion");
    println!("  • Per-partner configuration sync with audit logs");
}

fn init_logging(config: &Config) {
    let log_level = match config.logging.level.as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    // The background loops emit tracing events; those need their own
    // subscriber, while log records stay with env_logger
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        log::warn!("A tracing subscriber was already installed");
    }

    info!("Logging initialized at level: {:?}", log_level);
}
