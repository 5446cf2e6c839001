use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slotgate::config::{Config, ConfigError, CoordinationConfig};
use slotgate::server::{embedded_store, ExitProcess, Server};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slotgate")]
#[command(about = "A slot-routing proxy for sharded key-value clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
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

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_proxy(config),
        Commands::Config { output } => generate_config(output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn run_proxy(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config)?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = config.server.worker_threads {
        runtime.worker_threads(threads);
    }
    let runtime = runtime.build().context("Failed to build runtime")?;

    runtime.block_on(async move {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            config = ?config_path,
            "Starting slotgate"
        );

        let store = match &config.coordination {
            CoordinationConfig::Embedded { .. } => embedded_store(&config)?,
        };
        let server = Server::bind(config, store, Box::new(ExitProcess)).await?;
        let instance = server.instance();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("Interrupt received, draining");
            if let Err(e) = instance.lifecycle().request_offline().await {
                warn!(error = %e, "Could not publish mark-offline, draining locally");
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Second interrupt, shutting down immediately");
                instance.shutdown();
            }
        });

        server.run().await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  slotgate run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Admin address: {}", config.server.admin_addr);
            println!("  Max connections: {}", config.server.max_connections);
            println!("  Slots: {}", config.proxy.slot_count);

            let CoordinationConfig::Embedded { groups, .. } = &config.coordination;
            println!("  Embedded coordination, {} groups", groups.len());
            for group in groups {
                println!("    group {}: {}", group.id, group.servers.join(", "));
            }
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
    println!("slotgate v{}", env!("CARGO_PKG_VERSION"));
    println!("A slot-routing proxy for sharded key-value clusters");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;

    info!(level = %config.logging.level, format = %config.logging.format, "Logging initialized");
    Ok(())
}
