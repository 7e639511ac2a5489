//! TTN to IoT hub bridge
//!
//! ```bash
//! # Run with the default configuration (~/.config/ttn-bridge/bridge.toml)
//! ttn-bridge
//!
//! # Explicit configuration and verbose logging
//! ttn-bridge --config bridge.toml --log-level debug
//!
//! # Write an example configuration / check one
//! ttn-bridge gen-config --output bridge.toml
//! ttn-bridge validate --config bridge.toml
//! ```

use chrono::Local;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use ttn_bridge::bridge::stats::BridgeStats;
use ttn_bridge::directory::IotHubRegistry;
use ttn_bridge::ingestion::connection_string::ConnectionString;
use ttn_bridge::ingestion::{HubConnector, HubSettings};
use ttn_bridge::mqtt::{BrokerError, BrokerSession, BrokerSettings};
use ttn_bridge::{
    BridgeConfig, BridgeSettings, DeviceConnectionPool, MessageBridge, Notifier, TracingNotifier,
    WhiteList,
};

const DOWNLINK_BUFFER: usize = 100;

/// LoRaWAN network server to cloud ingestion bridge
#[derive(Parser, Debug)]
#[command(name = "ttn-bridge")]
#[command(about = "Relays TTN uplinks to an IoT hub and hub messages back as downlinks")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to RUST_LOG, then info
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "bridge.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.log_level.as_deref())?;

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let path = args.config.unwrap_or_else(BridgeConfig::default_path);
    let config = BridgeConfig::from_file(&path)
        .map_err(|e| eyre!("Failed to load {}: {}", path.display(), e))?;

    run(config).await
}

fn setup(log_level: Option<&str>) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(log_level);
    Ok(())
}

/// `--log-level` wins over `RUST_LOG`; anything unparsable falls back to info.
fn log_filter(log_level: Option<&str>) -> EnvFilter {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    };
    filter.unwrap_or_else(|| EnvFilter::new("info"))
}

fn setup_logging_env(log_level: Option<&str>) {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(log_level))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn cmd_gen_config(output: PathBuf) -> Result<()> {
    let text = toml::to_string_pretty(&BridgeConfig::example())?;
    let header = "# ttn-bridge configuration\n\
                  # PascalCase option names (RemoveDevicesAfterMinutes, ...) are accepted too.\n\n";
    std::fs::write(&output, format!("{}{}", header, text))?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

fn cmd_validate(path: PathBuf) -> Result<()> {
    let config = BridgeConfig::from_file(&path)
        .map_err(|e| eyre!("{} is invalid: {}", path.display(), e))?;

    println!("Configuration valid: {}", path.display());
    println!("  Application: {}", config.bridge.application_id);
    println!("  Broker:      {}:{}", config.broker.host, config.broker.port);
    println!("  Topic:       {}", config.broker.topic);
    println!("  Ingestion:   {}", config.ingestion_host());
    println!(
        "  Idle after:  {} min",
        config.bridge.remove_devices_after_minutes
    );
    Ok(())
}

async fn run(config: BridgeConfig) -> Result<()> {
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

    let (whitelist, status) = WhiteList::load(config.bridge.whitelist_file.as_deref())?;
    notifier.line(&status.to_string());

    let service = ConnectionString::parse(&config.ingestion.connection_string)?;
    let sas_ttl = Duration::from_secs(config.ingestion.sas_token_ttl_secs);
    let directory = Arc::new(IotHubRegistry::new(&service, sas_ttl)?);
    notifier.trace(&format!("{} -> ", Local::now().format("%H:%M:%S")));
    notifier.line(&format!("Ingestion host {} ready", config.ingestion_host()));

    let connector = Arc::new(HubConnector::new(
        HubSettings {
            sas_token_ttl: sas_ttl,
            ..HubSettings::default()
        },
        notifier.clone(),
    ));
    let (downlink_tx, downlink_rx) = mpsc::channel(DOWNLINK_BUFFER);
    let pool = DeviceConnectionPool::new(
        config.pool_settings(),
        connector,
        downlink_tx,
        notifier.clone(),
    );

    let session = BrokerSession::create(BrokerSettings::from_config(&config), notifier.clone());
    let publisher = Arc::new(session.publisher());

    let bridge = Arc::new(MessageBridge::new(
        BridgeSettings::from(&config),
        Arc::new(whitelist),
        directory,
        pool.clone(),
        publisher,
        notifier.clone(),
    ));
    let _downlink_worker = bridge.spawn_downlink_worker(downlink_rx);

    let stats = bridge.stats();
    if config.bridge.stats_interval_secs > 0 {
        spawn_stats_reporter(stats.clone(), config.bridge.stats_interval_secs);
    }

    let shutdown = CancellationToken::new();
    let session = session.subscribe().await?;
    let mut broker_task = tokio::spawn(session.run(bridge.clone(), shutdown.clone()));

    info!("Bridge running, press Ctrl+C to stop");

    let exit_code = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Unable to listen for Ctrl+C: {}", e);
            }
            info!("Shutting down...");
            shutdown.cancel();
            if let Err(e) = (&mut broker_task).await {
                error!("Broker task failed: {}", e);
            }
            0
        }
        result = &mut broker_task => match result {
            Ok(Err(BrokerError::ConnectionClosed(reason))) => {
                error!("Broker connection closed: {}", reason);
                1
            }
            Ok(Err(e)) => {
                error!("Broker session failed: {}", e);
                1
            }
            Ok(Ok(())) => 0,
            Err(e) => {
                error!("Broker task failed: {}", e);
                1
            }
        },
    };

    pool.shutdown().await;
    info!("Final statistics: {}", stats.snapshot());

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn spawn_stats_reporter(stats: Arc<BridgeStats>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            info!("Statistics: {}", stats.snapshot());
        }
    });
}
