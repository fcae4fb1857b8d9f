//! # GeoGate - Geolocation Access Gate
//!
//! TCP front door for a game server. Every incoming connection is checked
//! against country, CIDR and address rules by the `access_filter` crate
//! before it is relayed to the real server; refused connections are closed
//! without the game server ever seeing them.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration (writes geogate.toml if missing)
//! geogate
//!
//! # Gate a local game server
//! geogate --bind 0.0.0.0:7777 --upstream 127.0.0.1:7778 --database GeoLite2-Country.mmdb
//!
//! # Ask what the current rules say about one address
//! geogate --check 203.0.113.9
//! ```
//!
//! ## Configuration
//!
//! Settings live in a TOML file (default: `geogate.toml`). The `[rules]`
//! table and the geolocation database are reloaded automatically when their
//! files change.
//!
//! ## Signal Handling
//!
//! SIGINT/SIGTERM (Ctrl+C on Windows) trigger a graceful shutdown; a second
//! signal exits immediately.

use tracing::error;

pub mod app;
pub mod audit;
pub mod cli;
pub mod config;
pub mod gate;
pub mod logging;
pub mod signals;
pub mod watcher;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Entry point for the `geogate` binary.
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown, or a `--check` that allowed
/// * **1**: Error during startup, configuration, or runtime
/// * **2**: A `--check` that denied
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Load configuration to get logging settings
    let mut logging_settings = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default()
        .logging;
    if let Some(level) = &args.log_level {
        logging_settings.level = level.clone();
    } else if args.check.is_some() {
        // Keep stdout clean for the JSON verdict
        logging_settings.level = "warn".to_string();
    }

    if let Err(e) = logging::setup_logging(&logging_settings, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    if let Some(address) = args.check.clone() {
        return run_check(args, &address).await;
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn run_check(args: CliArgs, address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = app::load_config(&args).await?;
    let app = Application::from_config(config, args.config_path)?;
    let verdict = app.check(address).await?;

    println!("{}", serde_json::to_string_pretty(&verdict)?);
    app.filter().shutdown();

    if !verdict.is_allowed() {
        std::process::exit(2);
    }
    Ok(())
}

pub use config::{AuditSettings, DatabaseSettings, GateSettings, LoggingSettings};
