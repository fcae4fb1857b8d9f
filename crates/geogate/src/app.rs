//! Main application logic and lifecycle management.
//!
//! The `Application` struct wires the access filter to the TCP gate, the
//! audit log and the config watcher, then runs until a shutdown signal.

use crate::audit::AuditLog;
use crate::cli::CliArgs;
use crate::config::AppConfig;
use crate::gate::Gate;
use crate::logging::display_banner;
use crate::signals::{wait_for_shutdown_signal, wait_for_shutdown_signal_silent};
use crate::watcher::ConfigWatcher;
use access_filter::{AccessFilter, DecisionEvent, EventSink, FilterError, FilterStats, Verdict};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Denials per monitoring period above which a warning is logged.
const HIGH_BLOCK_RATE: u64 = 1000;

/// Main application struct.
pub struct Application {
    /// Loaded application configuration
    config: AppConfig,
    /// Where the configuration came from, watched for rule changes
    config_path: PathBuf,
    filter: Arc<AccessFilter>,
    events: mpsc::Receiver<DecisionEvent>,
}

impl Application {
    /// Loads configuration, applies CLI overrides and builds the filter.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let config = load_config(&args).await?;
        info!("✅ Configuration loaded and validated successfully");

        display_banner();
        Self::from_config(config, args.config_path)
    }

    /// Builds the application from an already validated configuration.
    ///
    /// A missing or unreadable database is not fatal: every address then
    /// resolves to `UNKNOWN` until the watcher picks up a usable file.
    pub fn from_config(config: AppConfig, config_path: PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let (sink, events) = EventSink::channel(config.filter.event_buffer);
        let filter = AccessFilter::new(config.filter.clone())?.with_event_sink(sink);

        if let Some(path) = &config.database.path {
            if let Err(e) = filter.reload_database(path) {
                warn!("⚠️ {}; countries resolve as UNKNOWN until a database is available", e);
            }
        } else {
            warn!("⚠️ No geolocation database configured; countries resolve as UNKNOWN");
        }

        filter.reload_config(&config.rules)?;

        Ok(Self {
            config,
            config_path,
            filter: Arc::new(filter),
            events,
        })
    }

    /// Evaluates one address against the loaded rules.
    pub async fn check(&self, raw: &str) -> Result<Verdict, FilterError> {
        self.filter.evaluate(raw).await
    }

    pub fn filter(&self) -> &Arc<AccessFilter> {
        &self.filter
    }

    /// Runs the gate until a shutdown signal, then shuts down in phases.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting GeoGate");
        self.log_configuration_summary();

        let Application {
            config,
            config_path,
            filter,
            events,
        } = self;

        let (shutdown_sender, _) = broadcast::channel::<()>(4);

        let listener = TcpListener::bind(&config.gate.bind_address).await?;
        let gate = Arc::new(Gate::new(Arc::clone(&filter), &config.gate));
        let gate_handle = tokio::spawn(Arc::clone(&gate).run(listener, shutdown_sender.subscribe()));

        let audit = AuditLog::open(config.audit.clone()).await?;
        let audit_handle = tokio::spawn(audit.run(events, shutdown_sender.subscribe()));

        let watcher_handle = if config.database.watch_interval_secs > 0 {
            let watcher = ConfigWatcher::new(
                Arc::clone(&filter),
                config_path.clone(),
                config.database.path.clone(),
                Duration::from_secs(config.database.watch_interval_secs),
            )
            .await;
            Some(tokio::spawn(watcher.run(shutdown_sender.subscribe())))
        } else {
            None
        };

        let monitoring_handle = {
            let filter = Arc::clone(&filter);
            let gate = Arc::clone(&gate);

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.tick().await;
                let mut last_denied = 0u64;

                loop {
                    interval.tick().await;
                    filter.sweep();

                    let stats = filter.stats();
                    let denied_this_period = stats.denied - last_denied;
                    last_denied = stats.denied;

                    info!(
                        "📊 Gate Health - {} evaluated | {} allowed | {} denied | {} relaying | cache {}/{} ({} hits)",
                        stats.evaluations,
                        stats.allowed,
                        stats.denied,
                        gate.stats().active_relays,
                        stats.cache.entries,
                        stats.cache.capacity,
                        stats.cache.hits
                    );

                    if denied_this_period > HIGH_BLOCK_RATE {
                        warn!("🔥 High block rate - {} connections denied this minute", denied_this_period);
                    }
                    if stats.dropped_events > 0 {
                        warn!("📉 {} decision events dropped so far (audit log lagging)", stats.dropped_events);
                    }
                }
            })
        };

        info!("✅ GeoGate is now running!");
        info!(
            "🎮 Filtering connections on {} for {}",
            config.gate.bind_address, config.gate.upstream_address
        );
        info!("🔍 Health monitoring active - stats every 60 seconds");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        wait_for_shutdown_signal().await?;

        // merciless shutdown
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal_silent().await {
                error!("Failed to set up merciless shutdown signal handler: {e}");
                return;
            }

            warn!("Shutdown handler received again! I'll make this quick.");
            std::process::exit(1);
        });

        info!("📡 Phase 1: Stopping the gate and background tasks...");
        monitoring_handle.abort();
        let _ = shutdown_sender.send(());

        if tokio::time::timeout(Duration::from_secs(5), gate_handle).await.is_err() {
            warn!("⏰ Gate did not stop within timeout, proceeding with shutdown");
        }
        if let Some(handle) = watcher_handle {
            handle.abort();
        }

        info!("🧹 Phase 2: Shutting down the access filter...");
        let final_stats = filter.stats();
        filter.shutdown();

        info!("📝 Phase 3: Flushing the audit log...");
        match tokio::time::timeout(Duration::from_secs(3), audit_handle).await {
            Ok(Ok(_summary)) => info!("✅ Audit log flushed"),
            Ok(Err(e)) => error!("❌ Audit task failed: {}", e),
            Err(_) => warn!("⏰ Audit log did not finish within timeout"),
        }

        log_final_statistics(&final_stats, &gate);

        info!("✅ GeoGate shutdown complete");
        Ok(())
    }

    /// Logs the configuration summary at startup.
    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.gate.bind_address);
        info!("  🎮 Upstream: {}", self.config.gate.upstream_address);
        info!("  👥 Max connections: {}", self.config.gate.max_connections);
        info!("  🌍 Database: {}", self.filter.database_description());
        if let Some(rules) = self.filter.snapshot() {
            info!("  📜 Rules: {}", rules.summary());
        }
        info!(
            "  💾 Cache: {} entries, {}s TTL{}",
            self.config.filter.cache_capacity,
            self.config.filter.cache_ttl_secs,
            if self.config.filter.cache_enabled { "" } else { " (disabled)" }
        );
        info!(
            "  🛡️ Connection guard: {}",
            if self.config.filter.guard.enabled { "enabled" } else { "disabled" }
        );
    }
}

/// Loads the configuration file and applies CLI overrides.
pub async fn load_config(args: &CliArgs) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = AppConfig::load_from_file(&args.config_path).await?;

    if let Some(bind_address) = &args.bind_address {
        config.gate.bind_address = bind_address.clone();
    }

    if let Some(upstream_address) = &args.upstream_address {
        config.gate.upstream_address = upstream_address.clone();
    }

    if let Some(database_path) = &args.database_path {
        config.database.path = Some(database_path.clone());
    }

    if let Some(log_level) = &args.log_level {
        config.logging.level = log_level.clone();
    }

    if args.json_logs {
        config.logging.json_format = true;
    }

    if let Err(e) = config.validate() {
        return Err(format!("Configuration validation failed: {e}").into());
    }

    Ok(config)
}

/// Logs final statistics during shutdown.
fn log_final_statistics(stats: &FilterStats, gate: &Gate) {
    let gate_stats = gate.stats();
    info!("📊 Final Statistics:");
    info!("  - Connections accepted: {}", gate_stats.accepted);
    info!("  - Evaluations: {} ({} allowed, {} denied)", stats.evaluations, stats.allowed, stats.denied);
    info!("  - Invalid inputs: {} | Lookup timeouts: {}", stats.invalid_inputs, stats.timeouts);
    info!("  - Guard blocks: {} | Blacklisted: {}", stats.guard_blocks, stats.guard.perm_blocked);
    info!("  - Cache hits: {} | misses: {}", stats.cache.hits, stats.cache.misses);
    info!("  - Upstream failures: {}", gate_stats.upstream_failures);
}
