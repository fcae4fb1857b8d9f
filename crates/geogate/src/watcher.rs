//! Hot reload of rules and the geolocation database.
//!
//! Polls the configuration file and the database file. When the config file
//! changes its `[rules]` table is recompiled and swapped in; when the
//! database changes it is reopened. A bad edit is logged and the running
//! rules or database stay in place.

use crate::config::AppConfig;
use access_filter::AccessFilter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// What a poll found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchChange {
    RulesReloaded { version: u64 },
    RulesRejected(String),
    DatabaseReloaded,
    DatabaseRejected(String),
}

/// Modification time plus length, so same-second rewrites are still noticed.
type Fingerprint = Option<(SystemTime, u64)>;

async fn fingerprint(path: &Path) -> Fingerprint {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}

/// Polling watcher for the config and database files.
pub struct ConfigWatcher {
    filter: Arc<AccessFilter>,
    config_path: PathBuf,
    database_path: Option<PathBuf>,
    interval: Duration,
    config_seen: Fingerprint,
    database_seen: Fingerprint,
}

impl ConfigWatcher {
    /// Creates a watcher; the files' current state counts as already loaded.
    pub async fn new(
        filter: Arc<AccessFilter>,
        config_path: PathBuf,
        database_path: Option<PathBuf>,
        interval: Duration,
    ) -> Self {
        let config_seen = fingerprint(&config_path).await;
        let database_seen = match &database_path {
            Some(path) => fingerprint(path).await,
            None => None,
        };
        Self {
            filter,
            config_path,
            database_path,
            interval,
            config_seen,
            database_seen,
        }
    }

    /// Checks both files once and applies whatever changed.
    pub async fn check_once(&mut self) -> Vec<WatchChange> {
        let mut changes = Vec::new();

        let current = fingerprint(&self.config_path).await;
        if current.is_some() && current != self.config_seen {
            self.config_seen = current;
            changes.push(self.reload_rules().await);
        }

        if let Some(path) = self.database_path.clone() {
            let current = fingerprint(&path).await;
            if current.is_some() && current != self.database_seen {
                self.database_seen = current;
                changes.push(self.reload_database(path).await);
            }
        }

        changes
    }

    async fn reload_rules(&self) -> WatchChange {
        info!("🔄 Configuration change detected in {}", self.config_path.display());

        let content = match tokio::fs::read_to_string(&self.config_path).await {
            Ok(content) => content,
            Err(e) => return rejected_rules(format!("failed to read {}: {e}", self.config_path.display())),
        };
        let config = match AppConfig::parse(&content) {
            Ok(config) => config,
            Err(e) => return rejected_rules(format!("failed to parse {}: {e}", self.config_path.display())),
        };

        match self.filter.reload_config(&config.rules) {
            Ok(()) => {
                let version = self.filter.rule_version().unwrap_or_default();
                info!("✅ Rules reloaded (version {})", version);
                WatchChange::RulesReloaded { version }
            }
            Err(e) => rejected_rules(e.to_string()),
        }
    }

    async fn reload_database(&self, path: PathBuf) -> WatchChange {
        info!("🔄 Geolocation database change detected in {}", path.display());

        let filter = Arc::clone(&self.filter);
        let result = tokio::task::spawn_blocking(move || filter.reload_database(&path)).await;
        match result {
            Ok(Ok(())) => {
                // Cached decisions were made with the old country data
                self.filter.flush_cache();
                WatchChange::DatabaseReloaded
            }
            Ok(Err(e)) => {
                warn!("❌ Keeping previous geolocation database: {}", e);
                WatchChange::DatabaseRejected(e.to_string())
            }
            Err(e) => {
                error!("Database reload task failed: {}", e);
                WatchChange::DatabaseRejected(e.to_string())
            }
        }
    }

    /// Polls until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately and the files were just loaded
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let changes = self.check_once().await;
                    if !changes.is_empty() {
                        debug!("Watcher applied {} change(s)", changes.len());
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("Config watcher stopped");
    }
}

fn rejected_rules(reason: String) -> WatchChange {
    warn!("❌ Keeping previous rules: {}", reason);
    WatchChange::RulesRejected(reason)
}
