//! Decision event consumer.
//!
//! Drains the access filter's event channel on its own task: blocked
//! connections are logged and appended to the block log, allowed ones are
//! logged only when asked for.

use crate::config::AuditSettings;
use access_filter::DecisionEvent;
use chrono::{DateTime, Local, TimeZone};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Counts reported when the audit task stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub blocked: u64,
    pub allowed: u64,
    pub write_failures: u64,
}

/// Formats one block log line.
pub fn format_block_line<Tz: TimeZone>(event: &DecisionEvent, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let ip = event
        .ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| event.raw_input.clone());
    format!(
        "[{}] BLOCKED | IP: {} | Reason: {} ({}) | Country: {}",
        at.format("%Y-%m-%d %H:%M:%S"),
        ip,
        event.reason,
        event.detail,
        event.country
    )
}

/// Consumes decision events until shutdown.
pub struct AuditLog {
    settings: AuditSettings,
    file: Option<tokio::fs::File>,
    summary: AuditSummary,
}

impl AuditLog {
    /// Opens the block log for appending, if one is configured.
    pub async fn open(settings: AuditSettings) -> Result<Self, std::io::Error> {
        let file = match &settings.block_log_path {
            Some(path) => Some(open_append(path).await?),
            None => None,
        };
        Ok(Self {
            settings,
            file,
            summary: AuditSummary::default(),
        })
    }

    /// Processes events until the channel closes or shutdown is signalled,
    /// then drains whatever is already queued.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<DecisionEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> AuditSummary {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.record(&event).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    debug!("Audit log draining queued events");
                    while let Ok(event) = events.try_recv() {
                        self.record(&event).await;
                    }
                    break;
                }
            }
        }

        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush().await {
                warn!("Failed to flush block log: {}", e);
            }
        }
        info!(
            "📝 Audit log closed - {} blocked, {} allowed recorded",
            self.summary.blocked, self.summary.allowed
        );
        self.summary
    }

    async fn record(&mut self, event: &DecisionEvent) {
        if !event.is_blocked() {
            self.summary.allowed += 1;
            if self.settings.log_allowed {
                info!(
                    "✅ Allowed {} ({}) via {} in {}µs",
                    event.raw_input, event.country, event.detail, event.latency_micros
                );
            }
            return;
        }

        self.summary.blocked += 1;
        if self.settings.log_blocked {
            warn!(
                "🚫 Blocked {} ({}) - {}: {}",
                event.raw_input, event.country, event.reason, event.detail
            );
        }

        if let Some(file) = self.file.as_mut() {
            let mut line = format_block_line(event, &Local::now());
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()).await {
                self.summary.write_failures += 1;
                warn!("Failed to write block log entry: {}", e);
            }
        }
    }
}

async fn open_append(path: &Path) -> Result<tokio::fs::File, std::io::Error> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
