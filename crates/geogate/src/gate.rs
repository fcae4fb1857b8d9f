//! TCP access gate.
//!
//! Accepts player connections, asks the access filter for a verdict before
//! reading a single byte, and either closes the socket or relays it to the
//! game server.

use crate::config::GateSettings;
use access_filter::AccessFilter;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Gate statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub accepted: u64,
    pub allowed: u64,
    pub denied: u64,
    pub at_capacity: u64,
    pub upstream_failures: u64,
    pub active_relays: u64,
}

#[derive(Debug, Default)]
struct GateCounters {
    accepted: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    at_capacity: AtomicU64,
    upstream_failures: AtomicU64,
    active_relays: AtomicU64,
}

/// Filtering TCP relay in front of the game server.
pub struct Gate {
    filter: Arc<AccessFilter>,
    upstream: String,
    connect_timeout: Duration,
    permits: Arc<Semaphore>,
    counters: GateCounters,
}

impl Gate {
    pub fn new(filter: Arc<AccessFilter>, settings: &GateSettings) -> Self {
        Self {
            filter,
            upstream: settings.upstream_address.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout),
            permits: Arc::new(Semaphore::new(settings.max_connections)),
            counters: GateCounters::default(),
        }
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            at_capacity: self.counters.at_capacity.load(Ordering::Relaxed),
            upstream_failures: self.counters.upstream_failures.load(Ordering::Relaxed),
            active_relays: self.counters.active_relays.load(Ordering::Relaxed),
        }
    }

    /// Runs the accept loop until shutdown is signalled.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = listener.local_addr() {
            info!("🚪 Gate listening on {} -> {}", addr, self.upstream);
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gate = Arc::clone(&self);
                        tokio::spawn(async move {
                            gate.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        // Usually descriptor exhaustion; back off instead of spinning
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.recv() => {
                    info!("🛑 Gate accept loop stopping - shutdown initiated");
                    break;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        let verdict = match self.filter.evaluate_addr(peer.ip()).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Closing connection from {}: {}", peer, e);
                self.counters.denied.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if !verdict.is_allowed() {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            debug!("Refused {} ({}, {})", peer, verdict.country, verdict.reason);
            return;
        }

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            self.counters.at_capacity.fetch_add(1, Ordering::Relaxed);
            warn!("⚠️ Connection limit reached, refusing {}", peer);
            return;
        };

        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        self.relay(stream, peer, permit).await;
    }

    async fn relay(&self, mut inbound: TcpStream, peer: SocketAddr, _permit: OwnedSemaphorePermit) {
        let mut outbound = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.upstream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to reach upstream {} for {}: {}", self.upstream, peer, e);
                return;
            }
            Err(_) => {
                self.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Timed out connecting to upstream {} for {}", self.upstream, peer);
                return;
            }
        };

        let _ = inbound.set_nodelay(true);
        let _ = outbound.set_nodelay(true);

        self.counters.active_relays.fetch_add(1, Ordering::Relaxed);
        match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
            Ok((to_server, to_client)) => {
                debug!("Relay for {} closed ({} bytes up, {} bytes down)", peer, to_server, to_client);
            }
            Err(e) => debug!("Relay for {} ended: {}", peer, e),
        }
        self.counters.active_relays.fetch_sub(1, Ordering::Relaxed);
    }
}
