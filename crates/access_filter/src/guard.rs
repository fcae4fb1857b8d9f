//! Connection flood protection.
//!
//! Tracks connection attempts per address and globally. An address that
//! retries too quickly is blocked for a while; an address blocked too many
//! times lands on a permanent blacklist that can be persisted to disk.

use crate::error::FilterError;
use crate::types::ClientIp;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

fn default_max_connections_per_second() -> u32 {
    50
}

fn default_max_attempts_per_ip() -> u32 {
    5
}

fn default_ip_window_secs() -> u64 {
    60
}

fn default_temp_block_secs() -> u64 {
    1800
}

fn default_perm_block_threshold() -> u32 {
    5
}

fn default_strike_decay_secs() -> u64 {
    86_400
}

/// Flood protection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Whether the guard is consulted at all
    #[serde(default)]
    pub enabled: bool,
    /// Connection attempts accepted per second across all addresses
    #[serde(default = "default_max_connections_per_second")]
    pub max_connections_per_second: u32,
    /// Attempts one address may make inside `ip_window_secs`
    #[serde(default = "default_max_attempts_per_ip")]
    pub max_attempts_per_ip: u32,
    /// Length of the per-address counting window
    #[serde(default = "default_ip_window_secs")]
    pub ip_window_secs: u64,
    /// How long an address stays blocked after exceeding its window
    #[serde(default = "default_temp_block_secs")]
    pub temp_block_secs: u64,
    /// Temporary blocks before an address is blacklisted for good
    #[serde(default = "default_perm_block_threshold")]
    pub perm_block_threshold: u32,
    /// Strikes older than this are forgotten
    #[serde(default = "default_strike_decay_secs")]
    pub strike_decay_secs: u64,
    /// File the permanent blacklist is loaded from and saved to
    #[serde(default)]
    pub blacklist_path: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_connections_per_second: default_max_connections_per_second(),
            max_attempts_per_ip: default_max_attempts_per_ip(),
            ip_window_secs: default_ip_window_secs(),
            temp_block_secs: default_temp_block_secs(),
            perm_block_threshold: default_perm_block_threshold(),
            strike_decay_secs: default_strike_decay_secs(),
            blacklist_path: None,
        }
    }
}

/// Why the guard refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardBlock {
    Blacklisted,
    TemporarilyBlocked,
    Overloaded,
    TooManyAttempts,
}

impl fmt::Display for GuardBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardBlock::Blacklisted => f.write_str("permanent blacklist"),
            GuardBlock::TemporarilyBlocked => f.write_str("temporary block"),
            GuardBlock::Overloaded => f.write_str("server overloaded"),
            GuardBlock::TooManyAttempts => f.write_str("too many connection attempts"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AttemptWindow {
    started: Instant,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
struct Strikes {
    count: u32,
    last: Instant,
}

/// The permanent blacklist and its file.
#[derive(Debug, Default)]
struct BlacklistStore {
    path: Option<PathBuf>,
    entries: DashSet<IpAddr>,
    /// Held for a whole save, snapshot included, so the last writer always
    /// writes the newest set
    write_lock: Mutex<()>,
    save_queued: AtomicBool,
}

impl BlacklistStore {
    fn sorted(&self) -> Vec<IpAddr> {
        let mut list: Vec<IpAddr> = self.entries.iter().map(|ip| *ip).collect();
        list.sort();
        list
    }

    fn load(&self) -> Result<(), FilterError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let text = std::fs::read_to_string(path)?;
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match ClientIp::parse(line) {
                Ok(ip) => {
                    self.entries.insert(ip.addr());
                }
                Err(_) => warn!("Skipping malformed blacklist entry {:?} in {}", line, path.display()),
            }
        }
        info!("Loaded {} address(es) from blacklist {}", self.entries.len(), path.display());
        Ok(())
    }

    /// Rewrites the file from the current set: temp file, then rename.
    fn save(&self) -> Result<(), FilterError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut contents = String::from("# Permanent connection blacklist\n# One address per line\n");
        for ip in self.sorted() {
            contents.push_str(&ip.to_string());
            contents.push('\n');
        }

        let tmp_path = temp_path(path);
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Saves on the blocking pool when a runtime is available, otherwise
    /// inline. Saves requested while one is already queued share it.
    fn save_in_background(self: &Arc<Self>) {
        if self.path.is_none() || self.save_queued.swap(true, Ordering::AcqRel) {
            return;
        }

        let store = Arc::clone(self);
        let job = move || {
            store.save_queued.store(false, Ordering::Release);
            match store.save() {
                Ok(()) => debug!("Blacklist saved ({} entries)", store.entries.len()),
                Err(e) => warn!("Failed to persist blacklist: {}", e),
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Guard statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardStats {
    pub enabled: bool,
    pub connections_this_second: u32,
    pub tracked_ips: usize,
    pub temp_blocked: usize,
    pub perm_blocked: usize,
    pub tracked_strikes: usize,
    pub blocked_total: u64,
}

/// Per-address and global connection rate guard.
#[derive(Debug)]
pub struct ConnectionGuard {
    config: GuardConfig,
    attempts: DashMap<IpAddr, AttemptWindow>,
    strikes: DashMap<IpAddr, Strikes>,
    temp_blocks: DashMap<IpAddr, Instant>,
    permanent: Arc<BlacklistStore>,
    epoch: Instant,
    second_started_ms: AtomicU64,
    connections_this_second: AtomicU32,
    blocked_total: AtomicU64,
}

impl ConnectionGuard {
    /// Creates a guard, loading the permanent blacklist if one is configured.
    pub fn new(config: GuardConfig) -> Result<Self, FilterError> {
        let permanent = Arc::new(BlacklistStore {
            path: config.blacklist_path.clone(),
            ..Default::default()
        });
        permanent.load()?;

        Ok(Self {
            config,
            attempts: DashMap::new(),
            strikes: DashMap::new(),
            temp_blocks: DashMap::new(),
            permanent,
            epoch: Instant::now(),
            second_started_ms: AtomicU64::new(0),
            connections_this_second: AtomicU32::new(0),
            blocked_total: AtomicU64::new(0),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Records a connection attempt and returns the block reason, if any.
    pub fn check(&self, ip: IpAddr) -> Option<GuardBlock> {
        if !self.config.enabled {
            return None;
        }

        let verdict = self.check_inner(ip);
        if verdict.is_some() {
            self.blocked_total.fetch_add(1, Ordering::Relaxed);
        }
        verdict
    }

    fn check_inner(&self, ip: IpAddr) -> Option<GuardBlock> {
        if self.permanent.entries.contains(&ip) {
            return Some(GuardBlock::Blacklisted);
        }

        if let Some(until) = self.temp_blocks.get(&ip).map(|entry| *entry) {
            if Instant::now() < until {
                return Some(GuardBlock::TemporarilyBlocked);
            }
            self.temp_blocks.remove(&ip);
        }

        if self.record_global_attempt() > self.config.max_connections_per_second {
            return Some(GuardBlock::Overloaded);
        }

        if self.record_ip_attempt(ip) > self.config.max_attempts_per_ip {
            self.attempts.remove(&ip);
            self.apply_temp_block(ip);
            return Some(GuardBlock::TooManyAttempts);
        }

        None
    }

    fn record_global_attempt(&self) -> u32 {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let started = self.second_started_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(started) >= 1000
            && self
                .second_started_ms
                .compare_exchange(started, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.connections_this_second.store(0, Ordering::Release);
        }

        let current = self.connections_this_second.fetch_add(1, Ordering::AcqRel) + 1;
        if current == self.config.max_connections_per_second + 1 {
            warn!("⚠️ Connection flood: more than {} connections/sec", self.config.max_connections_per_second);
        }
        current
    }

    fn record_ip_attempt(&self, ip: IpAddr) -> u32 {
        let window = Duration::from_secs(self.config.ip_window_secs);
        let now = Instant::now();
        let mut entry = self.attempts.entry(ip).or_insert(AttemptWindow { started: now, count: 0 });
        if now.duration_since(entry.started) > window {
            *entry = AttemptWindow { started: now, count: 0 };
        }
        entry.count += 1;
        entry.count
    }

    fn apply_temp_block(&self, ip: IpAddr) {
        let duration = Duration::from_secs(self.config.temp_block_secs);
        self.temp_blocks.insert(ip, Instant::now() + duration);

        let strikes = self.record_strike(ip);
        warn!("🚫 Temporarily blocked {} for {}s (strike {})", ip, duration.as_secs(), strikes);

        if strikes >= self.config.perm_block_threshold && self.promote(ip) {
            self.permanent.save_in_background();
        }
    }

    fn record_strike(&self, ip: IpAddr) -> u32 {
        let now = Instant::now();
        let decay = Duration::from_secs(self.config.strike_decay_secs);
        let mut entry = self.strikes.entry(ip).or_insert(Strikes { count: 0, last: now });
        if now.duration_since(entry.last) > decay {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last = now;
        entry.count
    }

    /// Moves an address onto the in-memory blacklist. Returns `false` if it
    /// was already there.
    fn promote(&self, ip: IpAddr) -> bool {
        self.temp_blocks.remove(&ip);
        self.strikes.remove(&ip);
        if !self.permanent.entries.insert(ip) {
            return false;
        }
        warn!("⛔ Permanently blacklisted {}", ip);
        true
    }

    /// Adds an address to the permanent blacklist and saves the file before
    /// returning. Returns `false` if it was already there.
    pub fn add_permanent(&self, ip: IpAddr) -> Result<bool, FilterError> {
        if !self.promote(ip) {
            return Ok(false);
        }
        self.permanent.save()?;
        Ok(true)
    }

    /// Removes an address from the permanent blacklist and saves the file.
    /// Returns `false` if it was not listed.
    pub fn remove_permanent(&self, ip: IpAddr) -> Result<bool, FilterError> {
        if self.permanent.entries.remove(&ip).is_none() {
            return Ok(false);
        }
        info!("Removed {} from the permanent blacklist", ip);
        self.permanent.save()?;
        Ok(true)
    }

    /// Lifts a temporary block early.
    pub fn remove_temporary(&self, ip: IpAddr) -> bool {
        self.temp_blocks.remove(&ip).is_some()
    }

    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.permanent.entries.contains(&ip)
    }

    /// Sorted copy of the permanent blacklist.
    pub fn blacklist(&self) -> Vec<IpAddr> {
        self.permanent.sorted()
    }

    /// Drops expired windows, temporary blocks and decayed strikes.
    pub fn sweep(&self) {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.ip_window_secs);
        let decay = Duration::from_secs(self.config.strike_decay_secs);
        self.attempts.retain(|_, attempt| now.duration_since(attempt.started) <= window);
        self.temp_blocks.retain(|_, until| *until > now);
        self.strikes.retain(|_, strikes| now.duration_since(strikes.last) <= decay);
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            enabled: self.config.enabled,
            connections_this_second: self.connections_this_second.load(Ordering::Relaxed),
            tracked_ips: self.attempts.len(),
            temp_blocked: self.temp_blocks.len(),
            perm_blocked: self.permanent.entries.len(),
            tracked_strikes: self.strikes.len(),
            blocked_total: self.blocked_total.load(Ordering::Relaxed),
        }
    }
}
