//! The access filter: one allow/deny verdict per connection attempt.
//!
//! ```text
//! evaluate(ip) -> parse -> guard -> cache -> snapshot.load() -> provider.resolve()
//!                                                           -> RuleSet::decide -> cache.put
//! reload(set)  -> snapshot.store()     (readers never block, never see a mix)
//! ```
//!
//! The active [`RuleSet`] lives behind an `ArcSwapOption`; every evaluation
//! works against the snapshot it loaded first, so a reload racing with an
//! evaluation is either entirely visible to it or not at all.

use crate::cache::{CacheStats, DecisionCache};
use crate::config::FilterConfig;
use crate::error::FilterError;
use crate::events::{DecisionEvent, DecisionReason, EventSink};
use crate::geo::{open_database, GeoLookupProvider, UnavailableProvider};
use crate::guard::{ConnectionGuard, GuardBlock, GuardStats};
use crate::rules::{RuleConfig, RuleSet};
use crate::types::{Action, ClientIp, CountryCode, Decision};
use arc_swap::{ArcSwap, ArcSwapOption};
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Lifecycle of an [`AccessFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterState {
    /// No rule set installed yet; evaluations fail with `NotReady`
    Uninitialized,
    Ready,
    /// Terminal
    Shutdown,
}

impl fmt::Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterState::Uninitialized => f.write_str("uninitialized"),
            FilterState::Ready => f.write_str("ready"),
            FilterState::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    /// `None` when the input could not be parsed
    pub ip: Option<IpAddr>,
    pub action: Action,
    pub reason: DecisionReason,
    pub country: CountryCode,
    /// The rule-set decision, for `Rule` and `Cached` verdicts
    pub decision: Option<Decision>,
    pub guard_block: Option<GuardBlock>,
    /// Decision-path failure that forced a deny
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<FilterError>,
    pub rule_version: u64,
    pub latency_micros: u64,
}

impl Verdict {
    fn new(ip: Option<IpAddr>, action: Action, reason: DecisionReason, rule_version: u64) -> Self {
        Self {
            ip,
            action,
            reason,
            country: CountryCode::Unknown,
            decision: None,
            guard_block: None,
            error: None,
            rule_version,
            latency_micros: 0,
        }
    }

    fn from_decision(decision: Decision, reason: DecisionReason) -> Self {
        let mut verdict = Self::new(Some(decision.ip), decision.action, reason, decision.rule_version);
        verdict.country = decision.country;
        verdict.decision = Some(decision);
        verdict
    }

    pub fn is_allowed(&self) -> bool {
        self.action.is_allow()
    }

    /// Human-readable cause, used for logs and events.
    pub fn detail(&self) -> String {
        if let Some(error) = &self.error {
            return error.to_string();
        }
        if let Some(block) = &self.guard_block {
            return block.to_string();
        }
        match self.decision.as_ref().and_then(|d| d.matched_rule.as_ref()) {
            Some(rule) => rule.to_string(),
            None => format!("default {}", self.action),
        }
    }
}

fn serialize_error<S: Serializer>(error: &Option<FilterError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Point-in-time filter statistics.
#[derive(Debug, Clone, Serialize)]
pub struct FilterStats {
    pub state: FilterState,
    pub rule_version: Option<u64>,
    pub rules: usize,
    pub database: String,
    pub evaluations: u64,
    pub allowed: u64,
    pub denied: u64,
    pub invalid_inputs: u64,
    pub timeouts: u64,
    pub guard_blocks: u64,
    pub dropped_events: u64,
    pub cache: CacheStats,
    pub guard: GuardStats,
}

#[derive(Debug, Default)]
struct FilterCounters {
    evaluations: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    invalid_inputs: AtomicU64,
    timeouts: AtomicU64,
    guard_blocks: AtomicU64,
}

/// Geolocation-aware connection filter.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct AccessFilter {
    config: FilterConfig,
    snapshot: ArcSwapOption<RuleSet>,
    provider: ArcSwap<Box<dyn GeoLookupProvider>>,
    cache: DecisionCache,
    guard: ConnectionGuard,
    events: EventSink,
    /// Bounds blocking lookups still running, including timed-out ones
    lookup_permits: Arc<Semaphore>,
    shutdown: AtomicBool,
    /// Held while a rule set is built and installed, and during shutdown
    reload_lock: Mutex<()>,
    last_version: AtomicU64,
    counters: FilterCounters,
}

impl AccessFilter {
    /// Creates an uninitialized filter with no geolocation database.
    ///
    /// Evaluations fail with [`FilterError::NotReady`] until a rule set is
    /// installed with [`reload`](Self::reload) or
    /// [`reload_config`](Self::reload_config).
    ///
    /// # Arguments
    ///
    /// * `config` - Cache, timeout, event and guard settings, fixed for the
    ///   life of the filter
    ///
    /// # Returns
    ///
    /// The filter, or [`FilterError::Config`] if `config` fails validation,
    /// or [`FilterError::Io`] if the guard's blacklist file cannot be read.
    pub fn new(config: FilterConfig) -> Result<Self, FilterError> {
        config.validate().map_err(FilterError::Config)?;

        let cache = if config.cache_enabled {
            DecisionCache::new(config.cache_capacity)
        } else {
            DecisionCache::disabled()
        };
        let guard = ConnectionGuard::new(config.guard.clone())?;
        let provider: Box<dyn GeoLookupProvider> = Box::new(UnavailableProvider);
        let lookup_permits = Arc::new(Semaphore::new(config.max_pending_lookups.min(Semaphore::MAX_PERMITS)));

        Ok(Self {
            config,
            snapshot: ArcSwapOption::empty(),
            provider: ArcSwap::from_pointee(provider),
            cache,
            guard,
            events: EventSink::disabled(),
            lookup_permits,
            shutdown: AtomicBool::new(false),
            reload_lock: Mutex::new(()),
            last_version: AtomicU64::new(0),
            counters: FilterCounters::default(),
        })
    }

    /// Routes decision events to `sink`.
    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.events = sink;
        self
    }

    /// Installs the initial geolocation provider.
    pub fn with_provider(self, provider: Box<dyn GeoLookupProvider>) -> Self {
        self.provider.store(Arc::new(provider));
        self
    }

    pub fn state(&self) -> FilterState {
        if self.shutdown.load(Ordering::Acquire) {
            FilterState::Shutdown
        } else if self.snapshot.load().is_some() {
            FilterState::Ready
        } else {
            FilterState::Uninitialized
        }
    }

    /// Version of the active rule set, if any.
    pub fn rule_version(&self) -> Option<u64> {
        self.snapshot.load_full().map(|set| set.version())
    }

    /// The active rule set, if any.
    pub fn snapshot(&self) -> Option<Arc<RuleSet>> {
        self.snapshot.load_full()
    }

    pub fn guard(&self) -> &ConnectionGuard {
        &self.guard
    }

    /// Evaluates an address given as text (bare, bracketed or `ip:port`).
    ///
    /// # Arguments
    ///
    /// * `raw` - The connecting address as the host received it
    ///
    /// # Returns
    ///
    /// A [`Verdict`] for every input, malformed ones included; a malformed
    /// address or a failed lookup is a `Deny` with the cause in
    /// [`Verdict::error`]. `Err` only before the first rule set is installed
    /// ([`FilterError::NotReady`]) or after [`shutdown`](Self::shutdown).
    pub async fn evaluate(&self, raw: &str) -> Result<Verdict, FilterError> {
        let started = Instant::now();
        let snapshot = self.active_snapshot()?;

        match ClientIp::parse(raw) {
            Ok(ip) => Ok(self.evaluate_client(&snapshot, &ip, started).await),
            Err(error) => {
                debug!("Rejecting malformed client address {:?}", raw);
                self.counters.invalid_inputs.fetch_add(1, Ordering::Relaxed);
                let mut verdict = Verdict::new(None, Action::Deny, DecisionReason::InvalidInput, snapshot.version());
                verdict.error = Some(error);
                Ok(self.finish(verdict, raw, started))
            }
        }
    }

    /// Evaluates an address the host already parsed, e.g. a socket peer.
    pub async fn evaluate_addr(&self, addr: IpAddr) -> Result<Verdict, FilterError> {
        let started = Instant::now();
        let snapshot = self.active_snapshot()?;
        let ip = ClientIp::from_addr(addr);
        Ok(self.evaluate_client(&snapshot, &ip, started).await)
    }

    async fn evaluate_client(&self, snapshot: &RuleSet, ip: &ClientIp, started: Instant) -> Verdict {
        let addr = ip.addr();

        if self.guard.is_enabled() && !snapshot.is_exempt(addr) {
            if let Some(block) = self.guard.check(addr) {
                self.counters.guard_blocks.fetch_add(1, Ordering::Relaxed);
                let mut verdict = Verdict::new(Some(addr), Action::Deny, DecisionReason::Guard, snapshot.version());
                verdict.guard_block = Some(block);
                return self.finish(verdict, ip.original(), started);
            }
        }

        if let Some(decision) = self.cache.get(&addr) {
            return self.finish(Verdict::from_decision(decision, DecisionReason::Cached), ip.original(), started);
        }

        let country = match self.resolve_country(addr).await {
            Ok(country) => country,
            Err(error) => {
                warn!("⏱️ Geolocation lookup for {} failed: {}; denying", addr, error);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let mut verdict = Verdict::new(Some(addr), Action::Deny, DecisionReason::Timeout, snapshot.version());
                verdict.error = Some(error);
                return self.finish(verdict, ip.original(), started);
            }
        };

        let decision = snapshot.decide(addr, country).with_ttl(self.config.cache_ttl());
        self.cache.put(addr, decision.clone());
        self.finish(Verdict::from_decision(decision, DecisionReason::Rule), ip.original(), started)
    }

    async fn resolve_country(&self, addr: IpAddr) -> Result<CountryCode, FilterError> {
        let provider = self.provider.load_full();
        let Some(limit) = self.config.lookup_timeout() else {
            return Ok(provider.resolve(addr));
        };

        let Ok(permit) = Arc::clone(&self.lookup_permits).try_acquire_owned() else {
            return Err(FilterError::LookupBacklog(self.config.max_pending_lookups));
        };
        let lookup = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            provider.resolve(addr)
        });
        match tokio::time::timeout(limit, lookup).await {
            Ok(Ok(country)) => Ok(country),
            Ok(Err(e)) => {
                warn!("Geolocation lookup task for {} failed: {}", addr, e);
                Ok(CountryCode::Unknown)
            }
            Err(_) => Err(FilterError::Timeout(self.config.lookup_timeout_ms)),
        }
    }

    fn finish(&self, mut verdict: Verdict, raw: &str, started: Instant) -> Verdict {
        verdict.latency_micros = started.elapsed().as_micros() as u64;

        self.counters.evaluations.fetch_add(1, Ordering::Relaxed);
        match verdict.action {
            Action::Allow => self.counters.allowed.fetch_add(1, Ordering::Relaxed),
            Action::Deny => self.counters.denied.fetch_add(1, Ordering::Relaxed),
        };

        if self.events.is_enabled() {
            let event = DecisionEvent::new(
                verdict.ip,
                raw,
                verdict.action,
                verdict.reason,
                verdict.country,
                verdict.detail(),
            )
            .with_latency_micros(verdict.latency_micros)
            .with_rule_version(verdict.rule_version);
            self.events.emit(event);
        }

        verdict
    }

    fn active_snapshot(&self) -> Result<Arc<RuleSet>, FilterError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(FilterError::Shutdown);
        }
        self.snapshot.load_full().ok_or(FilterError::NotReady)
    }

    fn ensure_running(&self) -> Result<(), FilterError> {
        if self.shutdown.load(Ordering::Acquire) {
            Err(FilterError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Installs a compiled rule set atomically.
    pub fn reload(&self, rule_set: RuleSet) -> Result<(), FilterError> {
        let _reloading = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_running()?;
        self.install(rule_set);
        Ok(())
    }

    fn install(&self, rule_set: RuleSet) {
        let summary = rule_set.summary();
        self.last_version.fetch_max(rule_set.version(), Ordering::AcqRel);
        self.snapshot.store(Some(Arc::new(rule_set)));

        if self.config.flush_on_reload {
            self.cache.flush();
        }
        info!("📜 Installed rule set {}", summary);
    }

    /// Compiles a rule document and installs it under the next version.
    ///
    /// Reloads are serialized, so concurrent callers install their rule sets
    /// in version order.
    ///
    /// # Arguments
    ///
    /// * `config` - The rule document to compile
    ///
    /// # Returns
    ///
    /// `Ok(())` once the new rule set is active. On
    /// [`FilterError::Config`] the document is rejected and the active rule
    /// set stays in place; after shutdown, [`FilterError::Shutdown`].
    pub fn reload_config(&self, config: &RuleConfig) -> Result<(), FilterError> {
        let _reloading = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_running()?;

        let version = self.last_version.load(Ordering::Acquire) + 1;
        let rule_set = RuleSet::build(config, version).map_err(|e| {
            warn!("❌ Rejected rule configuration: {}", e);
            e
        })?;
        for conflict in rule_set.conflicts() {
            warn!("⚠️ Conflicting rules: {}", conflict);
        }
        self.install(rule_set);
        Ok(())
    }

    /// Opens a database file and swaps it in. On failure the current
    /// provider stays active.
    pub fn reload_database<P: AsRef<Path>>(&self, path: P) -> Result<(), FilterError> {
        self.ensure_running()?;
        let provider = open_database(path.as_ref())?;
        self.set_provider(provider)
    }

    /// Swaps in a geolocation provider.
    pub fn set_provider(&self, provider: Box<dyn GeoLookupProvider>) -> Result<(), FilterError> {
        let _reloading = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_running()?;
        info!("🌍 Geolocation provider: {}", provider.describe());
        self.provider.store(Arc::new(provider));
        Ok(())
    }

    pub fn database_description(&self) -> String {
        self.provider.load().describe()
    }

    /// Drops every cached decision.
    pub fn flush_cache(&self) {
        self.cache.flush();
        info!("🧹 Decision cache flushed");
    }

    /// Reaps expired cache entries and guard state.
    pub fn sweep(&self) {
        self.cache.sweep();
        self.guard.sweep();
    }

    pub fn stats(&self) -> FilterStats {
        let snapshot = self.snapshot.load_full();
        FilterStats {
            state: self.state(),
            rule_version: snapshot.as_ref().map(|set| set.version()),
            rules: snapshot.as_ref().map(|set| set.len()).unwrap_or(0),
            database: self.database_description(),
            evaluations: self.counters.evaluations.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            invalid_inputs: self.counters.invalid_inputs.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            guard_blocks: self.counters.guard_blocks.load(Ordering::Relaxed),
            dropped_events: self.events.dropped(),
            cache: self.cache.stats(),
            guard: self.guard.stats(),
        }
    }

    /// Stops the filter for good: releases the rule set and the database
    /// and empties the cache. Later calls are no-ops.
    pub fn shutdown(&self) {
        let _reloading = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let released: Box<dyn GeoLookupProvider> = Box::new(UnavailableProvider);
        self.provider.store(Arc::new(released));
        self.snapshot.store(None);
        self.cache.flush();
        info!("🛑 Access filter shut down");
    }
}

impl fmt::Debug for AccessFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessFilter")
            .field("state", &self.state())
            .field("rule_version", &self.rule_version())
            .field("database", &self.database_description())
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::CidrTableProvider;
    use crate::guard::GuardConfig;
    use crate::rules::{FilterMode, RawRule, RawRuleKind};
    use std::time::Duration;

    const TABLE: &str = "\
192.0.2.0/24,US
198.51.100.0/24,VN
203.0.113.0/24,CN
2001:db8::/32,DE
";

    fn table() -> Box<dyn GeoLookupProvider> {
        Box::new(CidrTableProvider::parse(TABLE, "test-table").unwrap())
    }

    fn filter_with(config: FilterConfig, rules: &RuleConfig) -> AccessFilter {
        let filter = AccessFilter::new(config).unwrap().with_provider(table());
        filter.reload_config(rules).unwrap();
        filter
    }

    fn whitelist(countries: &[&str]) -> RuleConfig {
        RuleConfig {
            mode: Some(FilterMode::Whitelist),
            countries: countries.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Sleeps on every lookup to stand in for a stalled database.
    struct SlowProvider(Duration);

    impl GeoLookupProvider for SlowProvider {
        fn resolve(&self, _ip: IpAddr) -> CountryCode {
            std::thread::sleep(self.0);
            CountryCode::parse("US").unwrap_or(CountryCode::Unknown)
        }

        fn describe(&self) -> String {
            "slow".to_string()
        }
    }

    #[tokio::test]
    async fn test_uninitialized_filter_is_not_ready() {
        let filter = AccessFilter::new(FilterConfig::default()).unwrap();
        assert_eq!(filter.state(), FilterState::Uninitialized);
        assert_eq!(filter.evaluate("192.0.2.1").await.unwrap_err(), FilterError::NotReady);
    }

    #[tokio::test]
    async fn test_default_deny_with_empty_rules() {
        let filter = filter_with(FilterConfig::default(), &RuleConfig::default());
        assert_eq!(filter.state(), FilterState::Ready);

        let verdict = filter.evaluate("192.0.2.1").await.unwrap();
        assert_eq!(verdict.action, Action::Deny);
        assert_eq!(verdict.reason, DecisionReason::Rule);
        assert!(verdict.decision.unwrap().matched_rule.is_none());
    }

    #[tokio::test]
    async fn test_country_whitelist() {
        let filter = filter_with(FilterConfig::default(), &whitelist(&["VN"]));

        let allowed = filter.evaluate("198.51.100.4").await.unwrap();
        assert!(allowed.is_allowed());
        assert_eq!(allowed.country.as_str(), "VN");

        let denied = filter.evaluate("192.0.2.4:27015").await.unwrap();
        assert!(!denied.is_allowed());
        assert_eq!(denied.country.as_str(), "US");
    }

    #[tokio::test]
    async fn test_exact_ip_beats_country() {
        let mut rules = whitelist(&["VN"]);
        rules.rules.push(RawRule::new(RawRuleKind::Ip, "198.51.100.9", Action::Deny));
        rules.rules.push(RawRule::new(RawRuleKind::Ip, "192.0.2.9", Action::Allow));
        let filter = filter_with(FilterConfig::default(), &rules);

        assert_eq!(filter.evaluate("198.51.100.9").await.unwrap().action, Action::Deny);
        assert_eq!(filter.evaluate("192.0.2.9").await.unwrap().action, Action::Allow);
        assert_eq!(filter.evaluate("198.51.100.10").await.unwrap().action, Action::Allow);
    }

    #[tokio::test]
    async fn test_longest_cidr_prefix_wins() {
        let rules = RuleConfig {
            rules: vec![
                RawRule::new(RawRuleKind::Cidr, "203.0.0.0/8", Action::Allow),
                RawRule::new(RawRuleKind::Cidr, "203.0.113.0/24", Action::Deny),
            ],
            ..Default::default()
        };
        let filter = filter_with(FilterConfig::default(), &rules);

        assert_eq!(filter.evaluate("203.0.113.7").await.unwrap().action, Action::Deny);
        assert_eq!(filter.evaluate("203.0.5.7").await.unwrap().action, Action::Allow);
    }

    #[tokio::test]
    async fn test_malformed_input_denies_with_error() {
        let filter = filter_with(FilterConfig::default(), &whitelist(&["US"]));

        for raw in ["", "999.999.1.1", "not-an-ip", "192.0.2"] {
            let verdict = filter.evaluate(raw).await.unwrap();
            assert_eq!(verdict.action, Action::Deny, "{raw:?}");
            assert_eq!(verdict.reason, DecisionReason::InvalidInput);
            assert!(matches!(verdict.error, Some(FilterError::InvalidInput(_))));
        }
        assert_eq!(filter.stats().invalid_inputs, 4);
    }

    #[tokio::test]
    async fn test_every_valid_address_gets_a_verdict() {
        let filter = filter_with(FilterConfig::default(), &whitelist(&["US", "DE"]));
        let inputs = ["0.0.0.0", "255.255.255.255", "::", "::1", "::ffff:192.0.2.1", "[2001:db8::1]:443", "10.1.2.3"];
        for raw in inputs {
            let verdict = filter.evaluate(raw).await.unwrap();
            assert!(verdict.error.is_none(), "{raw:?} produced {:?}", verdict.error);
        }
        // IPv4-mapped IPv6 is matched as IPv4
        assert!(filter.evaluate("::ffff:192.0.2.1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_repeat_evaluation_is_idempotent() {
        let filter = filter_with(FilterConfig::default(), &whitelist(&["VN"]));

        let first = filter.evaluate("198.51.100.20").await.unwrap();
        let second = filter.evaluate("198.51.100.20").await.unwrap();
        assert_eq!(first.action, second.action);
        assert_eq!(first.reason, DecisionReason::Rule);
        assert_eq!(second.reason, DecisionReason::Cached);
        assert_eq!(first.decision, second.decision);
    }

    #[tokio::test]
    async fn test_cached_decision_expires() {
        let config = FilterConfig {
            cache_ttl_secs: 1,
            ..Default::default()
        };
        let filter = filter_with(config, &whitelist(&["VN"]));

        assert_eq!(filter.evaluate("198.51.100.1").await.unwrap().reason, DecisionReason::Rule);
        assert_eq!(filter.evaluate("198.51.100.1").await.unwrap().reason, DecisionReason::Cached);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(filter.evaluate("198.51.100.1").await.unwrap().reason, DecisionReason::Rule);
    }

    #[tokio::test]
    async fn test_rejected_reload_keeps_previous_rules() {
        let filter = filter_with(FilterConfig::default(), &whitelist(&["VN"]));
        let before = filter.rule_version();

        let mut broken = whitelist(&["VN"]);
        broken.rules.push(RawRule::new(RawRuleKind::Cidr, "10.0.0.0/99", Action::Allow));
        assert!(matches!(filter.reload_config(&broken), Err(FilterError::Config(_))));

        assert_eq!(filter.rule_version(), before);
        assert!(filter.evaluate("198.51.100.1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_reload_bumps_version_and_optionally_flushes() {
        let config = FilterConfig {
            flush_on_reload: true,
            ..Default::default()
        };
        let filter = filter_with(config, &whitelist(&["VN"]));
        assert_eq!(filter.rule_version(), Some(1));
        assert!(filter.evaluate("198.51.100.1").await.unwrap().is_allowed());

        filter.reload_config(&whitelist(&["US"])).unwrap();
        assert_eq!(filter.rule_version(), Some(2));

        let verdict = filter.evaluate("198.51.100.1").await.unwrap();
        assert_eq!(verdict.reason, DecisionReason::Rule);
        assert_eq!(verdict.action, Action::Deny);
        assert_eq!(verdict.rule_version, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reload_is_atomic_under_concurrency() {
        let config = FilterConfig {
            cache_enabled: false,
            ..Default::default()
        };
        let filter = Arc::new(AccessFilter::new(config).unwrap().with_provider(table()));
        // Odd versions allow everything, even versions deny everything
        filter.reload(RuleSet::empty(1, Some(Action::Allow))).unwrap();

        let writer = {
            let filter = Arc::clone(&filter);
            tokio::spawn(async move {
                for version in 2..200u64 {
                    let action = if version % 2 == 1 { Action::Allow } else { Action::Deny };
                    filter.reload(RuleSet::empty(version, Some(action))).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let filter = Arc::clone(&filter);
                tokio::spawn(async move {
                    for i in 0..200u32 {
                        let ip = IpAddr::from(std::net::Ipv4Addr::from(0xc000_0200 + (i % 256)));
                        let verdict = filter.evaluate_addr(ip).await.unwrap();
                        let expected = if verdict.rule_version % 2 == 1 { Action::Allow } else { Action::Deny };
                        assert_eq!(verdict.action, expected, "torn read at v{}", verdict.rule_version);
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(filter.rule_version(), Some(199));
    }

    #[tokio::test]
    async fn test_stalled_lookup_times_out_and_denies() {
        let config = FilterConfig {
            lookup_timeout_ms: 20,
            ..Default::default()
        };
        let filter = AccessFilter::new(config)
            .unwrap()
            .with_provider(Box::new(SlowProvider(Duration::from_millis(300))));
        filter.reload_config(&whitelist(&["US"])).unwrap();

        let verdict = filter.evaluate("192.0.2.1").await.unwrap();
        assert_eq!(verdict.action, Action::Deny);
        assert_eq!(verdict.reason, DecisionReason::Timeout);
        assert_eq!(verdict.error, Some(FilterError::Timeout(20)));

        // Timeouts are never cached
        let again = filter.evaluate("192.0.2.1").await.unwrap();
        assert_eq!(again.reason, DecisionReason::Timeout);
        assert_eq!(filter.stats().timeouts, 2);
    }

    #[tokio::test]
    async fn test_lookup_backlog_fails_closed() {
        let config = FilterConfig {
            lookup_timeout_ms: 20,
            max_pending_lookups: 1,
            cache_enabled: false,
            ..Default::default()
        };
        let filter = AccessFilter::new(config)
            .unwrap()
            .with_provider(Box::new(SlowProvider(Duration::from_millis(300))));
        filter.reload_config(&whitelist(&["US"])).unwrap();

        let stalled = filter.evaluate("192.0.2.1").await.unwrap();
        assert_eq!(stalled.error, Some(FilterError::Timeout(20)));

        // The timed-out lookup still holds the only slot
        let refused = filter.evaluate("192.0.2.2").await.unwrap();
        assert_eq!(refused.action, Action::Deny);
        assert_eq!(refused.reason, DecisionReason::Timeout);
        assert_eq!(refused.error, Some(FilterError::LookupBacklog(1)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        let retried = filter.evaluate("192.0.2.3").await.unwrap();
        assert_eq!(retried.error, Some(FilterError::Timeout(20)));
    }

    #[test]
    fn test_concurrent_config_reloads_install_newest() {
        let filter = Arc::new(filter_with(FilterConfig::default(), &whitelist(&["VN"])));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let filter = Arc::clone(&filter);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        filter.reload_config(&whitelist(&["US"])).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(filter.rule_version(), Some(201));
        assert_eq!(filter.stats().rule_version, Some(201));
    }

    #[test]
    fn test_rejected_config_does_not_consume_a_version() {
        let filter = filter_with(FilterConfig::default(), &whitelist(&["VN"]));
        assert!(filter.reload_config(&whitelist(&["XYZ"])).is_err());
        filter.reload_config(&whitelist(&["US"])).unwrap();
        assert_eq!(filter.rule_version(), Some(2));
    }

    #[tokio::test]
    async fn test_local_addresses_bypass_guard_with_allow_local() {
        let config = FilterConfig {
            guard: GuardConfig {
                enabled: true,
                max_attempts_per_ip: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let rules = RuleConfig {
            allow_local: true,
            ..whitelist(&["VN"])
        };
        let filter = filter_with(config, &rules);

        for _ in 0..10 {
            let verdict = filter.evaluate("192.168.1.20").await.unwrap();
            assert!(verdict.is_allowed());
            assert!(verdict.guard_block.is_none());
        }
        assert_eq!(filter.evaluate("198.51.100.1").await.unwrap().reason, DecisionReason::Rule);
        assert_eq!(filter.evaluate("198.51.100.1").await.unwrap().reason, DecisionReason::Guard);
    }

    #[tokio::test]
    async fn test_inline_lookup_without_timeout() {
        let config = FilterConfig {
            lookup_timeout_ms: 0,
            ..Default::default()
        };
        let filter = AccessFilter::new(config)
            .unwrap()
            .with_provider(Box::new(SlowProvider(Duration::from_millis(30))));
        filter.reload_config(&whitelist(&["US"])).unwrap();

        assert!(filter.evaluate("192.0.2.1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_failed_database_reload_keeps_provider() {
        let filter = filter_with(FilterConfig::default(), &whitelist(&["VN"]));
        let result = filter.reload_database("/definitely/not/here.mmdb");
        assert!(matches!(result, Err(FilterError::DatabaseLoad { .. })));
        assert!(filter.database_description().starts_with("cidr-table"));
        assert!(filter.evaluate("198.51.100.1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_database_reload_from_file() {
        let file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        std::fs::write(file.path(), "198.51.100.0/24,JP\n").unwrap();

        let filter = filter_with(FilterConfig::default(), &whitelist(&["JP"]));
        assert!(!filter.evaluate("198.51.100.1").await.unwrap().is_allowed());

        filter.reload_database(file.path()).unwrap();
        filter.flush_cache();
        assert!(filter.evaluate("198.51.100.1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_guard_blocks_are_not_cached_and_exempt_ips_bypass() {
        let config = FilterConfig {
            guard: GuardConfig {
                enabled: true,
                max_attempts_per_ip: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut rules = whitelist(&["VN"]);
        rules.whitelisted_ips.push("198.51.100.50".to_string());
        let filter = filter_with(config, &rules);

        for _ in 0..2 {
            assert!(filter.evaluate("198.51.100.1").await.unwrap().is_allowed());
        }
        let blocked = filter.evaluate("198.51.100.1").await.unwrap();
        assert_eq!(blocked.reason, DecisionReason::Guard);
        assert_eq!(blocked.guard_block, Some(GuardBlock::TooManyAttempts));

        let still_blocked = filter.evaluate("198.51.100.1").await.unwrap();
        assert_eq!(still_blocked.guard_block, Some(GuardBlock::TemporarilyBlocked));

        for _ in 0..10 {
            assert!(filter.evaluate("198.51.100.50").await.unwrap().is_allowed());
        }
        assert_eq!(filter.stats().guard_blocks, 2);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let (sink, mut receiver) = EventSink::channel(16);
        let filter = AccessFilter::new(FilterConfig::default())
            .unwrap()
            .with_provider(table())
            .with_event_sink(sink);
        filter.reload_config(&whitelist(&["VN"])).unwrap();

        filter.evaluate("192.0.2.1").await.unwrap();
        filter.evaluate("bogus").await.unwrap();

        let first = receiver.recv().await.unwrap();
        assert!(first.is_blocked());
        assert_eq!(first.reason, DecisionReason::Rule);
        assert_eq!(first.country.as_str(), "US");
        assert_eq!(first.rule_version, 1);

        let second = receiver.recv().await.unwrap();
        assert_eq!(second.reason, DecisionReason::InvalidInput);
        assert_eq!(second.ip, None);
        assert_eq!(second.raw_input, "bogus");
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let filter = filter_with(FilterConfig::default(), &whitelist(&["VN"]));
        filter.shutdown();
        filter.shutdown();

        assert_eq!(filter.state(), FilterState::Shutdown);
        assert_eq!(filter.evaluate("198.51.100.1").await.unwrap_err(), FilterError::Shutdown);
        assert_eq!(filter.reload_config(&whitelist(&["VN"])).unwrap_err(), FilterError::Shutdown);
        assert_eq!(filter.database_description(), UnavailableProvider.describe());
    }

    #[tokio::test]
    async fn test_stats_and_verdict_serialization() {
        let filter = filter_with(FilterConfig::default(), &whitelist(&["VN"]));
        filter.evaluate("198.51.100.1").await.unwrap();
        filter.evaluate("198.51.100.1").await.unwrap();
        let verdict = filter.evaluate("192.0.2.1").await.unwrap();

        let stats = filter.stats();
        assert_eq!(stats.evaluations, 3);
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.cache.hits, 1);
        assert_eq!(stats.rule_version, Some(1));

        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["action"], "deny");
        assert_eq!(json["reason"], "rule");
        assert_eq!(json["country"], "US");
        assert!(json["error"].is_null());
    }
}
