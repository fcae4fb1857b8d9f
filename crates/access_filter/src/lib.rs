//! # Access Filter - Geolocation-Aware Connection Gate
//!
//! Decides, per connection attempt and before the game server does any other
//! work, whether a client address may connect. Decisions come from a rule set
//! keyed on exact addresses, CIDR ranges and countries, with the country taken
//! from a local geolocation database.
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **[`GeoLookupProvider`]** - Address to country; MaxMind `.mmdb` or a CIDR table
//! * **[`RuleSet`]** - Immutable compiled rules, most specific match wins
//! * **[`DecisionCache`]** - Bounded LRU of recent decisions with per-entry TTL
//! * **[`ConnectionGuard`]** - Connection flood protection and permanent blacklist
//! * **[`AccessFilter`]** - Orchestrates the above and owns the active snapshot
//!
//! ### Decision Flow
//!
//! 1. The address is parsed; malformed input is denied
//! 2. The connection guard may refuse a flooding address outright
//! 3. A cached decision is returned if one is still valid
//! 4. Otherwise the country is resolved under a timeout and the rule set decides
//! 5. The decision is cached and a [`DecisionEvent`] is queued
//!
//! Rule precedence is exact address, then the longest matching CIDR, then
//! country, then the default action, which is deny unless configured.
//!
//! ```rust
//! # use access_filter::{AccessFilter, CidrTableProvider, FilterConfig, FilterMode, RuleConfig};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let table = CidrTableProvider::parse("198.51.100.0/24,VN\n", "inline")?;
//! let filter = AccessFilter::new(FilterConfig::default())?.with_provider(Box::new(table));
//!
//! filter.reload_config(&RuleConfig {
//!     mode: Some(FilterMode::Whitelist),
//!     countries: vec!["VN".to_string()],
//!     ..Default::default()
//! })?;
//!
//! assert!(filter.evaluate("198.51.100.7").await?.is_allowed());
//! assert!(!filter.evaluate("192.0.2.7").await?.is_allowed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Decision-path failures never surface as `Err`: a malformed address or a
//! stalled lookup produces a `Deny` verdict carrying the [`FilterError`].
//! Only lifecycle misuse (`NotReady`, `Shutdown`), rejected configuration and
//! unreadable databases are returned as errors, and the last two leave the
//! previous rules or database in place.
//!
//! ## Thread Safety
//!
//! All components are `Send + Sync`. The rule set and provider are swapped
//! through `arc-swap`, so readers never block on a reload.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod geo;
pub mod guard;
pub mod rules;
pub mod types;

pub use cache::{CacheStats, DecisionCache};
pub use config::FilterConfig;
pub use error::FilterError;
pub use events::{DecisionEvent, DecisionReason, EventSink};
pub use filter::{AccessFilter, FilterState, FilterStats, Verdict};
pub use geo::{open_database, CidrTableProvider, GeoLookupProvider, MaxMindProvider, UnavailableProvider};
pub use guard::{ConnectionGuard, GuardBlock, GuardConfig, GuardStats};
pub use rules::{FilterMode, RawRule, RawRuleKind, Rule, RuleConfig, RuleConflict, RuleSet};
pub use types::{Action, ClientIp, CountryCode, Decision, DEFAULT_DECISION_TTL};
