//! Rule documents and the immutable rule set built from them.
//!
//! A [`RuleSet`] is never mutated after [`RuleSet::build`] returns. Reloads
//! build a fresh set and swap it in whole, so evaluators always see one
//! consistent snapshot.

use crate::error::FilterError;
use crate::types::{Action, ClientIp, CountryCode, Decision};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Networks admitted by `allow_local`: loopback, RFC 1918, link-local and
/// IPv6 unique-local space.
const LOCAL_NETWORKS: &[&str] = &[
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Country list shorthand carried over from plugin-style configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Only the listed countries may connect
    Whitelist,
    /// The listed countries are refused, everyone else may connect
    Blacklist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawRuleKind {
    Ip,
    Cidr,
    Country,
}

/// One rule as written in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRule {
    pub kind: RawRuleKind,
    pub value: String,
    pub action: Action,
}

impl RawRule {
    pub fn new(kind: RawRuleKind, value: impl Into<String>, action: Action) -> Self {
        Self {
            kind,
            value: value.into(),
            action,
        }
    }
}

/// The reloadable rule document.
///
/// Explicit `rules` are declared first, then the shorthands in field order,
/// so an explicit rule always wins a first-declared conflict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Action when nothing matches; unset means deny
    pub default_action: Option<Action>,
    /// How `countries` is interpreted
    pub mode: Option<FilterMode>,
    /// ISO country codes for `mode`
    pub countries: Vec<String>,
    /// Addresses that are always allowed
    pub whitelisted_ips: Vec<String>,
    /// Allow loopback, private and link-local addresses
    pub allow_local: bool,
    /// Allow addresses the database cannot place
    pub allow_unknown_country: bool,
    /// Explicit rules
    pub rules: Vec<RawRule>,
}

/// A compiled rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    ExactIp { ip: IpAddr, action: Action },
    Cidr { network: IpNet, action: Action },
    Country { code: CountryCode, action: Action },
}

impl Rule {
    pub fn action(&self) -> Action {
        match self {
            Rule::ExactIp { action, .. } | Rule::Cidr { action, .. } | Rule::Country { action, .. } => *action,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::ExactIp { ip, action } => write!(f, "ip {ip} -> {action}"),
            Rule::Cidr { network, action } => write!(f, "cidr {network} -> {action}"),
            Rule::Country { code, action } => write!(f, "country {code} -> {action}"),
        }
    }
}

/// A rule that was dropped because an earlier rule already claimed the same
/// key with a different action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleConflict {
    pub discarded: Rule,
    pub kept: Action,
}

impl fmt::Display for RuleConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ignored, an earlier rule already decides {}", self.discarded, self.kept)
    }
}

/// Immutable, versioned collection of access rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    version: u64,
    exact: HashMap<IpAddr, Action>,
    /// Sorted longest prefix first
    cidrs: Vec<(IpNet, Action)>,
    countries: HashMap<CountryCode, Action>,
    default_action: Action,
    /// Networks admitted by `allow_local`, also exempt from the guard
    local_networks: Vec<IpNet>,
    conflicts: Vec<RuleConflict>,
}

impl RuleSet {
    /// A rule set with no rules at all: everything falls to `default_action`.
    pub fn empty(version: u64, default_action: Option<Action>) -> Self {
        Self {
            version,
            exact: HashMap::new(),
            cidrs: Vec::new(),
            countries: HashMap::new(),
            default_action: default_action.unwrap_or(Action::Deny),
            local_networks: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    /// Compiles a rule document.
    ///
    /// Fails on a malformed address, network or country code. Conflicting
    /// duplicates are not fatal; see [`RuleSet::conflicts`].
    pub fn build(config: &RuleConfig, version: u64) -> Result<Self, FilterError> {
        let default_action = config.default_action.unwrap_or(match config.mode {
            Some(FilterMode::Blacklist) => Action::Allow,
            _ => Action::Deny,
        });
        let mut set = Self::empty(version, Some(default_action));

        for (index, raw) in config.rules.iter().enumerate() {
            let rule = compile_rule(raw)
                .map_err(|reason| FilterError::Config(format!("rule #{}: {reason}", index + 1)))?;
            set.insert(rule);
        }

        for text in &config.whitelisted_ips {
            let ip = ClientIp::parse(text)
                .map_err(|_| FilterError::Config(format!("whitelisted_ips: invalid address {text:?}")))?;
            set.insert(Rule::ExactIp { ip: ip.addr(), action: Action::Allow });
        }

        if config.allow_local {
            for text in LOCAL_NETWORKS {
                let network = text
                    .parse::<IpNet>()
                    .map_err(|e| FilterError::Config(format!("local network {text}: {e}")))?;
                set.insert(Rule::Cidr { network, action: Action::Allow });
                set.local_networks.push(network);
            }
        }

        match config.mode {
            Some(mode) => {
                let action = match mode {
                    FilterMode::Whitelist => Action::Allow,
                    FilterMode::Blacklist => Action::Deny,
                };
                for text in &config.countries {
                    let code = CountryCode::parse(text)
                        .ok_or_else(|| FilterError::Config(format!("countries: invalid country code {text:?}")))?;
                    set.insert(Rule::Country { code, action });
                }
            }
            None if !config.countries.is_empty() => {
                return Err(FilterError::Config(
                    "countries are listed but no mode (whitelist or blacklist) is set".to_string(),
                ));
            }
            None => {}
        }

        if config.allow_unknown_country {
            set.insert(Rule::Country { code: CountryCode::Unknown, action: Action::Allow });
        }

        // Stable sort keeps declaration order among equal prefixes; equal
        // prefixes of different networks are disjoint anyway.
        set.cidrs.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Ok(set)
    }

    fn insert(&mut self, rule: Rule) {
        let existing = match rule {
            Rule::ExactIp { ip, action } => *self.exact.entry(ip).or_insert(action),
            Rule::Country { code, action } => *self.countries.entry(code).or_insert(action),
            Rule::Cidr { network, action } => match self.cidrs.iter().find(|(n, _)| *n == network) {
                Some((_, kept)) => *kept,
                None => {
                    self.cidrs.push((network, action));
                    action
                }
            },
        };

        if existing != rule.action() {
            self.conflicts.push(RuleConflict { discarded: rule, kept: existing });
        }
    }

    /// Decides the action for an address, most specific rule first.
    pub fn decide(&self, ip: IpAddr, country: CountryCode) -> Decision {
        let (action, rule) = self.match_rule(ip, country);
        Decision::new(ip, action, rule, country, self.version)
    }

    fn match_rule(&self, ip: IpAddr, country: CountryCode) -> (Action, Option<Rule>) {
        if let Some(&action) = self.exact.get(&ip) {
            return (action, Some(Rule::ExactIp { ip, action }));
        }

        if let Some(&(network, action)) = self.cidrs.iter().find(|(network, _)| network.contains(&ip)) {
            return (action, Some(Rule::Cidr { network, action }));
        }

        if let Some(&action) = self.countries.get(&country) {
            return (action, Some(Rule::Country { code: country, action }));
        }

        (self.default_action, None)
    }

    /// Whether the address skips flood protection: an exact-address allow
    /// rule covers it, or it is local and `allow_local` is set.
    pub fn is_exempt(&self, ip: IpAddr) -> bool {
        matches!(self.exact.get(&ip), Some(Action::Allow))
            || self.local_networks.iter().any(|network| network.contains(&ip))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn default_action(&self) -> Action {
        self.default_action
    }

    pub fn conflicts(&self) -> &[RuleConflict] {
        &self.conflicts
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.cidrs.len() + self.countries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "v{}: {} exact, {} cidr, {} country rules, default {}",
            self.version,
            self.exact.len(),
            self.cidrs.len(),
            self.countries.len(),
            self.default_action
        )
    }
}

fn compile_rule(raw: &RawRule) -> Result<Rule, String> {
    let action = raw.action;
    match raw.kind {
        RawRuleKind::Ip => ClientIp::parse(&raw.value)
            .map(|ip| Rule::ExactIp { ip: ip.addr(), action })
            .map_err(|_| format!("invalid IP address {:?}", raw.value)),
        RawRuleKind::Cidr => raw
            .value
            .trim()
            .parse::<IpNet>()
            .map(|network| Rule::Cidr { network: network.trunc(), action })
            .map_err(|_| format!("malformed CIDR {:?}", raw.value)),
        RawRuleKind::Country => CountryCode::parse(&raw.value)
            .map(|code| Rule::Country { code, action })
            .ok_or_else(|| format!("invalid country code {:?}", raw.value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    fn country(code: &str) -> CountryCode {
        CountryCode::parse(code).unwrap()
    }

    fn config_with(rules: Vec<RawRule>) -> RuleConfig {
        RuleConfig {
            rules,
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_ip_beats_country() {
        let set = RuleSet::build(
            &config_with(vec![
                RawRule::new(RawRuleKind::Ip, "1.2.3.4", Action::Allow),
                RawRule::new(RawRuleKind::Country, "US", Action::Deny),
            ]),
            1,
        )
        .unwrap();

        let decision = set.decide(ip("1.2.3.4"), country("US"));
        assert_eq!(decision.action, Action::Allow);
        assert_eq!(decision.matched_rule, Some(Rule::ExactIp { ip: ip("1.2.3.4"), action: Action::Allow }));

        assert_eq!(set.decide(ip("1.2.3.5"), country("US")).action, Action::Deny);
    }

    #[test]
    fn test_cidr_longest_prefix_wins() {
        let set = RuleSet::build(
            &config_with(vec![
                RawRule::new(RawRuleKind::Cidr, "10.0.0.0/8", Action::Deny),
                RawRule::new(RawRuleKind::Cidr, "10.1.0.0/16", Action::Allow),
            ]),
            1,
        )
        .unwrap();

        assert_eq!(set.decide(ip("10.1.2.3"), CountryCode::Unknown).action, Action::Allow);
        assert_eq!(set.decide(ip("10.2.0.1"), CountryCode::Unknown).action, Action::Deny);
    }

    #[test]
    fn test_cidr_beats_country() {
        let set = RuleSet::build(
            &config_with(vec![
                RawRule::new(RawRuleKind::Country, "DE", Action::Deny),
                RawRule::new(RawRuleKind::Cidr, "2001:db8::/32", Action::Allow),
            ]),
            1,
        )
        .unwrap();

        assert_eq!(set.decide(ip("2001:db8::42"), country("DE")).action, Action::Allow);
        assert_eq!(set.decide(ip("2001:db9::42"), country("DE")).action, Action::Deny);
    }

    #[test]
    fn test_empty_rule_set_denies() {
        let set = RuleSet::build(&RuleConfig::default(), 1).unwrap();
        assert!(set.is_empty());
        let decision = set.decide(ip("8.8.8.8"), country("US"));
        assert_eq!(decision.action, Action::Deny);
        assert!(decision.matched_rule.is_none());
    }

    #[test]
    fn test_unknown_country_is_matchable() {
        let set = RuleSet::build(
            &RuleConfig {
                allow_unknown_country: true,
                ..Default::default()
            },
            1,
        )
        .unwrap();
        assert_eq!(set.decide(ip("203.0.113.1"), CountryCode::Unknown).action, Action::Allow);
        assert_eq!(set.decide(ip("203.0.113.1"), country("FR")).action, Action::Deny);
    }

    #[test]
    fn test_whitelist_mode() {
        let set = RuleSet::build(
            &RuleConfig {
                mode: Some(FilterMode::Whitelist),
                countries: vec!["vn".to_string(), "SG".to_string()],
                ..Default::default()
            },
            3,
        )
        .unwrap();

        assert_eq!(set.default_action(), Action::Deny);
        assert_eq!(set.decide(ip("1.1.1.1"), country("VN")).action, Action::Allow);
        assert_eq!(set.decide(ip("1.1.1.1"), country("US")).action, Action::Deny);
        assert_eq!(set.decide(ip("1.1.1.1"), country("SG")).rule_version, 3);
    }

    #[test]
    fn test_blacklist_mode_defaults_to_allow() {
        let set = RuleSet::build(
            &RuleConfig {
                mode: Some(FilterMode::Blacklist),
                countries: vec!["CN".to_string()],
                ..Default::default()
            },
            1,
        )
        .unwrap();

        assert_eq!(set.default_action(), Action::Allow);
        assert_eq!(set.decide(ip("1.1.1.1"), country("CN")).action, Action::Deny);
        assert_eq!(set.decide(ip("1.1.1.1"), country("JP")).action, Action::Allow);
    }

    #[test]
    fn test_explicit_default_overrides_mode() {
        let set = RuleSet::build(
            &RuleConfig {
                default_action: Some(Action::Deny),
                mode: Some(FilterMode::Blacklist),
                countries: vec!["CN".to_string()],
                ..Default::default()
            },
            1,
        )
        .unwrap();
        assert_eq!(set.default_action(), Action::Deny);
    }

    #[test]
    fn test_allow_local_networks() {
        let set = RuleSet::build(
            &RuleConfig {
                allow_local: true,
                ..Default::default()
            },
            1,
        )
        .unwrap();

        for local in ["127.0.0.1", "10.20.30.40", "172.16.5.4", "192.168.1.1", "::1", "fd00::1"] {
            assert_eq!(set.decide(ip(local), CountryCode::Unknown).action, Action::Allow, "{local}");
        }
        // 172.32.x.x lies outside 172.16.0.0/12
        assert_eq!(set.decide(ip("172.32.0.1"), CountryCode::Unknown).action, Action::Deny);

        assert!(set.is_exempt(ip("192.168.1.1")));
        assert!(set.is_exempt(ip("fe80::1")));
        assert!(!set.is_exempt(ip("172.32.0.1")));
    }

    #[test]
    fn test_local_networks_not_exempt_without_allow_local() {
        let set = RuleSet::build(&RuleConfig::default(), 1).unwrap();
        assert!(!set.is_exempt(ip("127.0.0.1")));
    }

    #[test]
    fn test_whitelisted_ips_are_exempt() {
        let set = RuleSet::build(
            &RuleConfig {
                whitelisted_ips: vec!["198.51.100.7".to_string()],
                ..Default::default()
            },
            1,
        )
        .unwrap();
        assert!(set.is_exempt(ip("198.51.100.7")));
        assert!(!set.is_exempt(ip("198.51.100.8")));
    }

    #[test]
    fn test_conflicting_duplicates_keep_first() {
        let set = RuleSet::build(
            &RuleConfig {
                whitelisted_ips: vec!["5.5.5.5".to_string()],
                rules: vec![
                    RawRule::new(RawRuleKind::Ip, "5.5.5.5", Action::Deny),
                    RawRule::new(RawRuleKind::Ip, "6.6.6.6", Action::Allow),
                    RawRule::new(RawRuleKind::Ip, "6.6.6.6", Action::Allow),
                    RawRule::new(RawRuleKind::Cidr, "10.0.0.0/8", Action::Deny),
                    RawRule::new(RawRuleKind::Cidr, "10.0.0.0/8", Action::Allow),
                ],
                ..Default::default()
            },
            1,
        )
        .unwrap();

        // Explicit rules are declared before the whitelist shorthand
        assert_eq!(set.decide(ip("5.5.5.5"), CountryCode::Unknown).action, Action::Deny);
        assert_eq!(set.decide(ip("10.9.9.9"), CountryCode::Unknown).action, Action::Deny);

        // Same-action duplicates are not conflicts
        assert_eq!(set.conflicts().len(), 2);
        assert_eq!(set.conflicts()[0].kept, Action::Deny);
        assert!(set.conflicts()[0].to_string().contains("5.5.5.5"));
    }

    #[test]
    fn test_cidr_host_bits_are_truncated() {
        let set = RuleSet::build(
            &config_with(vec![RawRule::new(RawRuleKind::Cidr, "192.0.2.77/24", Action::Allow)]),
            1,
        )
        .unwrap();
        let decision = set.decide(ip("192.0.2.1"), CountryCode::Unknown);
        assert_eq!(
            decision.matched_rule,
            Some(Rule::Cidr { network: "192.0.2.0/24".parse().unwrap(), action: Action::Allow })
        );
    }

    #[test]
    fn test_build_rejects_malformed_rules() {
        let bad_rules = [
            RawRule::new(RawRuleKind::Cidr, "10.0.0.0/33", Action::Deny),
            RawRule::new(RawRuleKind::Cidr, "banana", Action::Deny),
            RawRule::new(RawRuleKind::Ip, "999.999.1.1", Action::Allow),
            RawRule::new(RawRuleKind::Country, "USA", Action::Deny),
        ];
        for raw in bad_rules {
            let err = RuleSet::build(&config_with(vec![raw.clone()]), 1).unwrap_err();
            assert!(matches!(err, FilterError::Config(_)), "{raw:?} should fail");
        }
    }

    #[test]
    fn test_countries_without_mode_is_rejected() {
        let config = RuleConfig {
            countries: vec!["US".to_string()],
            ..Default::default()
        };
        assert!(matches!(RuleSet::build(&config, 1), Err(FilterError::Config(_))));
    }

    #[test]
    fn test_rule_config_from_toml() {
        let text = r#"
default_action = "allow"
mode = "blacklist"
countries = ["RU"]
allow_local = true

[[rules]]
kind = "cidr"
value = "203.0.113.0/24"
action = "deny"

[[rules]]
kind = "ip"
value = "203.0.113.9"
action = "allow"
"#;
        let config: RuleConfig = toml::from_str(text).unwrap();
        assert_eq!(config.default_action, Some(Action::Allow));
        assert_eq!(config.mode, Some(FilterMode::Blacklist));
        assert_eq!(config.rules.len(), 2);

        let set = RuleSet::build(&config, 1).unwrap();
        assert_eq!(set.decide(ip("203.0.113.9"), CountryCode::Unknown).action, Action::Allow);
        assert_eq!(set.decide(ip("203.0.113.10"), CountryCode::Unknown).action, Action::Deny);
        assert_eq!(set.decide(ip("8.8.4.4"), country("RU")).action, Action::Deny);
        assert_eq!(set.decide(ip("8.8.4.4"), country("US")).action, Action::Allow);
    }
}
