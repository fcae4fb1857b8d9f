//! Core value types shared by every component of the filter.

use crate::error::FilterError;
use crate::rules::Rule;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Time-to-live applied to a decision when nothing else is configured.
pub const DEFAULT_DECISION_TTL: Duration = Duration::from_secs(300);

/// Current wall-clock time as milliseconds since the unix epoch.
pub fn current_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A parsed client address.
///
/// Keeps the normalized binary form used for matching next to the text the
/// host handed us, so log lines can show exactly what arrived. IPv4-mapped
/// IPv6 addresses (`::ffff:a.b.c.d`) are folded to plain IPv4 so that IPv4
/// rules apply to dual-stack listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIp {
    addr: IpAddr,
    original: String,
}

impl ClientIp {
    /// Parses a bare address, a bracketed IPv6 address or a socket address.
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        let trimmed = raw.trim();
        let addr = parse_address(trimmed).ok_or_else(|| FilterError::InvalidInput(raw.to_string()))?;

        Ok(Self {
            addr: addr.to_canonical(),
            original: trimmed.to_string(),
        })
    }

    /// Wraps an address the host already parsed.
    pub fn from_addr(addr: IpAddr) -> Self {
        Self {
            addr: addr.to_canonical(),
            original: addr.to_string(),
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The text this address was parsed from.
    pub fn original(&self) -> &str {
        &self.original
    }
}

impl fmt::Display for ClientIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

fn parse_address(text: &str) -> Option<IpAddr> {
    if let Ok(addr) = text.parse::<IpAddr>() {
        return Some(addr);
    }
    if let Ok(socket) = text.parse::<SocketAddr>() {
        return Some(socket.ip());
    }
    text.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|inner| inner.parse::<IpAddr>().ok())
}

/// ISO 3166-1 alpha-2 country code, or the `UNKNOWN` sentinel.
///
/// `Unknown` is an ordinary, rule-matchable value: the geolocation layer
/// returns it whenever it cannot place an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountryCode {
    Iso([u8; 2]),
    Unknown,
}

impl CountryCode {
    pub const UNKNOWN_LABEL: &'static str = "UNKNOWN";

    /// Strict parse used for configuration: two ASCII letters (any case) or
    /// the literal `UNKNOWN`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(Self::UNKNOWN_LABEL) {
            return Some(CountryCode::Unknown);
        }
        match text.as_bytes() {
            [a, b] if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() => {
                Some(CountryCode::Iso([a.to_ascii_uppercase(), b.to_ascii_uppercase()]))
            }
            _ => None,
        }
    }

    /// Lenient conversion used on database output: anything malformed
    /// becomes `Unknown`.
    pub fn from_iso(code: Option<&str>) -> Self {
        match code.and_then(Self::parse) {
            Some(CountryCode::Iso(bytes)) => CountryCode::Iso(bytes),
            _ => CountryCode::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CountryCode::Iso(bytes) => std::str::from_utf8(bytes).unwrap_or(Self::UNKNOWN_LABEL),
            CountryCode::Unknown => Self::UNKNOWN_LABEL,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, CountryCode::Iso(_))
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CountryCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CountryCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        CountryCode::parse(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid country code: {text:?}")))
    }
}

/// Outcome of evaluating a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    pub fn is_allow(&self) -> bool {
        matches!(self, Action::Allow)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => f.write_str("ALLOW"),
            Action::Deny => f.write_str("DENY"),
        }
    }
}

/// A rule-set decision for one address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub ip: IpAddr,
    pub action: Action,
    /// The rule that produced the action; `None` means the default action
    pub matched_rule: Option<Rule>,
    pub country: CountryCode,
    /// Unix milliseconds at which the decision was made
    pub timestamp: u64,
    pub ttl: Duration,
    /// Version of the rule set snapshot that made the decision
    pub rule_version: u64,
}

impl Decision {
    pub fn new(
        ip: IpAddr,
        action: Action,
        matched_rule: Option<Rule>,
        country: CountryCode,
        rule_version: u64,
    ) -> Self {
        Self {
            ip,
            action,
            matched_rule,
            country,
            timestamp: current_timestamp_millis(),
            ttl: DEFAULT_DECISION_TTL,
            rule_version,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_parse_plain_addresses() {
        let v4 = ClientIp::parse("1.2.3.4").unwrap();
        assert_eq!(v4.addr(), IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(v4.original(), "1.2.3.4");

        let v6 = ClientIp::parse("2001:db8::1").unwrap();
        assert_eq!(v6.addr(), "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_socket_and_bracketed_forms() {
        assert_eq!(ClientIp::parse(" 10.0.0.7:25565 ").unwrap().addr(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(ClientIp::parse("[::1]:19132").unwrap().addr(), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(ClientIp::parse("[::1]").unwrap().addr(), IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn test_mapped_ipv6_is_folded_to_ipv4() {
        let ip = ClientIp::parse("::ffff:192.168.1.9").unwrap();
        assert_eq!(ip.addr(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)));
        assert_eq!(ip.original(), "::ffff:192.168.1.9");
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        for bad in ["999.999.1.1", "", "not-an-ip", "1.2.3", "1.2.3.4.5", "[1.2.3.4"] {
            let err = ClientIp::parse(bad).unwrap_err();
            assert!(matches!(err, FilterError::InvalidInput(_)), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_country_code_parsing() {
        assert_eq!(CountryCode::parse("us").unwrap().as_str(), "US");
        assert_eq!(CountryCode::parse("unknown"), Some(CountryCode::Unknown));
        assert!(CountryCode::parse("USA").is_none());
        assert!(CountryCode::parse("1A").is_none());
        assert!(CountryCode::parse("").is_none());
    }

    #[test]
    fn test_country_code_from_database_is_lenient() {
        assert_eq!(CountryCode::from_iso(Some("vn")).as_str(), "VN");
        assert_eq!(CountryCode::from_iso(Some("??")), CountryCode::Unknown);
        assert_eq!(CountryCode::from_iso(Some("UNKNOWN")), CountryCode::Unknown);
        assert_eq!(CountryCode::from_iso(None), CountryCode::Unknown);
    }

    #[test]
    fn test_country_code_serde() {
        let json = serde_json::to_string(&CountryCode::parse("de").unwrap()).unwrap();
        assert_eq!(json, "\"DE\"");
        let back: CountryCode = serde_json::from_str("\"fr\"").unwrap();
        assert_eq!(back.as_str(), "FR");
        assert!(serde_json::from_str::<CountryCode>("\"france\"").is_err());
    }

    #[test]
    fn test_action_display() {
        assert_eq!(Action::Allow.to_string(), "ALLOW");
        assert_eq!(Action::Deny.to_string(), "DENY");
        assert!(Action::Allow.is_allow());
        assert!(!Action::Deny.is_allow());
    }
}
