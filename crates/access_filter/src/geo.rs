//! Geolocation providers: IP address to country code.
//!
//! Providers are read-only and never touch the network. Every failure mode
//! (address not in the database, a damaged record, no database at all)
//! resolves to [`CountryCode::Unknown`] instead of an error.

use crate::error::FilterError;
use crate::types::CountryCode;
use ipnet::IpNet;
use maxminddb::{geoip2, Reader};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info};

/// Resolves client addresses to countries.
pub trait GeoLookupProvider: Send + Sync {
    /// Country of `ip`, or `Unknown` when it cannot be placed.
    fn resolve(&self, ip: IpAddr) -> CountryCode;

    /// Human-readable description of the backing data, for status output.
    fn describe(&self) -> String;
}

/// Placeholder provider used before a database is loaded and after shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableProvider;

impl GeoLookupProvider for UnavailableProvider {
    fn resolve(&self, _ip: IpAddr) -> CountryCode {
        CountryCode::Unknown
    }

    fn describe(&self) -> String {
        "no geolocation database loaded".to_string()
    }
}

/// MaxMind GeoIP2 / GeoLite2 country database held in memory.
pub struct MaxMindProvider {
    reader: Reader<Vec<u8>>,
    source: String,
}

impl MaxMindProvider {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let reader = Reader::open_readfile(path).map_err(|e| database_error(path, e))?;
        info!(
            "🌍 Loaded MaxMind database {} ({}, built {})",
            path.display(),
            reader.metadata.database_type,
            reader.metadata.build_epoch
        );
        Ok(Self {
            reader,
            source: path.display().to_string(),
        })
    }

    /// Builds a provider from database bytes already in memory.
    pub fn from_bytes(bytes: Vec<u8>, source: impl Into<String>) -> Result<Self, FilterError> {
        let source = source.into();
        let reader = Reader::from_source(bytes).map_err(|e| FilterError::DatabaseLoad {
            path: source.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { reader, source })
    }
}

impl GeoLookupProvider for MaxMindProvider {
    fn resolve(&self, ip: IpAddr) -> CountryCode {
        match self.reader.lookup::<geoip2::Country>(ip) {
            Ok(record) => CountryCode::from_iso(record.country.and_then(|c| c.iso_code)),
            Err(e) => {
                debug!("GeoIP lookup miss for {}: {}", ip, e);
                CountryCode::Unknown
            }
        }
    }

    fn describe(&self) -> String {
        format!(
            "maxmind {} ({} v{}.{})",
            self.source,
            self.reader.metadata.database_type,
            self.reader.metadata.binary_format_major_version,
            self.reader.metadata.binary_format_minor_version
        )
    }
}

/// In-memory `network,country` table with longest-prefix lookup.
///
/// Networks are bucketed by prefix length so a lookup costs one hash probe
/// per distinct prefix length rather than a scan of the whole table.
#[derive(Debug, Default)]
pub struct CidrTableProvider {
    v4: Vec<(u8, HashMap<IpNet, CountryCode>)>,
    v6: Vec<(u8, HashMap<IpNet, CountryCode>)>,
    entries: usize,
    source: String,
}

impl CidrTableProvider {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| database_error(path, e))?;
        let table = Self::parse(&text, path.display().to_string())?;
        info!("🌍 Loaded CIDR table {} ({} networks)", path.display(), table.entries);
        Ok(table)
    }

    /// Parses `network,country` lines. Blank lines, `#` comments and a
    /// leading `network,...` header are skipped.
    pub fn parse(text: &str, source: impl Into<String>) -> Result<Self, FilterError> {
        let source = source.into();
        let mut table = Self {
            source: source.clone(),
            ..Default::default()
        };

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("network") {
                continue;
            }

            let corrupt = |what: &str| FilterError::DatabaseLoad {
                path: source.clone(),
                reason: format!("line {}: {what}: {line:?}", number + 1),
            };

            let (network, code) = line.split_once(',').ok_or_else(|| corrupt("expected network,country"))?;
            let network = network
                .trim()
                .parse::<IpNet>()
                .map_err(|_| corrupt("malformed network"))?
                .trunc();
            let code = CountryCode::parse(code.trim())
                .filter(CountryCode::is_known)
                .ok_or_else(|| corrupt("malformed country code"))?;

            table.insert(network, code);
        }

        Ok(table)
    }

    fn insert(&mut self, network: IpNet, code: CountryCode) {
        let buckets = match network {
            IpNet::V4(_) => &mut self.v4,
            IpNet::V6(_) => &mut self.v6,
        };
        let prefix = network.prefix_len();
        let position = match buckets.iter().position(|(len, _)| *len == prefix) {
            Some(position) => position,
            None => {
                buckets.push((prefix, HashMap::new()));
                buckets.sort_by(|a, b| b.0.cmp(&a.0));
                buckets
                    .iter()
                    .position(|(len, _)| *len == prefix)
                    .unwrap_or(0)
            }
        };
        if buckets[position].1.insert(network, code).is_none() {
            self.entries += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

impl GeoLookupProvider for CidrTableProvider {
    fn resolve(&self, ip: IpAddr) -> CountryCode {
        let buckets = match ip {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };
        for (prefix, networks) in buckets {
            let Ok(candidate) = IpNet::new(ip, *prefix) else {
                continue;
            };
            if let Some(code) = networks.get(&candidate.trunc()) {
                return *code;
            }
        }
        CountryCode::Unknown
    }

    fn describe(&self) -> String {
        format!("cidr-table {} ({} networks)", self.source, self.entries)
    }
}

/// Opens a database file, choosing the reader from the file extension:
/// `.csv`/`.txt` are CIDR tables, everything else is read as MaxMind.
pub fn open_database<P: AsRef<Path>>(path: P) -> Result<Box<dyn GeoLookupProvider>, FilterError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(FilterError::DatabaseLoad {
            path: path.display().to_string(),
            reason: "file not found".to_string(),
        });
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("csv") | Some("txt") => Ok(Box::new(CidrTableProvider::open(path)?)),
        _ => Ok(Box::new(MaxMindProvider::open(path)?)),
    }
}

fn database_error(path: &Path, e: impl std::fmt::Display) -> FilterError {
    FilterError::DatabaseLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}
