//! Command-line interface handling for the GeoGate access gate.
//!
//! This module provides command-line argument parsing using the `clap`
//! builder API. Every option except `--check` overrides a setting from the
//! configuration file.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the listen address
    pub bind_address: Option<String>,
    /// Optional override for the game server address connections are relayed to
    pub upstream_address: Option<String>,
    /// Optional override for the geolocation database path
    pub database_path: Option<PathBuf>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// One-shot mode: evaluate this address, print the verdict and exit
    pub check: Option<String>,
}

impl CliArgs {
    fn command() -> Command {
        Command::new("GeoGate")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Geolocation access gate for game servers")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("geogate.toml"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("Listen address (e.g., 0.0.0.0:7777)"),
            )
            .arg(
                Arg::new("upstream")
                    .short('u')
                    .long("upstream")
                    .value_name("ADDRESS")
                    .help("Game server address allowed connections are relayed to"),
            )
            .arg(
                Arg::new("database")
                    .short('d')
                    .long("database")
                    .value_name("FILE")
                    .help("Geolocation database (.mmdb, or .csv network,country table)"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .arg(
                Arg::new("check")
                    .long("check")
                    .value_name("IP")
                    .help("Evaluate one address against the configured rules, print the verdict as JSON and exit"),
            )
    }

    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    /// Parses an explicit argument list.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&Self::command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("geogate.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            upstream_address: matches.get_one::<String>("upstream").cloned(),
            database_path: matches.get_one::<String>("database").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            check: matches.get_one::<String>("check").cloned(),
        }
    }
}
