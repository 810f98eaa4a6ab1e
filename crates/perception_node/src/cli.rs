//! Command-line interface handling for the perception node.
//!
//! Parses the options that override configuration file settings, using the
//! `clap` builder API.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Optional override for the replay input
    pub input: Option<String>,
    /// Optional override for the agent name
    pub agent_name: Option<String>,
}

impl CliArgs {
    fn command() -> Command {
        Command::new("Perception Node")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Replays bus traffic through perception filters and logs deliveries and filter updates")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("perception-node.toml"),
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
                Arg::new("input")
                    .short('i')
                    .long("input")
                    .value_name("FILE")
                    .help("Replay file of newline-delimited JSON records (\"-\" for stdin)"),
            )
            .arg(
                Arg::new("agent-name")
                    .short('a')
                    .long("agent-name")
                    .value_name("NAME")
                    .help("Agent name stamped on outbound filter updates"),
            )
    }

    /// Parses the process arguments. Exits with usage on invalid input.
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
                .unwrap_or_else(|| PathBuf::from("perception-node.toml")),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            input: matches.get_one::<String>("input").cloned(),
            agent_name: matches.get_one::<String>("agent-name").cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::try_parse_from(["perception-node"]).unwrap();
        assert_eq!(args.config_path, PathBuf::from("perception-node.toml"));
        assert_eq!(args.log_level, None);
        assert!(!args.json_logs);
        assert_eq!(args.input, None);
    }

    #[test]
    fn test_overrides() {
        let args = CliArgs::try_parse_from([
            "perception-node",
            "--config",
            "proxy.toml",
            "-l",
            "debug",
            "--json-logs",
            "--input",
            "traffic.ndjson",
            "--agent-name",
            "proxy-2",
        ])
        .unwrap();
        assert_eq!(args.config_path, PathBuf::from("proxy.toml"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        assert_eq!(args.input.as_deref(), Some("traffic.ndjson"));
        assert_eq!(args.agent_name.as_deref(), Some("proxy-2"));
    }
}
