//! Command-line interface handling for the Conduit server.
//!
//! Every option here overrides the matching value from the configuration
//! file.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for bind address
    pub bind_address: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Optional override for the number of output partitions
    pub output_workers: Option<usize>,
}

impl CliArgs {
    /// Parses the process arguments.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    fn from_matches(matches: &clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            output_workers: matches.get_one::<usize>("output-workers").copied(),
        }
    }
}

fn command() -> Command {
    Command::new("Conduit Server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Ordered message dispatch for long-lived WebSocket connections")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address (e.g., 127.0.0.1:8080)"),
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
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("output-workers")
                .short('w')
                .long("output-workers")
                .value_name("COUNT")
                .help("Number of output partitions")
                .value_parser(clap::value_parser!(usize)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let matches = command().try_get_matches_from(["conduit"]).unwrap();
        let args = CliArgs::from_matches(&matches);

        assert_eq!(args.config_path, PathBuf::from("config.toml"));
        assert_eq!(args.bind_address, None);
        assert_eq!(args.log_level, None);
        assert!(!args.json_logs);
        assert_eq!(args.output_workers, None);
    }

    #[test]
    fn test_overrides() {
        let matches = command()
            .try_get_matches_from([
                "conduit",
                "-c",
                "lobby.toml",
                "--bind",
                "0.0.0.0:9000",
                "-l",
                "debug",
                "--json-logs",
                "--output-workers",
                "3",
            ])
            .unwrap();
        let args = CliArgs::from_matches(&matches);

        assert_eq!(args.config_path, PathBuf::from("lobby.toml"));
        assert_eq!(args.bind_address.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        assert_eq!(args.output_workers, Some(3));
    }

    #[test]
    fn test_rejects_non_numeric_worker_count() {
        let result = command().try_get_matches_from(["conduit", "--output-workers", "many"]);
        assert!(result.is_err());
    }
}
