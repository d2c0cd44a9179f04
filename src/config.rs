use crate::cli::Cli;
use crate::error::AppError;
use crate::models::{JOB_REQUEST_KINDS, JOB_RESULT_KINDS};
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_QUERY_TIMEOUT: u64 = 10; // 10 seconds per relay query
const DEFAULT_CONNECT_TIMEOUT: u64 = 2;
const DEFAULT_ANNOUNCEMENT_LIMIT: usize = 1000;
const DEFAULT_KIND_LIMIT: usize = 100;
const DEFAULT_KIND_WINDOW: u16 = 10;

/// Popular public relays scanned when none are configured
pub const DEFAULT_RELAYS: [&str; 10] = [
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
    "wss://nos.lol",
    "wss://relay.snort.social",
    "wss://nostr.wine",
    "wss://relay.primal.net",
    "wss://nostr-pub.wellorder.net",
    "wss://relay.nostr.bg",
    "wss://nostr.mom",
    "wss://relay.current.fyi",
];

/// Settings for a single scan run
#[derive(Debug, Clone)]
pub struct Config {
    /// Relays queried in every phase
    pub relays: Vec<Url>,

    /// Registry snapshot location
    pub data_file: PathBuf,

    /// Master log location
    pub log_file: PathBuf,

    pub query_timeout: Duration,
    pub connect_timeout: Duration,

    /// Result cap for the single announcement query
    pub announcement_limit: usize,

    /// Result cap for each job request/result kind query
    pub kind_limit: usize,

    /// Job result kinds queried, one query per kind
    pub result_kinds: Range<u16>,

    /// Job request kinds queried, one query per kind
    pub request_kinds: Range<u16>,
}

impl Default for Config {
    fn default() -> Self {
        let relays = DEFAULT_RELAYS
            .iter()
            .filter_map(|relay| Url::parse(relay).ok())
            .collect();

        Config {
            relays,
            data_file: PathBuf::from("dvm_vendors.json"),
            log_file: PathBuf::from("dvm_scan_master.log"),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT),
            announcement_limit: DEFAULT_ANNOUNCEMENT_LIMIT,
            kind_limit: DEFAULT_KIND_LIMIT,
            result_kinds: kind_window(&JOB_RESULT_KINDS, DEFAULT_KIND_WINDOW),
            request_kinds: kind_window(&JOB_REQUEST_KINDS, DEFAULT_KIND_WINDOW),
        }
    }
}

impl Config {
    /// Build the run configuration from parsed command-line arguments
    pub fn from_cli(cli: &Cli) -> Result<Self, AppError> {
        let relays = if cli.relays.is_empty() {
            Config::default().relays
        } else {
            parse_relays(&cli.relays)?
        };

        if relays.is_empty() {
            return Err(AppError::ConfigError("No relays configured".to_string()));
        }

        let span = JOB_REQUEST_KINDS.end - JOB_REQUEST_KINDS.start;
        if cli.kind_window == 0 || cli.kind_window > span {
            return Err(AppError::ConfigError(format!(
                "kind window must be between 1 and {}, got {}",
                span, cli.kind_window
            )));
        }

        if cli.query_timeout == 0 {
            return Err(AppError::ConfigError(
                "query timeout must be at least one second".to_string(),
            ));
        }

        tracing::debug!("Configured {} relays", relays.len());

        Ok(Config {
            relays,
            data_file: cli.data_file.clone(),
            log_file: cli.log_file.clone(),
            query_timeout: cli.query_timeout(),
            connect_timeout: cli.connect_timeout(),
            announcement_limit: cli.announcement_limit,
            kind_limit: cli.kind_limit,
            result_kinds: kind_window(&JOB_RESULT_KINDS, cli.kind_window),
            request_kinds: kind_window(&JOB_REQUEST_KINDS, cli.kind_window),
        })
    }
}

/// Parse relay URLs, accepting only websocket schemes
fn parse_relays(raw: &[String]) -> Result<Vec<Url>, AppError> {
    let mut relays = Vec::with_capacity(raw.len());
    for entry in raw.iter().map(|r| r.trim()).filter(|r| !r.is_empty()) {
        let url = Url::parse(entry)?;
        match url.scheme() {
            "ws" | "wss" => {
                if !relays.contains(&url) {
                    relays.push(url);
                }
            }
            other => {
                return Err(AppError::ConfigError(format!(
                    "Relay {} uses unsupported scheme {}",
                    entry, other
                )))
            }
        }
    }
    Ok(relays)
}

/// The first `width` kinds of a protocol kind range
fn kind_window(range: &Range<u16>, width: u16) -> Range<u16> {
    range.start..range.start.saturating_add(width).min(range.end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["dvmscan"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn defaults_match_known_relays_and_files() {
        let config = Config::default();
        assert_eq!(config.relays.len(), DEFAULT_RELAYS.len());
        assert_eq!(config.data_file, PathBuf::from("dvm_vendors.json"));
        assert_eq!(config.log_file, PathBuf::from("dvm_scan_master.log"));
        assert_eq!(config.result_kinds, 6000..6010);
        assert_eq!(config.request_kinds, 5000..5010);
        assert_eq!(config.query_timeout, Duration::from_secs(10));
    }

    #[test]
    fn relay_list_is_parsed_and_deduplicated() {
        let config = Config::from_cli(&cli(&[
            "--relay",
            "wss://relay.example.com,wss://relay.example.com, ws://localhost:7777",
        ]))
        .unwrap();
        assert_eq!(config.relays.len(), 2);
        assert_eq!(config.relays[1].as_str(), "ws://localhost:7777/");
    }

    #[test]
    fn http_relays_are_rejected() {
        let err = Config::from_cli(&cli(&["--relay", "https://relay.example.com"])).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn kind_window_is_bounded_by_protocol_range() {
        let config = Config::from_cli(&cli(&["--kind-window", "1000"])).unwrap();
        assert_eq!(config.result_kinds, 6000..7000);

        let err = Config::from_cli(&cli(&["--kind-window", "1001"])).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
