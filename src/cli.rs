use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line interface for the DVM scanner
#[derive(Parser, Debug, Clone)]
#[clap(
    name = "dvmscan",
    about = "Discovers NIP-90 Data Vending Machine vendors on Nostr relays and records them",
    version
)]
pub struct Cli {
    /// Relay URLs to query (repeatable). Defaults to a list of popular public relays
    #[clap(long = "relay", env("DVMSCAN_RELAYS"), value_delimiter = ',')]
    pub relays: Vec<String>,

    /// JSON file holding the vendor registry between scans
    #[clap(long, env("DVMSCAN_DATA_FILE"), default_value = "dvm_vendors.json")]
    pub data_file: PathBuf,

    /// Append-only master log file
    #[clap(long, env("DVMSCAN_LOG_FILE"), default_value = "dvm_scan_master.log")]
    pub log_file: PathBuf,

    /// Timeout for each relay query in seconds
    #[clap(long, default_value = "10")]
    pub query_timeout: u64,

    /// Timeout for establishing a relay connection in seconds
    #[clap(long, default_value = "2")]
    pub connect_timeout: u64,

    /// Maximum number of announcement events requested
    #[clap(long, default_value = "1000")]
    pub announcement_limit: usize,

    /// Maximum number of events requested per job kind
    #[clap(long, default_value = "100")]
    pub kind_limit: usize,

    /// Number of consecutive job kinds scanned, starting at 5000 (requests) and 6000 (results)
    #[clap(long, default_value = "10")]
    pub kind_window: u16,
}

impl Cli {
    /// Get the query timeout as a Duration
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    /// Get the connect timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}
