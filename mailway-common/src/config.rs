//! Process configuration: a TOML file created with defaults when absent.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// The original retry ladder: 15m, 30m, 1h, 2h, 4h, 8h, 16h.
pub const DEFAULT_RETRIES: [u64; 7] = [900, 1800, 3600, 7200, 14400, 28800, 57600];

/// Floor for the envelope re-lock window, in seconds.
pub const MIN_RELOCK_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot encode default configuration: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Runtime settings for the whole daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to listen on.
    pub bind: String,
    /// SMTP port.
    pub port: u16,
    /// Maximum concurrent inbound sessions; connections beyond this are
    /// rejected with a transient 421.
    pub max_sessions: usize,
    /// Maximum concurrent outbound deliveries (worker pool size).
    pub max_deliveries: usize,
    /// Debug-level logging by default.
    pub verbose: bool,
    /// Root of the spool tree (`inbound/` staging, `outbound/` queue).
    pub spool: PathBuf,
    /// When set, terminal queue files are moved here instead of deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
    /// Relay control table: domain -> entry name -> expansion list.
    pub routing: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    /// Static smart-host list; when non-empty, MX resolution is skipped.
    pub gateways: Vec<String>,
    /// Backoff schedule in seconds, indexed by attempt count.
    pub retries: Vec<u64>,
    /// Minimum window an envelope stays claimed after being loaded.
    pub relock_secs: u64,
    /// Seconds between outbound queue scans.
    pub scan_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let mut routing = BTreeMap::new();
        let mut example = BTreeMap::new();
        example.insert("@".to_string(), vec!["postmaster".to_string()]);
        example.insert(
            "postmaster".to_string(),
            vec!["admin@example.com".to_string()],
        );
        routing.insert("example.com".to_string(), example);

        Self {
            bind: "127.0.0.1".to_string(),
            port: 25,
            max_sessions: 1,
            max_deliveries: 4,
            verbose: false,
            spool: PathBuf::from("/var/spool/mail"),
            archive: None,
            routing,
            gateways: Vec::new(),
            retries: DEFAULT_RETRIES.to_vec(),
            relock_secs: MIN_RELOCK_SECS,
            scan_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load the configuration, creating the file with defaults when it
    /// does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or
    /// parsed, or when the default file cannot be written.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                fs::write(path, toml::to_string_pretty(&config)?)?;
                warn!("Created default configuration at {}", path.display());
                config
            }
            Err(err) => return Err(err.into()),
        };
        config.sanitize();
        Ok(config)
    }

    /// Clamp degenerate values the way the daemon has always done:
    /// at least one session, a re-lock floor of one hour, and a sane
    /// retry ladder.
    pub fn sanitize(&mut self) {
        if self.max_sessions == 0 {
            self.max_sessions = 1;
        }
        if self.max_deliveries == 0 {
            self.max_deliveries = 1;
        }
        if self.relock_secs < MIN_RELOCK_SECS {
            self.relock_secs = MIN_RELOCK_SECS;
        }
        if self.retries.is_empty()
            || self
                .retries
                .iter()
                .try_fold(0u64, |sum, delay| sum.checked_add(*delay))
                .is_none()
        {
            self.retries = DEFAULT_RETRIES.to_vec();
        }
    }

    /// The socket address string to bind.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// The global expiration horizon: twice the full retry ladder,
    /// never less than one hour.
    #[must_use]
    pub fn expiration(&self) -> Duration {
        let total: u64 = self.retries.iter().sum();
        Duration::from_secs((total * 2).max(3600))
    }

    #[must_use]
    pub fn relock(&self) -> Duration {
        Duration::from_secs(self.relock_secs)
    }
}
