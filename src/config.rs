//! Runtime configuration: a JSON file with serde defaults plus a couple of
//! environment overrides. Read once at startup.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::envelope::{EnvelopeConfig, DEFAULT_JITTER_SECS};
use crate::messaging::MessagingConfig;
use crate::relay::PoolConfig;

pub const DEFAULT_CONFIG_FILE: &str = "nostr-dm.json";
pub const ENV_RELAYS: &str = "NOSTR_DM_RELAYS";
pub const ENV_DATA_DIR: &str = "NOSTR_DM_DATA_DIR";

const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
];

/// One relay endpoint. In the config file either a bare URL string or an
/// object with the optional metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RelayEntry")]
pub struct RelayConfig {
    pub url: String,
    pub name: String,
    pub read: bool,
    pub write: bool,
    pub nips: Vec<u32>,
    /// Largest filter `limit` the relay honours.
    pub max_limit: Option<usize>,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            name: display_name(&url),
            url,
            read: true,
            write: true,
            nips: Vec::new(),
            max_limit: None,
        }
    }
}

fn display_name(url: &str) -> String {
    url.trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .trim_end_matches('/')
        .to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RelayEntry {
    Url(String),
    Full {
        url: String,
        #[serde(default)]
        name: String,
        #[serde(default = "default_true")]
        read: bool,
        #[serde(default = "default_true")]
        write: bool,
        #[serde(default)]
        nips: Vec<u32>,
        #[serde(default)]
        max_limit: Option<usize>,
    },
}

impl From<RelayEntry> for RelayConfig {
    fn from(entry: RelayEntry) -> Self {
        match entry {
            RelayEntry::Url(url) => RelayConfig::new(url),
            RelayEntry::Full {
                url,
                name,
                read,
                write,
                nips,
                max_limit,
            } => RelayConfig {
                name: if name.trim().is_empty() {
                    display_name(&url)
                } else {
                    name
                },
                url,
                read,
                write,
                nips,
                max_limit,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
    #[serde(default = "default_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_jitter_secs")]
    pub timestamp_jitter_secs: u64,
    #[serde(default = "default_true")]
    pub self_copy: bool,
    #[serde(default = "default_true")]
    pub legacy_context_prefix: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_reconnect_delay_secs() -> u64 {
    3
}

fn default_jitter_secs() -> u64 {
    DEFAULT_JITTER_SECS
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            publish_timeout_secs: default_timeout_secs(),
            query_timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            timestamp_jitter_secs: default_jitter_secs(),
            self_copy: true,
            legacy_context_prefix: true,
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Reads `path` (or `./nostr-dm.json`), applies environment overrides and
    /// validates. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read config {}", path.display()))?;
            Self::from_json(&raw).with_context(|| format!("parse config {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "config file not found; using defaults");
            Self::default()
        };
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.finalize()?;
        Ok(cfg)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(list) = get(ENV_RELAYS) {
            let relays: Vec<RelayConfig> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(RelayConfig::new)
                .collect();
            if !relays.is_empty() {
                self.relays = relays;
            }
        }
        if let Some(dir) = get(ENV_DATA_DIR) {
            if !dir.trim().is_empty() {
                self.data_dir = dir.trim().to_string();
            }
        }
    }

    /// Fills in the default relay list and rejects unusable values.
    pub fn finalize(&mut self) -> Result<()> {
        if self.relays.is_empty() {
            self.relays = DEFAULT_RELAYS.iter().map(|u| RelayConfig::new(*u)).collect();
        }
        for relay in &self.relays {
            validate_relay_url(&relay.url)?;
        }
        if self.publish_timeout_secs == 0
            || self.query_timeout_secs == 0
            || self.connect_timeout_secs == 0
        {
            return Err(anyhow!("timeouts must be at least one second"));
        }
        let mut seen = std::collections::HashSet::new();
        self.relays.retain(|r| seen.insert(r.url.clone()));
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            relays: self.relays.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            publish_timeout: Duration::from_secs(self.publish_timeout_secs),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }

    pub fn messaging_config(&self) -> MessagingConfig {
        MessagingConfig {
            envelope: EnvelopeConfig {
                timestamp_jitter_secs: self.timestamp_jitter_secs,
                legacy_context_prefix: self.legacy_context_prefix,
            },
            self_copy: self.self_copy,
        }
    }
}

pub fn validate_relay_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .ok_or_else(|| anyhow!("relay url must start with ws:// or wss://: {}", url))?;
    if rest.is_empty() || rest.starts_with('/') || rest.contains(char::is_whitespace) {
        return Err(anyhow!("invalid relay url: {}", url));
    }
    Ok(())
}
