//! Configuration resolution for `RelayGate`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/relaygate/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`RELAYGATE_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Relays used by a content sync when the request names none.
pub const DEFAULT_SYNC_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
    "wss://relay.snort.social",
    "wss://purplepag.es",
];

/// Complete `RelayGate` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Operator identity (hex or npub). Never auto-removed, never retention-deleted.
    #[serde(default)]
    pub operator_pubkey: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Database locations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Admin database (jobs, invoices, grants, whitelist, audit log).
    pub admin_db_path: Option<PathBuf>,
    /// Content database holding relay events.
    pub events_db_path: Option<PathBuf>,
}

/// How to reach the managed relay process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    /// Pid file of the running relay; reloads are signalled to this pid.
    pub pid_file: Option<PathBuf>,
    /// Where the whitelist policy file is written for the relay to read.
    pub policy_file: Option<PathBuf>,
    /// Command (argv) used to start the relay after a restart.
    #[serde(default)]
    pub restart_command: Vec<String>,
}

/// Lightning payment backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentsConfig {
    pub enabled: bool,
    /// LND REST endpoint, e.g. `https://127.0.0.1:8080`.
    pub lnd_url: Option<String>,
    /// Hex-encoded invoice macaroon.
    pub macaroon_hex: Option<String>,
    /// PEM certificate of the LND node (self-signed in most deployments).
    pub tls_cert_path: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub resubscribe_delay_secs: u64,
    pub invoice_expiry_secs: i64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lnd_url: None,
            macaroon_hex: None,
            tls_cert_path: None,
            poll_interval_secs: 10,
            resubscribe_delay_secs: 5,
            invoice_expiry_secs: 3600,
        }
    }
}

/// Content sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub default_relays: Vec<String>,
    /// Persist progress counters every N processed events.
    pub progress_flush_every: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_relays: DEFAULT_SYNC_RELAYS.iter().map(ToString::to_string).collect(),
            progress_flush_every: 100,
            connect_timeout_secs: 10,
        }
    }
}

/// Time of day (UTC) for a daily job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyTime {
    pub hour: u32,
    pub minute: u32,
}

/// Daily job schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub retention_at: DailyTime,
    pub expiry_at: DailyTime,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            retention_at: DailyTime { hour: 3, minute: 0 },
            expiry_at: DailyTime { hour: 0, minute: 5 },
        }
    }
}

impl DailyTime {
    pub fn validate(&self) -> Result<()> {
        if self.hour > 23 || self.minute > 59 {
            return Err(Error::Config(format!(
                "Invalid time of day {:02}:{:02}",
                self.hour, self.minute
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Check values that serde alone cannot.
    pub fn validate(&self) -> Result<()> {
        self.schedule.retention_at.validate()?;
        self.schedule.expiry_at.validate()?;
        if self.sync.progress_flush_every == 0 {
            return Err(Error::Config(
                "sync.progress_flush_every must be at least 1".into(),
            ));
        }
        if self.payments.poll_interval_secs == 0 {
            return Err(Error::Config(
                "payments.poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.payments.enabled && self.payments.lnd_url.is_none() {
            return Err(Error::Config(
                "payments.enabled requires payments.lnd_url".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    // Explicit file must exist if given
    if let Some(path) = explicit {
        let overlay = load_config_file(path)?;
        merge_config(&mut config, overlay);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    config.validate()?;
    Ok(config)
}

/// Directory holding `RelayGate` state and config.
pub fn config_dir() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .map(|p| p.join("relaygate"))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    // Optional paths only override when set
    if overlay.storage.admin_db_path.is_some() {
        base.storage.admin_db_path = overlay.storage.admin_db_path;
    }
    if overlay.storage.events_db_path.is_some() {
        base.storage.events_db_path = overlay.storage.events_db_path;
    }
    if overlay.relay.pid_file.is_some() {
        base.relay.pid_file = overlay.relay.pid_file;
    }
    if overlay.relay.policy_file.is_some() {
        base.relay.policy_file = overlay.relay.policy_file;
    }
    if !overlay.relay.restart_command.is_empty() {
        base.relay.restart_command = overlay.relay.restart_command;
    }
    if overlay.operator_pubkey.is_some() {
        base.operator_pubkey = overlay.operator_pubkey;
    }
    if overlay.log_level.is_some() {
        base.log_level = overlay.log_level;
    }

    base.payments = overlay.payments;
    base.sync = overlay.sync;
    base.schedule = overlay.schedule;
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("RELAYGATE_ADMIN_DB") {
        config.storage.admin_db_path = Some(PathBuf::from(val));
    }
    if let Some(val) = var("RELAYGATE_EVENTS_DB") {
        config.storage.events_db_path = Some(PathBuf::from(val));
    }
    if let Some(val) = var("RELAYGATE_OPERATOR_PUBKEY") {
        config.operator_pubkey = Some(val);
    }
    if let Some(val) = var("RELAYGATE_LND_URL") {
        config.payments.lnd_url = Some(val);
        config.payments.enabled = true;
    }
    if let Some(val) = var("RELAYGATE_LND_MACAROON") {
        config.payments.macaroon_hex = Some(val);
    }
    if let Some(val) = var("RELAYGATE_POLICY_FILE") {
        config.relay.policy_file = Some(PathBuf::from(val));
    }
    if let Some(val) = var("RELAYGATE_RELAY_PID_FILE") {
        config.relay.pid_file = Some(PathBuf::from(val));
    }
    if let Some(val) = var("RELAYGATE_LOG_LEVEL") {
        config.log_level = Some(val);
    }
}
