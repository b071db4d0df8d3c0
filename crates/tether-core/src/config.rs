//! Typed configuration.
//!
//! Loaded from TOML, then overridden from the environment, then validated.
//! Every section and field has a default, so an empty file is a valid
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::ReconnectPolicy;
use crate::error::{ConfigError, ConfigResult};

/// Environment variable overriding `server.gateway_url`.
pub const ENV_GATEWAY_URL: &str = "TETHER_GATEWAY_URL";
/// Environment variable overriding `server.username`.
pub const ENV_USERNAME: &str = "TETHER_USERNAME";
/// Environment variable overriding `relay.webhook_url`.
pub const ENV_RELAY_WEBHOOK: &str = "TETHER_RELAY_WEBHOOK";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Gateway connection.
    pub server: ServerConfig,
    /// Reconnect delays.
    pub reconnect: ReconnectConfig,
    /// Per-session settle delays and background tasks.
    pub session: SessionConfig,
    /// Interaction sequence timing.
    pub sequencer: SequencerConfig,
    /// Liveness monitor.
    pub monitor: MonitorConfig,
    /// Chat classification.
    pub chat: ChatConfig,
    /// Chat relay.
    pub relay: RelayConfig,
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket URL of the protocol gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Account name to log in with.
    #[serde(default = "default_username")]
    pub username: String,
    /// Handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:25580/gateway".into()
}

fn default_username() -> String {
    "tether".into()
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            username: default_username(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// Handshake timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// `[reconnect]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Base backoff delay (milliseconds).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff growth factor.
    #[serde(default = "default_growth")]
    pub growth: f64,
    /// Backoff cap (milliseconds).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Exclusive jitter ceiling (milliseconds).
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    /// Exponent ceiling.
    #[serde(default = "default_max_exponent")]
    pub max_exponent: u32,
    /// Counter reset period.
    #[serde(default = "default_reset_every")]
    pub reset_every: u32,
    /// Expected-transfer delay lower bound (milliseconds).
    #[serde(default = "default_transfer_min_ms")]
    pub transfer_min_ms: u64,
    /// Expected-transfer delay exclusive upper bound (milliseconds).
    #[serde(default = "default_transfer_max_ms")]
    pub transfer_max_ms: u64,
    /// Delay after a session creation failure (milliseconds).
    #[serde(default = "default_creation_failure_ms")]
    pub creation_failure_ms: u64,
    /// Delay after an uncaught fault (milliseconds).
    #[serde(default = "default_fault_recovery_ms")]
    pub fault_recovery_ms: u64,
}

const fn default_base_delay_ms() -> u64 {
    5_000
}

const fn default_growth() -> f64 {
    1.1
}

const fn default_max_delay_ms() -> u64 {
    300_000 // 5 minutes
}

const fn default_jitter_max_ms() -> u64 {
    2_000
}

const fn default_max_exponent() -> u32 {
    20
}

const fn default_reset_every() -> u32 {
    100
}

const fn default_transfer_min_ms() -> u64 {
    5_000
}

const fn default_transfer_max_ms() -> u64 {
    8_000
}

const fn default_creation_failure_ms() -> u64 {
    10_000
}

const fn default_fault_recovery_ms() -> u64 {
    5_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            growth: default_growth(),
            max_delay_ms: default_max_delay_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            max_exponent: default_max_exponent(),
            reset_every: default_reset_every(),
            transfer_min_ms: default_transfer_min_ms(),
            transfer_max_ms: default_transfer_max_ms(),
            creation_failure_ms: default_creation_failure_ms(),
            fault_recovery_ms: default_fault_recovery_ms(),
        }
    }
}

/// `[session]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Delay between spawn and the post-spawn sequence (milliseconds).
    #[serde(default = "default_sequence_settle_ms")]
    pub sequence_settle_ms: u64,
    /// Delay between spawn and task initialization (milliseconds).
    #[serde(default = "default_tasks_settle_ms")]
    pub tasks_settle_ms: u64,
    /// Delay between server confirmation and task initialization.
    #[serde(default = "default_confirmation_settle_ms")]
    pub confirmation_settle_ms: u64,
    /// Anti-idle period (seconds).
    #[serde(default = "default_anti_idle_interval_secs")]
    pub anti_idle_interval_secs: u64,
    /// Probability that an anti-idle period performs an action.
    #[serde(default = "default_anti_idle_probability")]
    pub anti_idle_probability: f64,
    /// Capture period (seconds).
    #[serde(default = "default_capture_interval_secs")]
    pub capture_interval_secs: u64,
    /// Where captured frames are written. Capture is off when unset.
    #[serde(default)]
    pub capture_path: Option<PathBuf>,
}

const fn default_sequence_settle_ms() -> u64 {
    2_000
}

const fn default_tasks_settle_ms() -> u64 {
    15_000
}

const fn default_confirmation_settle_ms() -> u64 {
    3_000
}

const fn default_anti_idle_interval_secs() -> u64 {
    180
}

const fn default_anti_idle_probability() -> f64 {
    0.3
}

const fn default_capture_interval_secs() -> u64 {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sequence_settle_ms: default_sequence_settle_ms(),
            tasks_settle_ms: default_tasks_settle_ms(),
            confirmation_settle_ms: default_confirmation_settle_ms(),
            anti_idle_interval_secs: default_anti_idle_interval_secs(),
            anti_idle_probability: default_anti_idle_probability(),
            capture_interval_secs: default_capture_interval_secs(),
            capture_path: None,
        }
    }
}

impl SessionConfig {
    /// Spawn → sequence delay.
    #[must_use]
    pub const fn sequence_settle(&self) -> Duration {
        Duration::from_millis(self.sequence_settle_ms)
    }

    /// Spawn → task initialization delay.
    #[must_use]
    pub const fn tasks_settle(&self) -> Duration {
        Duration::from_millis(self.tasks_settle_ms)
    }

    /// Confirmation → task initialization delay.
    #[must_use]
    pub const fn confirmation_settle(&self) -> Duration {
        Duration::from_millis(self.confirmation_settle_ms)
    }

    /// Anti-idle period.
    #[must_use]
    pub const fn anti_idle_interval(&self) -> Duration {
        Duration::from_secs(self.anti_idle_interval_secs)
    }

    /// Capture period.
    #[must_use]
    pub const fn capture_interval(&self) -> Duration {
        Duration::from_secs(self.capture_interval_secs)
    }
}

/// `[sequencer]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Hotbar slot holding the item that opens the emerald window.
    #[serde(default = "default_hotbar_slot")]
    pub hotbar_slot: u8,
    /// Delay between selecting the slot and using the item (milliseconds).
    #[serde(default = "default_activate_delay_ms")]
    pub activate_delay_ms: u64,
    /// Delay between the window opening and the slot scan (milliseconds).
    #[serde(default = "default_slot_settle_ms")]
    pub slot_settle_ms: u64,
    /// Delay between the click and closing the window (milliseconds).
    #[serde(default = "default_close_delay_ms")]
    pub close_delay_ms: u64,
    /// How long to wait for a window before giving up (milliseconds).
    #[serde(default = "default_window_timeout_ms")]
    pub window_timeout_ms: u64,
    /// Command that opens the accept window.
    #[serde(default = "default_accept_command")]
    pub accept_command: String,
    /// Run the emerald sequence after every initial spawn.
    #[serde(default = "default_run_on_spawn")]
    pub run_on_spawn: bool,
}

const fn default_hotbar_slot() -> u8 {
    4
}

const fn default_activate_delay_ms() -> u64 {
    500
}

const fn default_slot_settle_ms() -> u64 {
    200
}

const fn default_close_delay_ms() -> u64 {
    1_000
}

const fn default_window_timeout_ms() -> u64 {
    10_000
}

fn default_accept_command() -> String {
    "/tpaaccept".into()
}

const fn default_run_on_spawn() -> bool {
    true
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            hotbar_slot: default_hotbar_slot(),
            activate_delay_ms: default_activate_delay_ms(),
            slot_settle_ms: default_slot_settle_ms(),
            close_delay_ms: default_close_delay_ms(),
            window_timeout_ms: default_window_timeout_ms(),
            accept_command: default_accept_command(),
            run_on_spawn: default_run_on_spawn(),
        }
    }
}

/// `[monitor]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Check period (seconds).
    #[serde(default = "default_monitor_period_secs")]
    pub period_secs: u64,
    /// No checks within this long after a spawn (seconds).
    #[serde(default = "default_monitor_grace_secs")]
    pub grace_secs: u64,
    /// Reconnect delay after a dead transport (milliseconds).
    #[serde(default = "default_dead_transport_ms")]
    pub dead_transport_ms: u64,
}

const fn default_monitor_period_secs() -> u64 {
    120
}

const fn default_monitor_grace_secs() -> u64 {
    180
}

const fn default_dead_transport_ms() -> u64 {
    5_000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period_secs: default_monitor_period_secs(),
            grace_secs: default_monitor_grace_secs(),
            dead_transport_ms: default_dead_transport_ms(),
        }
    }
}

impl MonitorConfig {
    /// Check period.
    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Post-spawn grace window.
    #[must_use]
    pub const fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// `[chat]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Prefix the server puts before relayed lines, e.g. `Lobby »`.
    #[serde(default = "default_server_prefix")]
    pub server_prefix: String,
    /// Phrases meaning the transfer to the target server succeeded.
    /// Matched case-insensitively anywhere in the line.
    #[serde(default = "default_confirmation_phrases")]
    pub confirmation_phrases: Vec<String>,
    /// System lines starting with one of these are not relayed.
    #[serde(default = "default_suppressed_prefixes")]
    pub suppressed_prefixes: Vec<String>,
    /// Lines containing one of these are not relayed.
    #[serde(default = "default_ignored_substrings")]
    pub ignored_substrings: Vec<String>,
}

fn default_server_prefix() -> String {
    "TrySmp".into()
}

fn default_confirmation_phrases() -> Vec<String> {
    [
        "You are already on the server economy-euc",
        "Sending you to economy-euc",
        "You have been added to the queue for economy-euc",
        "Connected to economy-euc",
        "Welcome to economy-euc",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_suppressed_prefixes() -> Vec<String> {
    [
        "Your balance is",
        "You are already on",
        "Sending you to",
        "You have been added to the queue",
        "Usage:",
        "Invalid amount",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_ignored_substrings() -> Vec<String> {
    vec!["TryAFK".into()]
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            server_prefix: default_server_prefix(),
            confirmation_phrases: default_confirmation_phrases(),
            suppressed_prefixes: default_suppressed_prefixes(),
            ignored_substrings: default_ignored_substrings(),
        }
    }
}

/// `[relay]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Webhook that receives relayed chat lines and notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl TetherConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] on malformed TOML or wrong types.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read, override from the environment, and validate.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] if the file cannot be read, or a parse
    /// or validation error.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_GATEWAY_URL).filter(|v| !v.is_empty()) {
            self.server.gateway_url = url;
        }
        if let Some(name) = lookup(ENV_USERNAME).filter(|v| !v.is_empty()) {
            self.server.username = name;
        }
        if let Some(hook) = lookup(ENV_RELAY_WEBHOOK).filter(|v| !v.is_empty()) {
            self.relay.webhook_url = Some(hook);
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.gateway_url.is_empty() {
            return Err(ConfigError::Invalid("server.gateway_url cannot be empty".into()));
        }
        if !(self.server.gateway_url.starts_with("ws://")
            || self.server.gateway_url.starts_with("wss://"))
        {
            return Err(ConfigError::Invalid(
                "server.gateway_url must use ws:// or wss://".into(),
            ));
        }
        if self.server.username.is_empty() {
            return Err(ConfigError::Invalid("server.username cannot be empty".into()));
        }

        let r = &self.reconnect;
        if r.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("reconnect.base_delay_ms must be > 0".into()));
        }
        if r.growth < 1.0 {
            return Err(ConfigError::Invalid("reconnect.growth must be >= 1.0".into()));
        }
        if r.max_delay_ms < r.base_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_delay_ms must be >= base_delay_ms".into(),
            ));
        }
        if r.transfer_max_ms < r.transfer_min_ms {
            return Err(ConfigError::Invalid(
                "reconnect.transfer_max_ms must be >= transfer_min_ms".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.session.anti_idle_probability) {
            return Err(ConfigError::Invalid(
                "session.anti_idle_probability must be within [0, 1]".into(),
            ));
        }
        if self.session.anti_idle_interval_secs == 0 || self.session.capture_interval_secs == 0 {
            return Err(ConfigError::Invalid("session intervals must be > 0".into()));
        }
        if self.sequencer.hotbar_slot > 8 {
            return Err(ConfigError::Invalid("sequencer.hotbar_slot must be 0-8".into()));
        }
        if self.monitor.period_secs == 0 {
            return Err(ConfigError::Invalid("monitor.period_secs must be > 0".into()));
        }
        if let Some(url) = &self.relay.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(
                    "relay.webhook_url must use http:// or https://".into(),
                ));
            }
        }

        Ok(())
    }

    /// Reconnect policy derived from `[reconnect]` and `[monitor]`.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let r = &self.reconnect;
        ReconnectPolicy {
            base_delay_ms: r.base_delay_ms,
            growth: r.growth,
            max_delay_ms: r.max_delay_ms,
            jitter_max_ms: r.jitter_max_ms,
            max_exponent: r.max_exponent,
            reset_every: r.reset_every,
            transfer_min_ms: r.transfer_min_ms,
            transfer_max_ms: r.transfer_max_ms,
            creation_failure_ms: r.creation_failure_ms,
            fault_recovery_ms: r.fault_recovery_ms,
            dead_transport_ms: self.monitor.dead_transport_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = TetherConfig::from_toml_str("").unwrap();
        assert_eq!(config, TetherConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_match_reconnect_policy_defaults() {
        assert_eq!(TetherConfig::default().reconnect_policy(), ReconnectPolicy::default());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = TetherConfig::from_toml_str(
            r#"
            [reconnect]
            base_delay_ms = 1000

            [sequencer]
            run_on_spawn = false
            "#,
        )
        .unwrap();
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.reconnect.max_delay_ms, 300_000);
        assert!(!config.sequencer.run_on_spawn);
        assert_eq!(config.sequencer.hotbar_slot, 4);
    }

    #[test]
    fn wrong_type_is_parse_error() {
        let err = TetherConfig::from_toml_str("[monitor]\nperiod_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = TetherConfig::default();
        config.apply_overrides(|key| match key {
            ENV_GATEWAY_URL => Some("wss://gw.example/ws".into()),
            ENV_RELAY_WEBHOOK => Some("https://hooks.example/abc".into()),
            ENV_USERNAME => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.server.gateway_url, "wss://gw.example/ws");
        assert_eq!(config.server.username, "tether");
        assert_eq!(config.relay.webhook_url.as_deref(), Some("https://hooks.example/abc"));
    }

    #[test]
    fn rejects_non_websocket_gateway() {
        let mut config = TetherConfig::default();
        config.server.gateway_url = "http://gw".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_inverted_transfer_window() {
        let mut config = TetherConfig::default();
        config.reconnect.transfer_min_ms = 9_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("transfer_max_ms"));
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let mut config = TetherConfig::default();
        config.session.anti_idle_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = TetherConfig::load(Path::new("/nonexistent/tether.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
