//! Settings types. Field names are camelCase in the settings file.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Upper bound for one pacing step; two steps keep the combined delay within a second.
pub const MAX_STAGE_PACING_MS: u64 = 500;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub execution: ExecutionSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Reject values that deserialize fine but break runtime guarantees.
    pub fn validate(&self) -> Result<()> {
        if self.execution.stage_pacing_ms > MAX_STAGE_PACING_MS {
            return Err(SettingsError::InvalidValue(format!(
                "execution.stagePacingMs must be at most {MAX_STAGE_PACING_MS}, got {}",
                self.execution.stage_pacing_ms
            )));
        }
        if self.connection.send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.sendQueue must be at least 1".into(),
            ));
        }
        if !(self.connection.url.starts_with("ws://") || self.connection.url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "connection.url must be a ws:// or wss:// URL, got {}",
                self.connection.url
            )));
        }
        Ok(())
    }
}

/// Duplex channel settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// WebSocket endpoint of the execution service.
    pub url: String,
    /// Reconnect attempts after the link drops. 0 disables reconnection.
    pub reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay_ms: u64,
    /// Outbound frames buffered before `send` reports a full queue.
    pub send_queue: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787/ws".to_string(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            send_queue: 64,
        }
    }
}

impl ConnectionSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Execution surface behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionSettings {
    /// Delay of each local pacing step (preparing → initiating → waiting). 0 disables pacing.
    pub stage_pacing_ms: u64,
    /// Fail a turn when no inbound event arrived for this long. 0 disables the guard.
    pub idle_timeout_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            stage_pacing_ms: 300,
            idle_timeout_ms: 120_000,
        }
    }
}

impl ExecutionSettings {
    pub fn stage_pacing(&self) -> Duration {
        Duration::from_millis(self.stage_pacing_ms.min(MAX_STAGE_PACING_MS))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module overrides, e.g. `{"skillrun_transport": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            module_levels: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.connection.url, "ws://127.0.0.1:8787/ws");
        assert_eq!(settings.connection.reconnect_attempts, 5);
        assert_eq!(settings.connection.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(settings.execution.stage_pacing(), Duration::from_millis(300));
        assert_eq!(settings.execution.idle_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(settings.logging.level, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_timeout_disables_guard() {
        let exec = ExecutionSettings {
            idle_timeout_ms: 0,
            ..Default::default()
        };
        assert!(exec.idle_timeout().is_none());
    }

    #[test]
    fn pacing_is_capped() {
        let exec = ExecutionSettings {
            stage_pacing_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(exec.stage_pacing(), Duration::from_millis(MAX_STAGE_PACING_MS));

        let settings = Settings {
            execution: exec,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn rejects_non_websocket_url() {
        let mut settings = Settings::default();
        settings.connection.url = "http://example.com".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert!(json["connection"].get("reconnectAttempts").is_some());
        assert!(json["execution"].get("stagePacingMs").is_some());
        assert!(json["logging"].get("moduleLevels").is_some());
    }
}
