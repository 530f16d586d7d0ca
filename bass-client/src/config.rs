//! Client configuration and the TOML config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use bass_protocol::BASS_MAX_BYTES;

use crate::error::ClientError;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "bass-client.toml";

/// Tunables of a per-device state machine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Time allowed for a GATT connect attempt.
    pub connect_timeout_ms: u64,
    /// Time allowed for a single GATT read or write.
    pub gatt_txn_timeout_ms: u64,
    /// Delay after which an unresolved add/update for a broadcast id is cancelled.
    pub source_operation_timeout_ms: u64,
    /// MTU requested after service discovery.
    pub requested_mtu: u16,
    /// Background auto-connect flag passed to the transport.
    pub auto_connect: bool,
    /// Ask for "sync, PAST not available" when adding sources.
    pub past_unavailable: bool,
    /// Write Set Broadcast Code without waiting for "code required".
    pub force_set_broadcast_code: bool,
    /// Answer every "code required" state, even without a cached request.
    pub set_code_requires_audio_state: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            gatt_txn_timeout_ms: 30_000,
            source_operation_timeout_ms: 3_000,
            requested_mtu: BASS_MAX_BYTES,
            auto_connect: true,
            past_unavailable: false,
            force_set_broadcast_code: false,
            set_code_requires_audio_state: false,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn gatt_txn_timeout(&self) -> Duration {
        Duration::from_millis(self.gatt_txn_timeout_ms)
    }

    pub fn source_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.source_operation_timeout_ms)
    }
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<PathBuf>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

pub fn load_config(path: &Path) -> Result<ConfigFile, ClientError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<ConfigFile, ClientError> {
    let config: ConfigFile = toml::from_str(contents)?;
    if config.client.requested_mtu <= bass_protocol::ATT_WRITE_CMD_HDR_LEN {
        return Err(ClientError::Config(format!(
            "requested_mtu {} is too small",
            config.client.requested_mtu
        )));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.client, ClientConfig::default());
        assert_eq!(config.client.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.client.source_operation_timeout(), Duration::from_secs(3));
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn test_partial_client_section() {
        let config = parse_config(
            r#"
            [client]
            requested_mtu = 64
            past_unavailable = true

            [logging]
            level = "debug"
            retention_days = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.client.requested_mtu, 64);
        assert!(config.client.past_unavailable);
        assert_eq!(config.client.gatt_txn_timeout_ms, 30_000);
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
        assert_eq!(config.logging.retention_days, Some(3));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            parse_config("[client]\nrequested_mtu = 2\n"),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            parse_config("[client]\nauto_connect = \"yes\"\n"),
            Err(ClientError::Toml(_))
        ));
    }
}
