//! Client configuration, loaded from TOML.
//!
//! Every field has a default matching the adapters this client targets, so an
//! empty file (or no file at all) yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DriverError, Result};
use crate::platform::short_uuid;

const SERVICE_UUID: u16 = 0xFFF0;
const READ_CHARACTERISTIC_UUID: u16 = 0xFFF1;
const WRITE_CHARACTERISTIC_UUID: u16 = 0xFFF2;

const DEFAULT_WRITE_ACK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_STATUS_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FLUSH_DELAY_MS: u64 = 1_000;
const DEFAULT_SCAN_DURATION_SECS: u64 = 60;
const DEFAULT_RESYNC_DELAY_MS: u64 = 250;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Log filter used when neither `STN_BLE_LOG` nor `RUST_LOG` is set.
    pub log_level: Option<String>,
    pub link: LinkConfig,
    pub handshake: HandshakeConfig,
    pub poller: PollerConfig,
    /// Targets polled once a device is connected.
    pub targets: Vec<TargetSeed>,
}

/// GATT layout and timing of the adapter link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub service_uuid: Uuid,
    /// Notify characteristic carrying adapter output.
    pub read_characteristic: Uuid,
    /// Write characteristic receiving commands.
    pub write_characteristic: Uuid,
    pub write_ack_timeout_ms: u64,
    pub response_timeout_ms: u64,
    /// Discovery turns itself off after this long.
    pub scan_duration_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: short_uuid(SERVICE_UUID),
            read_characteristic: short_uuid(READ_CHARACTERISTIC_UUID),
            write_characteristic: short_uuid(WRITE_CHARACTERISTIC_UUID),
            write_ack_timeout_ms: DEFAULT_WRITE_ACK_TIMEOUT_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
        }
    }
}

impl LinkConfig {
    pub fn write_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.write_ack_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }
}

/// Dialect detection sequence run right after the link comes up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Sent without waiting for an answer to knock the adapter out of any
    /// half-received command.
    pub wake: String,
    pub flush_delay_ms: u64,
    /// Configuration commands, each of which must be answered.
    pub commands: Vec<String>,
    /// Final request proving the adapter reaches the vehicle bus.
    pub status_command: String,
    pub status_timeout_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            wake: "???".into(),
            flush_delay_ms: DEFAULT_FLUSH_DELAY_MS,
            commands: vec![
                "ATD".into(),
                "ATSP 00".into(),
                "ATH 0".into(),
                "ATS 0".into(),
            ],
            status_command: "0100".into(),
            status_timeout_ms: DEFAULT_STATUS_TIMEOUT_MS,
        }
    }
}

impl HandshakeConfig {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Command selecting the target ECU, followed by a space and the target.
    pub select_prefix: String,
    /// Quiet period allowed for late output after a failed exchange, which is
    /// then discarded before the next command.
    pub resync_delay_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            select_prefix: "ATSH".into(),
            resync_delay_ms: DEFAULT_RESYNC_DELAY_MS,
        }
    }
}

impl PollerConfig {
    pub fn resync_delay(&self) -> Duration {
        Duration::from_millis(self.resync_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSeed {
    pub target: String,
    pub request: String,
}

impl ClientConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| DriverError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(text).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with the stock target list.
    pub fn with_default_targets() -> Self {
        Self {
            targets: default_targets(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let link = &self.link;
        if link.write_ack_timeout_ms == 0 || link.response_timeout_ms == 0 {
            return Err(DriverError::Config("link timeouts must be non-zero".into()));
        }
        if link.read_characteristic == link.write_characteristic {
            return Err(DriverError::Config(
                "read and write characteristics must differ".into(),
            ));
        }
        if self.handshake.status_command.trim().is_empty() {
            return Err(DriverError::Config(
                "handshake status command is empty".into(),
            ));
        }
        if self.handshake.status_timeout_ms == 0 {
            return Err(DriverError::Config(
                "handshake status timeout must be non-zero".into(),
            ));
        }
        if let Some(seed) = self
            .targets
            .iter()
            .find(|t| t.target.trim().is_empty() || t.request.trim().is_empty())
        {
            return Err(DriverError::Config(format!(
                "target entry has an empty field: {seed:?}"
            )));
        }
        Ok(())
    }
}

/// Engine speed from the first three ECUs, vehicle speed from the third.
pub fn default_targets() -> Vec<TargetSeed> {
    [("7E0", "010C1"), ("7E1", "010C1"), ("7E2", "010D1")]
        .into_iter()
        .map(|(target, request)| TargetSeed {
            target: target.into(),
            request: request.into(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.link.write_ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.link.scan_duration(), Duration::from_secs(60));
        assert_eq!(config.handshake.commands.len(), 4);
        assert_eq!(config.handshake.status_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_file_overrides_fields() {
        let config = ClientConfig::from_toml_str(
            r#"
            log_level = "debug"

            [link]
            response_timeout_ms = 2500

            [poller]
            select_prefix = "ATCRA"

            [[targets]]
            target = "7E8"
            request = "0105"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.link.response_timeout(), Duration::from_millis(2500));
        assert_eq!(config.link.write_ack_timeout_ms, 5_000);
        assert_eq!(config.poller.select_prefix, "ATCRA");
        assert_eq!(config.poller.resync_delay(), Duration::from_millis(250));
        assert_eq!(
            config.targets,
            vec![TargetSeed {
                target: "7E8".into(),
                request: "0105".into()
            }]
        );
    }

    #[test]
    fn rejects_zero_timeouts() {
        let err = ClientConfig::from_toml_str("[link]\nwrite_ack_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn rejects_blank_targets() {
        let err = ClientConfig::from_toml_str("[[targets]]\ntarget = \"\"\nrequest = \"0100\"")
            .unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn default_targets_cover_three_ecus() {
        let config = ClientConfig::with_default_targets();
        let targets: Vec<&str> = config.targets.iter().map(|t| t.target.as_str()).collect();
        assert_eq!(targets, ["7E0", "7E1", "7E2"]);
        assert!(config.validate().is_ok());
    }
}
