use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub udp: UdpConfig,
    pub ports: PortsConfig,
    pub rotation: RotationConfig,
    pub segments: SegmentsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub bind: String,
}

/// Logical port numbers multiplexing message types over the uplink and
/// downlink transport. Deployment-configured; defaults match the
/// deployed device firmware.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Uplink: device public key update (`PUBKEY:` payloads).
    pub device_pubkey: u8,
    /// Downlink: gateway public key broadcast (`UA_PUBKEY:` payloads);
    /// uplinked frames on this port are our own broadcast echoing back.
    pub gateway_pubkey: u8,
    /// Rotation acknowledgment, logged for the audit trail.
    pub rotation_ack: u8,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Seconds between scheduled rotations (default 30 days). Checked on
    /// every inbound frame, so actual latency depends on traffic.
    pub interval_secs: u64,
    /// Settle delay after a device join before rotating, so we do not
    /// race the device's own post-join key exchange.
    pub join_settle_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SegmentsConfig {
    /// Per-frame payload budget; larger messages go out as SEG frames.
    pub max_frame_len: usize,
    /// Idle seconds before an incomplete reassembly buffer is dropped.
    pub reassembly_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl RotationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn join_settle(&self) -> Duration {
        Duration::from_secs(self.join_settle_secs)
    }
}

impl SegmentsConfig {
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1780".to_string(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            device_pubkey: 26,
            gateway_pubkey: 76,
            rotation_ack: 10,
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30 * 24 * 60 * 60,
            join_settle_secs: 30,
        }
    }
}

impl Default for SegmentsConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 128,
            reassembly_timeout_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.ports.device_pubkey, 26);
        assert_eq!(config.ports.gateway_pubkey, 76);
        assert_eq!(config.ports.rotation_ack, 10);
        assert_eq!(config.rotation.interval_secs, 2_592_000);
        assert_eq!(config.segments.max_frame_len, 128);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [rotation]
            interval_secs = 60
            join_settle_secs = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.rotation.interval_secs, 60);
        assert_eq!(config.ports.device_pubkey, 26);
    }
}
