//! Inbound frame dispatch
//!
//! Parses `PORT:<port> RX:<payload> DevEUI:<eui>` frames off the
//! ingestion path and routes them by logical port: gateway broadcast
//! echo, rotation acknowledgment, device public key update, or encrypted
//! sensor data. Frames arrive continuously from an untrusted transport,
//! so every failure here is logged and dropped; nothing propagates out
//! of `handle_frame`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::PortsConfig;
use crate::crypto::{SensorCrypto, PUBLIC_KEY_HEX_LEN, PUBLIC_KEY_LEN};
use crate::error::EngineError;
use crate::keystore::DeviceKeyStore;
use crate::rotation::RotationOrchestrator;
use crate::segment::{ConversationKind, Reassembly, SegmentTable};

/// One inbound frame: the engine's sole uplink data contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkFrame {
    pub port: u8,
    pub payload_hex: String,
    pub dev_eui: String,
}

impl UplinkFrame {
    /// Parse the textual frame shape `PORT:<port> RX:<data> DevEUI:<eui>`.
    /// The RX field may be quoted; quotes are stripped.
    pub fn parse(line: &str) -> Result<Self, EngineError> {
        let port_idx = line
            .find("PORT:")
            .ok_or_else(|| EngineError::Decode("missing PORT: field".to_string()))?;
        let rx_idx = line
            .find("RX:")
            .ok_or_else(|| EngineError::Decode("missing RX: field".to_string()))?;
        let eui_idx = line
            .find("DevEUI:")
            .ok_or_else(|| EngineError::Decode("missing DevEUI: field".to_string()))?;
        if port_idx > rx_idx || rx_idx > eui_idx {
            return Err(EngineError::Decode("fields out of order".to_string()));
        }

        let port_str = line[port_idx + 5..rx_idx].trim();
        let port: u8 = port_str
            .parse()
            .map_err(|_| EngineError::Decode(format!("invalid port {:?}", port_str)))?;

        let mut data = line[rx_idx + 3..eui_idx].trim();
        data = data.strip_prefix('"').unwrap_or(data);
        data = data.strip_suffix('"').unwrap_or(data);

        let dev_eui = line[eui_idx + 7..].trim();
        if dev_eui.is_empty() {
            return Err(EngineError::Decode("empty DevEUI".to_string()));
        }

        Ok(Self {
            port,
            payload_hex: data.to_string(),
            dev_eui: dev_eui.to_string(),
        })
    }
}

/// A decrypted sensor payload handed to the downstream data pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReading {
    pub dev_eui: String,
    pub port: u8,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Routes inbound frames and mutates the device key store.
pub struct FrameDispatcher {
    store: Arc<DeviceKeyStore>,
    segments: SegmentTable,
    rotation: Arc<RotationOrchestrator>,
    ports: PortsConfig,
    readings_tx: Option<mpsc::Sender<SensorReading>>,
}

impl FrameDispatcher {
    pub fn new(
        store: Arc<DeviceKeyStore>,
        segments: SegmentTable,
        rotation: Arc<RotationOrchestrator>,
        ports: PortsConfig,
        readings_tx: Option<mpsc::Sender<SensorReading>>,
    ) -> Self {
        Self {
            store,
            segments,
            rotation,
            ports,
            readings_tx,
        }
    }

    /// Route one frame. Never fails: per-frame errors are logged with
    /// the device id for operator visibility and the frame is dropped.
    pub async fn handle_frame(&self, frame: UplinkFrame) {
        // Scheduled rotation rides on inbound traffic.
        self.rotation.tick().await;

        let dev_eui = frame.dev_eui.as_str();
        if frame.port == self.ports.gateway_pubkey {
            // Our own broadcast echoing back through the network server.
            info!(dev_eui, "gateway public key broadcast receipt");
        } else if frame.port == self.ports.rotation_ack {
            info!(dev_eui, payload = %frame.payload_hex, "rotation acknowledgment received");
        } else if frame.port == self.ports.device_pubkey {
            if let Err(e) = self.handle_pubkey_update(&frame).await {
                warn!(dev_eui, error = %e, "dropping public key update");
            }
        } else {
            match self.handle_sensor_data(&frame).await {
                Ok(reading) => self.forward_reading(reading).await,
                Err(EngineError::NoKeyEstablished(_)) => {
                    // Expected during provisioning; the device has not
                    // completed a key exchange yet.
                    warn!(dev_eui, port = frame.port, "no key established, dropping sensor data");
                }
                Err(e) => {
                    error!(dev_eui, port = frame.port, error = %e, "dropping sensor data");
                }
            }
        }
    }

    /// Device public key path: hex → UTF-8 text → reassembly →
    /// `PUBKEY:<130 hex chars>` → ECDH → atomic store replacement.
    /// Any failure leaves the device's prior key in place.
    async fn handle_pubkey_update(&self, frame: &UplinkFrame) -> Result<(), EngineError> {
        let raw = hex::decode(&frame.payload_hex)
            .map_err(|e| EngineError::Decode(format!("invalid hex payload: {}", e)))?;
        let text = String::from_utf8(raw)
            .map_err(|e| EngineError::Decode(format!("payload is not UTF-8: {}", e)))?;

        let message = match self
            .segments
            .feed(&frame.dev_eui, ConversationKind::PubKeyUpdate, &text)
            .await
        {
            Some(Reassembly::Complete(message)) => message,
            Some(Reassembly::Incomplete { received, total }) => {
                info!(dev_eui = %frame.dev_eui, received, total, "public key transfer in progress");
                return Ok(());
            }
            None => {
                return Err(EngineError::Decode("unparsable segment frame".to_string()));
            }
        };

        let key_hex = message
            .strip_prefix("PUBKEY:")
            .ok_or_else(|| EngineError::Decode("missing PUBKEY: prefix".to_string()))?;

        if key_hex.is_empty() {
            return Err(EngineError::InvalidPeerKey("empty public key".to_string()));
        }
        if key_hex.len() != PUBLIC_KEY_HEX_LEN {
            return Err(EngineError::InvalidPeerKey(format!(
                "expected {} hex chars, got {}",
                PUBLIC_KEY_HEX_LEN,
                key_hex.len()
            )));
        }

        let key_bytes = hex::decode(key_hex)
            .map_err(|e| EngineError::InvalidPeerKey(format!("invalid hex: {}", e)))?;
        let secret = self.rotation.derive_for_peer(&key_bytes).await?;

        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&key_bytes);
        self.store
            .insert(&frame.dev_eui, public_key, SensorCrypto::new(&secret))
            .await;
        info!(dev_eui = %frame.dev_eui, "device public key updated, shared secret re-derived");
        Ok(())
    }

    async fn handle_sensor_data(&self, frame: &UplinkFrame) -> Result<SensorReading, EngineError> {
        let entry = self
            .store
            .get(&frame.dev_eui)
            .await
            .ok_or_else(|| EngineError::NoKeyEstablished(frame.dev_eui.clone()))?;

        let ciphertext = hex::decode(&frame.payload_hex)
            .map_err(|e| EngineError::Decode(format!("invalid hex payload: {}", e)))?;

        // The entry Arc is cloned out of the store; decryption runs with
        // no lock held and survives a concurrent key replacement.
        let payload = entry.crypto.decrypt(&ciphertext)?;

        Ok(SensorReading {
            dev_eui: frame.dev_eui.clone(),
            port: frame.port,
            payload,
            received_at: Utc::now(),
        })
    }

    async fn forward_reading(&self, reading: SensorReading) {
        info!(
            dev_eui = %reading.dev_eui,
            port = reading.port,
            payload = %String::from_utf8_lossy(&reading.payload),
            "decrypted sensor data"
        );
        if let Some(tx) = &self.readings_tx {
            if let Err(e) = tx.send(reading).await {
                error!("failed to forward sensor reading downstream: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotationConfig;
    use crate::crypto::{derive_shared_secret, KeyPair};
    use crate::downlink::{DownlinkCommand, DownlinkHandle};
    use std::time::Duration;

    const DEV_EUI: &str = "aabbccddeeff0011";

    struct Fixture {
        dispatcher: FrameDispatcher,
        store: Arc<DeviceKeyStore>,
        rotation: Arc<RotationOrchestrator>,
        readings_rx: mpsc::Receiver<SensorReading>,
        _downlink_rx: mpsc::Receiver<DownlinkCommand>,
    }

    fn fixture() -> Fixture {
        let (handle, downlink_rx) = DownlinkHandle::channel(64);
        let store = Arc::new(DeviceKeyStore::new());
        let rotation_cfg = RotationConfig {
            interval_secs: 3600,
            join_settle_secs: 0,
        };
        let rotation = Arc::new(
            RotationOrchestrator::new(
                handle,
                Arc::clone(&store),
                PortsConfig::default(),
                rotation_cfg,
                128,
            )
            .unwrap(),
        );
        let (readings_tx, readings_rx) = mpsc::channel(16);
        let dispatcher = FrameDispatcher::new(
            Arc::clone(&store),
            SegmentTable::new(Duration::from_secs(300)),
            Arc::clone(&rotation),
            PortsConfig::default(),
            Some(readings_tx),
        );
        Fixture {
            dispatcher,
            store,
            rotation,
            readings_rx,
            _downlink_rx: downlink_rx,
        }
    }

    fn pubkey_frame(dev_eui: &str, ascii_payload: &str) -> UplinkFrame {
        UplinkFrame {
            port: 26,
            payload_hex: hex::encode(ascii_payload.as_bytes()),
            dev_eui: dev_eui.to_string(),
        }
    }

    #[test]
    fn test_parse_frame() {
        let frame = UplinkFrame::parse("PORT:26 RX:48656c6c6f DevEUI:aabbccddeeff0011").unwrap();
        assert_eq!(frame.port, 26);
        assert_eq!(frame.payload_hex, "48656c6c6f");
        assert_eq!(frame.dev_eui, "aabbccddeeff0011");
    }

    #[test]
    fn test_parse_frame_quoted_rx() {
        let frame = UplinkFrame::parse("PORT:7 RX:\"cafe\" DevEUI:0011223344556677").unwrap();
        assert_eq!(frame.payload_hex, "cafe");
    }

    #[test]
    fn test_parse_frame_malformed() {
        assert!(UplinkFrame::parse("RX:aa DevEUI:bb").is_err());
        assert!(UplinkFrame::parse("PORT:x RX:aa DevEUI:bb").is_err());
        assert!(UplinkFrame::parse("PORT:1 RX:aa DevEUI:").is_err());
        assert!(UplinkFrame::parse("DevEUI:bb PORT:1 RX:aa").is_err());
    }

    #[tokio::test]
    async fn test_single_frame_pubkey_update_installs_key() {
        let f = fixture();
        let device = KeyPair::generate().unwrap();

        let payload = format!("PUBKEY:{}", device.public_key_hex());
        f.dispatcher.handle_frame(pubkey_frame(DEV_EUI, &payload)).await;

        assert!(f.store.has_key(DEV_EUI).await);
        let entry = f.store.get(DEV_EUI).await.unwrap();
        assert_eq!(entry.public_key, device.public_key_bytes());
    }

    #[tokio::test]
    async fn test_segmented_pubkey_update_installs_key_on_last_segment() {
        let f = fixture();
        let device = KeyPair::generate().unwrap();
        let message = format!("PUBKEY:{}", device.public_key_hex());

        let frames = crate::segment::segment_message(&message, 51);
        assert!(frames.len() > 1);

        for (i, seg) in frames.iter().enumerate() {
            f.dispatcher.handle_frame(pubkey_frame(DEV_EUI, seg)).await;
            let installed = f.store.has_key(DEV_EUI).await;
            if i + 1 < frames.len() {
                assert!(!installed, "key must not appear before the final segment");
            } else {
                assert!(installed);
            }
        }
    }

    #[tokio::test]
    async fn test_short_pubkey_rejected_store_unchanged() {
        let f = fixture();
        // 33-byte (compressed-length) point: wrong for this protocol.
        let payload = format!("PUBKEY:{}", "ab".repeat(33));
        f.dispatcher.handle_frame(pubkey_frame(DEV_EUI, &payload)).await;
        assert!(!f.store.has_key(DEV_EUI).await);
    }

    #[tokio::test]
    async fn test_invalid_point_rejected_keeps_prior_key() {
        let f = fixture();
        let device = KeyPair::generate().unwrap();
        let good = format!("PUBKEY:{}", device.public_key_hex());
        f.dispatcher.handle_frame(pubkey_frame(DEV_EUI, &good)).await;
        let before = f.store.get(DEV_EUI).await.unwrap().public_key;

        // Right length, not on the curve.
        let bad = format!("PUBKEY:04{}", "ff".repeat(64));
        f.dispatcher.handle_frame(pubkey_frame(DEV_EUI, &bad)).await;

        assert_eq!(f.store.get(DEV_EUI).await.unwrap().public_key, before);
    }

    #[tokio::test]
    async fn test_malformed_hex_dropped() {
        let f = fixture();
        let frame = UplinkFrame {
            port: 26,
            payload_hex: "zz-not-hex".to_string(),
            dev_eui: DEV_EUI.to_string(),
        };
        f.dispatcher.handle_frame(frame).await;
        assert!(!f.store.has_key(DEV_EUI).await);
    }

    #[tokio::test]
    async fn test_non_utf8_payload_dropped() {
        let f = fixture();
        let frame = UplinkFrame {
            port: 26,
            payload_hex: "ff".to_string(),
            dev_eui: DEV_EUI.to_string(),
        };
        f.dispatcher.handle_frame(frame).await;
        assert!(!f.store.has_key(DEV_EUI).await);
    }

    #[tokio::test]
    async fn test_sensor_data_unknown_device_is_noop() {
        let mut f = fixture();
        let frame = UplinkFrame {
            port: 7,
            payload_hex: "00".repeat(16),
            dev_eui: "0000000000000000".to_string(),
        };
        f.dispatcher.handle_frame(frame).await;
        assert!(f.readings_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_key_exchange_and_decrypt() {
        let mut f = fixture();

        // Device side: generate a pair and send it to the gateway.
        let device = KeyPair::generate().unwrap();
        let payload = format!("PUBKEY:{}", device.public_key_hex());
        f.dispatcher.handle_frame(pubkey_frame(DEV_EUI, &payload)).await;

        // Device side: derive the same secret from the gateway's public
        // key and encrypt a reading.
        let gateway_pub = hex::decode(f.rotation.public_key_hex().await).unwrap();
        let device_secret = derive_shared_secret(device.secret(), &gateway_pub).unwrap();
        let device_codec = SensorCrypto::new(&device_secret);
        let ciphertext = device_codec.encrypt(b"23.5C");

        let frame = UplinkFrame {
            port: 7,
            payload_hex: hex::encode(&ciphertext),
            dev_eui: DEV_EUI.to_string(),
        };
        f.dispatcher.handle_frame(frame).await;

        let reading = f.readings_rx.recv().await.unwrap();
        assert_eq!(reading.dev_eui, DEV_EUI);
        assert_eq!(reading.port, 7);
        assert_eq!(reading.payload, b"23.5C");
    }

    #[tokio::test]
    async fn test_broadcast_echo_and_ack_ports_do_not_touch_store() {
        let f = fixture();
        for port in [76u8, 10u8] {
            let frame = UplinkFrame {
                port,
                payload_hex: "cafe".to_string(),
                dev_eui: DEV_EUI.to_string(),
            };
            f.dispatcher.handle_frame(frame).await;
        }
        assert_eq!(f.store.len().await, 0);
    }
}
