//! Gateway key rotation orchestration
//!
//! Owns the gateway's ECDH key pair and the rotation state. A rotation
//! regenerates the pair, broadcasts the new public key to all devices
//! (segmented when it exceeds the per-frame budget), and enqueues an
//! acknowledgment frame. Three triggers funnel into the same guarded
//! `rotate` entry point: the elapsed-time check on every inbound frame,
//! a device join (after a settle delay), and the operator command.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{PortsConfig, RotationConfig};
use crate::crypto::{derive_shared_secret, KeyPair, SharedSecret};
use crate::downlink::{DownlinkHandle, DownlinkTarget};
use crate::error::EngineError;
use crate::keystore::DeviceKeyStore;
use crate::segment::segment_message;

/// What triggered a rotation, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// Elapsed time since the last rotation exceeded the interval.
    Scheduled,
    /// A device joined the network.
    DeviceJoin,
    /// Explicit operator command.
    Manual,
}

impl std::fmt::Display for RotationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationReason::Scheduled => write!(f, "scheduled"),
            RotationReason::DeviceJoin => write!(f, "device-join"),
            RotationReason::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug)]
struct RotationState {
    last_rotation: Instant,
    in_progress: bool,
}

pub struct RotationOrchestrator {
    keys: RwLock<KeyPair>,
    state: Mutex<RotationState>,
    downlink: DownlinkHandle,
    store: Arc<DeviceKeyStore>,
    ports: PortsConfig,
    rotation: RotationConfig,
    max_frame_len: usize,
}

impl RotationOrchestrator {
    /// Generate the initial gateway key pair and set the rotation epoch.
    /// The initial key is not broadcast; the first trigger does that.
    pub fn new(
        downlink: DownlinkHandle,
        store: Arc<DeviceKeyStore>,
        ports: PortsConfig,
        rotation: RotationConfig,
        max_frame_len: usize,
    ) -> Result<Self, EngineError> {
        let keys = KeyPair::generate()?;
        info!(public_key = %keys.public_key_hex(), "generated initial gateway key pair");
        Ok(Self {
            keys: RwLock::new(keys),
            state: Mutex::new(RotationState {
                last_rotation: Instant::now(),
                in_progress: false,
            }),
            downlink,
            store,
            ports,
            rotation,
            max_frame_len,
        })
    }

    /// Run one full rotation: generate, broadcast, ack, timestamp.
    ///
    /// Policy for overlapping triggers: reject. A second caller gets
    /// `RotationInProgress` and the running rotation finishes untouched.
    pub async fn rotate(&self, reason: RotationReason) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().await;
            if state.in_progress {
                debug!(%reason, "rotation already in progress, rejecting trigger");
                return Err(EngineError::RotationInProgress);
            }
            state.in_progress = true;
        }

        info!(%reason, "starting key rotation");
        let result = self.run_rotation().await;

        let mut state = self.state.lock().await;
        state.in_progress = false;
        match &result {
            Ok(()) => {
                state.last_rotation = Instant::now();
                info!(%reason, "key rotation complete");
            }
            Err(e) => {
                // Failing to distribute the new key is alert-worthy: the
                // devices keep encrypting against the old one.
                error!(%reason, error = %e, "key rotation failed");
            }
        }
        result
    }

    async fn run_rotation(&self) -> Result<(), EngineError> {
        let pair = KeyPair::generate()?;
        let pubkey_hex = pair.public_key_hex();

        // Single swap; the dispatcher derives against the new key from
        // here on. Devices still holding the old public key will fail to
        // agree until they process the broadcast below.
        *self.keys.write().await = pair;

        let message = format!("UA_PUBKEY:{}", pubkey_hex);
        let frames = segment_message(&message, self.max_frame_len);
        let segmented = frames.len() > 1;
        info!(
            frames = frames.len(),
            segmented, "broadcasting new gateway public key"
        );

        // Enqueues happen with no lock held; the transport may block.
        for frame in frames {
            self.downlink
                .enqueue(
                    DownlinkTarget::All,
                    self.ports.gateway_pubkey,
                    Bytes::from(frame.into_bytes()),
                )
                .await?;
        }

        self.downlink
            .enqueue(
                DownlinkTarget::All,
                self.ports.rotation_ack,
                Bytes::from_static(b"KEYROTATION:OK"),
            )
            .await?;

        Ok(())
    }

    /// Scheduled-trigger check, called on every inbound frame. Rotation
    /// latency past the threshold therefore depends on traffic volume.
    pub async fn tick(&self) {
        let due = {
            let state = self.state.lock().await;
            !state.in_progress && state.last_rotation.elapsed() >= self.rotation.interval()
        };
        if !due {
            return;
        }

        match self.rotate(RotationReason::Scheduled).await {
            Ok(()) | Err(EngineError::RotationInProgress) => {}
            Err(e) => warn!(error = %e, "scheduled rotation failed"),
        }
    }

    /// Handle a device-join notification.
    ///
    /// Pending downlink queues are flushed for the joining device and
    /// every other known device (matching the deployed controller, which
    /// flushes the whole fleet on each join), then the rotation itself
    /// runs on a spawned task after the settle delay so the ingestion
    /// path that delivered the join is never stalled.
    pub async fn on_device_join(self: Arc<Self>, dev_eui: &str) {
        info!(dev_eui, "device join notification");

        if let Err(e) = self
            .downlink
            .flush(DownlinkTarget::Device(dev_eui.to_string()))
            .await
        {
            warn!(dev_eui, error = %e, "failed to flush joining device queue");
        }
        for known in self.store.device_ids().await {
            if known == dev_eui {
                continue;
            }
            if let Err(e) = self.downlink.flush(DownlinkTarget::Device(known.clone())).await {
                warn!(dev_eui = %known, error = %e, "failed to flush device queue");
            }
        }

        let settle = self.rotation.join_settle();
        let orchestrator = self;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            match orchestrator.rotate(RotationReason::DeviceJoin).await {
                Ok(()) | Err(EngineError::RotationInProgress) => {}
                Err(e) => warn!(error = %e, "join-triggered rotation failed"),
            }
        });
    }

    /// ECDH against the current gateway private key. Used by the
    /// dispatcher when a device sends a new public key.
    pub async fn derive_for_peer(&self, peer_public: &[u8]) -> Result<SharedSecret, EngineError> {
        let keys = self.keys.read().await;
        derive_shared_secret(keys.secret(), peer_public)
    }

    /// Current gateway public key, hex encoded.
    pub async fn public_key_hex(&self) -> String {
        self.keys.read().await.public_key_hex()
    }
}
