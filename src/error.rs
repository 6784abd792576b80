//! Engine error taxonomy
//!
//! Every per-frame failure is local: the dispatcher logs it and moves on.
//! Only `RandomSource` (key generation cannot continue safely) and
//! `Transport` during a rotation broadcast are candidates for
//! process-level alerting.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Peer public key is malformed or not a point on P-256.
    #[error("invalid peer public key: {0}")]
    InvalidPeerKey(String),

    /// Inbound frame carried bad hex or non-UTF-8 text.
    #[error("frame decode error: {0}")]
    Decode(String),

    /// Ciphertext not block-aligned or otherwise undecryptable.
    #[error("decrypt error: {0}")]
    Decrypt(String),

    /// Sensor data arrived before any completed key exchange.
    /// Expected during provisioning, not a fault.
    #[error("no key established for device {0}")]
    NoKeyEstablished(String),

    /// A rotation was requested while another one is running.
    #[error("key rotation already in progress")]
    RotationInProgress,

    /// The OS random source failed. Fatal for key generation.
    #[error("secure random source failure: {0}")]
    RandomSource(String),

    /// The downlink transport rejected or dropped an enqueue.
    #[error("downlink transport error: {0}")]
    Transport(String),
}
