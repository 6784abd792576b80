//! Downlink transport contract
//!
//! The engine only enqueues; delivery, framing, and retries over the
//! physical network belong to the external transport. Commands travel
//! over an mpsc channel and the cloneable `DownlinkHandle` is the only
//! thing the rest of the engine sees.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::EngineError;

/// Where a downlink is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownlinkTarget {
    /// One device by DevEUI.
    Device(String),
    /// Broadcast to every device in the deployment.
    All,
}

impl std::fmt::Display for DownlinkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownlinkTarget::Device(eui) => write!(f, "{}", eui),
            DownlinkTarget::All => write!(f, "ALL"),
        }
    }
}

/// Commands the engine issues to the transport.
#[derive(Debug)]
pub enum DownlinkCommand {
    /// Queue a payload for transmission on a logical port.
    Enqueue {
        target: DownlinkTarget,
        port: u8,
        payload: Bytes,
    },
    /// Drop any pending queued downlinks for the target. Issued before
    /// a join-triggered rotation so stale key material is not delivered
    /// after the new broadcast.
    Flush { target: DownlinkTarget },
}

/// Cloneable sender half of the transport channel.
#[derive(Debug, Clone)]
pub struct DownlinkHandle {
    tx: mpsc::Sender<DownlinkCommand>,
}

impl DownlinkHandle {
    /// Create a handle plus the receiver the transport task consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DownlinkCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn enqueue(
        &self,
        target: DownlinkTarget,
        port: u8,
        payload: Bytes,
    ) -> Result<(), EngineError> {
        self.tx
            .send(DownlinkCommand::Enqueue {
                target,
                port,
                payload,
            })
            .await
            .map_err(|_| EngineError::Transport("downlink channel closed".to_string()))
    }

    pub async fn flush(&self, target: DownlinkTarget) -> Result<(), EngineError> {
        self.tx
            .send(DownlinkCommand::Flush { target })
            .await
            .map_err(|_| EngineError::Transport("downlink channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_delivers_command() {
        let (handle, mut rx) = DownlinkHandle::channel(8);
        handle
            .enqueue(DownlinkTarget::All, 76, Bytes::from_static(b"hi"))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            DownlinkCommand::Enqueue { target, port, payload } => {
                assert_eq!(target, DownlinkTarget::All);
                assert_eq!(port, 76);
                assert_eq!(payload.as_ref(), b"hi");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_channel_is_transport_error() {
        let (handle, rx) = DownlinkHandle::channel(1);
        drop(rx);
        let err = handle
            .enqueue(DownlinkTarget::All, 76, Bytes::from_static(b"hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
    }
}
