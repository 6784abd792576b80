//! Inbound frame ingestion
//!
//! One text line per UDP datagram, delivered by the message-bus bridge
//! sitting in front of the network server:
//!   `PORT:<port> RX:<hex> DevEUI:<eui>`  — uplink frame
//!   `JOIN DevEUI:<eui>`                  — device join notification
//!
//! The loop never terminates on bad input; unparsable datagrams are
//! logged and dropped.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::dispatch::{FrameDispatcher, UplinkFrame};
use crate::rotation::RotationOrchestrator;

pub struct IngestServer {
    socket: UdpSocket,
}

impl IngestServer {
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("ingest server listening on {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(
        self,
        dispatcher: Arc<FrameDispatcher>,
        rotation: Arc<RotationOrchestrator>,
    ) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 2048];

        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            debug!("received {} bytes from {}", len, src);

            let line = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s.trim(),
                Err(e) => {
                    warn!(%src, "dropping non-UTF-8 datagram: {}", e);
                    continue;
                }
            };

            if let Some(rest) = line.strip_prefix("JOIN") {
                match parse_join(rest) {
                    Some(dev_eui) => Arc::clone(&rotation).on_device_join(&dev_eui).await,
                    None => warn!(%src, line, "dropping malformed join notification"),
                }
                continue;
            }

            match UplinkFrame::parse(line) {
                Ok(frame) => dispatcher.handle_frame(frame).await,
                Err(e) => {
                    warn!(%src, error = %e, "dropping unparsable frame");
                }
            }
        }
    }
}

fn parse_join(rest: &str) -> Option<String> {
    rest.trim()
        .strip_prefix("DevEUI:")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
