//! Segmented message reassembly and segmentation
//!
//! Downlink/uplink frames have a tiny payload budget, so anything larger
//! (a 130-hex-char public key, mostly) crosses the air as a sequence of
//! `SEG<index>/<total>:<chunk>` frames. Reassembly buffers live in a
//! process-wide table keyed by `(dev_eui, kind)` and persist across
//! dispatcher calls until the conversation completes or goes idle past
//! the timeout. Non-`SEG` payloads pass through unchanged.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Marker prefix for a segmented frame.
const SEG_PREFIX: &str = "SEG";

/// Which multi-frame conversation a buffer belongs to. Currently only
/// public key updates are segmented, but the table is keyed by kind so
/// an unfinished key transfer can never be polluted by another message
/// class from the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKind {
    PubKeyUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConversationKey {
    dev_eui: String,
    kind: ConversationKind,
}

/// Accumulation state for one open conversation.
#[derive(Debug)]
struct ReassemblyBuffer {
    total: u32,
    received: u32,
    payload: String,
    last_segment_at: Instant,
}

/// Outcome of feeding one payload into the table.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly {
    /// Message is complete; either a pass-through or the final segment.
    Complete(String),
    /// Segment accepted, more are expected.
    Incomplete { received: u32, total: u32 },
}

/// Process-wide table of open reassembly buffers.
///
/// A buffer is created lazily on the first `SEG` frame of a
/// conversation, consumed when `received == total`, and pruned once it
/// has been idle longer than `timeout` so partial transfers from dead
/// devices cannot accumulate.
#[derive(Debug)]
pub struct SegmentTable {
    buffers: Mutex<HashMap<ConversationKey, ReassemblyBuffer>>,
    timeout: Duration,
}

impl SegmentTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Feed one decoded payload for `(dev_eui, kind)`.
    ///
    /// Unparsable `SEG` headers drop the frame (logged); the buffer, if
    /// any, is left as it was so a retransmission can still complete it.
    pub async fn feed(&self, dev_eui: &str, kind: ConversationKind, payload: &str) -> Option<Reassembly> {
        if !payload.starts_with(SEG_PREFIX) {
            debug!(dev_eui, "non-segmented payload, passing through");
            return Some(Reassembly::Complete(payload.to_string()));
        }

        let (index, total, chunk) = match parse_segment(payload) {
            Some(parts) => parts,
            None => {
                warn!(dev_eui, payload, "unparsable segment header, dropping frame");
                return None;
            }
        };

        let key = ConversationKey {
            dev_eui: dev_eui.to_string(),
            kind,
        };

        let mut buffers = self.buffers.lock().await;
        self.prune_expired(&mut buffers);

        let (complete, received, total) = {
            let buffer = buffers.entry(key.clone()).or_insert_with(|| {
                debug!(dev_eui, total, "opening reassembly buffer");
                ReassemblyBuffer {
                    total,
                    received: 0,
                    payload: String::new(),
                    last_segment_at: Instant::now(),
                }
            });

            if buffer.total != total {
                // The sender restarted the transfer with a different
                // segment count; the old partial payload can never
                // complete.
                warn!(
                    dev_eui,
                    old_total = buffer.total,
                    new_total = total,
                    "segment total changed mid-conversation, restarting buffer"
                );
                buffer.total = total;
                buffer.received = 0;
                buffer.payload.clear();
            }

            // Minimum contract is in-order concatenation; the index is
            // used for logging and progress only.
            buffer.payload.push_str(chunk);
            buffer.received += 1;
            buffer.last_segment_at = Instant::now();
            info!(dev_eui, index, total, "received segment");

            (buffer.received >= buffer.total, buffer.received, buffer.total)
        };

        if complete {
            let full = buffers.remove(&key).map(|b| b.payload);
            info!(dev_eui, "reassembly complete");
            return full.map(Reassembly::Complete);
        }

        Some(Reassembly::Incomplete { received, total })
    }

    /// Number of open (incomplete) conversations.
    pub async fn open_conversations(&self) -> usize {
        self.buffers.lock().await.len()
    }

    fn prune_expired(&self, buffers: &mut HashMap<ConversationKey, ReassemblyBuffer>) {
        let timeout = self.timeout;
        buffers.retain(|key, buffer| {
            let keep = buffer.last_segment_at.elapsed() < timeout;
            if !keep {
                warn!(
                    dev_eui = %key.dev_eui,
                    received = buffer.received,
                    total = buffer.total,
                    "discarding stale reassembly buffer"
                );
            }
            keep
        });
    }
}

/// Parse `SEG<index>/<total>:<chunk>`. Returns `None` for anything that
/// does not match the grammar, including `total == 0`.
fn parse_segment(payload: &str) -> Option<(u32, u32, &str)> {
    let rest = payload.strip_prefix(SEG_PREFIX)?;
    let (header, chunk) = rest.split_once(':')?;
    let (index_str, total_str) = header.split_once('/')?;
    let index: u32 = index_str.parse().ok()?;
    let total: u32 = total_str.parse().ok()?;
    if total == 0 {
        return None;
    }
    Some((index, total, chunk))
}

/// Split a message into `SEG` frames when it exceeds the per-frame
/// budget; a message that fits is returned as a single plain frame.
///
/// Each produced frame, header included, fits within `budget` bytes.
/// This is the exact inverse of the reassembly grammar above.
pub fn segment_message(message: &str, budget: usize) -> Vec<String> {
    if message.len() <= budget {
        return vec![message.to_string()];
    }

    // Reserve room for the largest header this message could need.
    let header_room = format!("{}999/999:", SEG_PREFIX).len();
    let chunk_len = budget.saturating_sub(header_room).max(1);
    let chunks: Vec<&str> = message
        .as_bytes()
        .chunks(chunk_len)
        // Payloads here are ASCII (hex and fixed prefixes), so byte
        // chunking never splits a UTF-8 sequence.
        .map(|c| std::str::from_utf8(c).unwrap_or(""))
        .collect();

    let total = chunks.len();
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| format!("{}{}/{}:{}", SEG_PREFIX, i + 1, total, chunk))
        .collect()
}
