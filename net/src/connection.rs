//! Per-peer bookkeeping: handshake state, liveness timestamps, and the
//! buffered blocks a multi-range IBD fetch accumulates before committing.

use std::collections::HashMap;
use std::net::SocketAddr;

use shared::{Height, TimestampMs};
use tokio::sync::mpsc;

use emberchain_core::Block;

use crate::message::Envelope;

/// Owned by a connection's own read/write loop. `enqueue` is the one
/// operation other tasks may call — it only touches the channel, never this
/// struct's fields directly.
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub version: i32,
    pub has_handshake: bool,
    pub is_outbound: bool,
    pub last_message_in: TimestampMs,
    pub last_ping: TimestampMs,
    pub last_height: Height,
    pub stored_blocks: HashMap<Height, Block>,
    pub should_disconnect: bool,
    pub ibd_request_sent_at: Option<TimestampMs>,
    pub ibd_latest_response: Option<(Block, TimestampMs)>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl PeerConnection {
    #[must_use]
    pub fn new(addr: SocketAddr, is_outbound: bool, outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            addr,
            version: 0,
            has_handshake: false,
            is_outbound,
            last_message_in: 0,
            last_ping: 0,
            last_height: 0,
            stored_blocks: HashMap::new(),
            should_disconnect: false,
            ibd_request_sent_at: None,
            ibd_latest_response: None,
            outbound,
        }
    }

    /// Enqueues `envelope` for this peer's write loop. Safe to call from any
    /// task — sending a message must be thread-safe.
    pub fn enqueue(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            tracing::debug!(addr = %self.addr, "dropped outbound message, connection gone");
        }
    }

    pub fn buffer_block(&mut self, block: Block) {
        self.stored_blocks.insert(block.height, block);
    }

    pub fn clear_stored_blocks(&mut self) {
        self.stored_blocks.clear();
    }

    /// Union of buffered and newly-received blocks, de-duplicated by height
    /// (new wins) and sorted ascending.
    #[must_use]
    pub fn get_stored_and_new_blocks(&self, new: Vec<Block>) -> Vec<Block> {
        let mut merged = self.stored_blocks.clone();
        for b in new {
            merged.insert(b.height, b);
        }
        let mut out: Vec<Block> = merged.into_values().collect();
        out.sort_by(|a, b| a.height.cmp(&b.height));
        out
    }
}
