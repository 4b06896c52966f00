//! Per-message-type reactions, handshake enforcement, and chain-lock
//! discipline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use shared::Height;
use tokio::sync::Mutex;

use emberchain_core::{AddBlocksResult, AddPendingResult, ChainEngine, PendingTransaction};

use crate::connection::PeerConnection;
use crate::ibd::{IbdController, IbdPhase};
use crate::message::{
    now_ms, BlocksPayload, Envelope, GetBlocksPayload, LatestBlockPayload, MempoolPayload,
    VersionPayload, MSG_BLOCKS, MSG_GET_BLOCKS, MSG_GET_LATEST_BLOCK, MSG_GET_MEMPOOL,
    MSG_LATEST_BLOCK, MSG_MEMPOOL, MSG_PING, MSG_PONG, MSG_VERSION, MSG_VERSION_ACK,
};
use crate::params::{CHAIN_LOCK_TIMEOUT, MAX_PENDING_TO_SEND};

pub type PeerTable = Arc<Mutex<HashMap<SocketAddr, PeerConnection>>>;

/// Acquires the aggregate chain lock with a bounded wait. On timeout, logs
/// and returns `None` — callers must not retry or cascade.
pub async fn with_chain_lock<F, T>(chain: &Arc<Mutex<ChainEngine>>, f: F) -> Option<T>
where
    F: FnOnce(&mut ChainEngine) -> T,
{
    match tokio::time::timeout(CHAIN_LOCK_TIMEOUT, chain.lock()).await {
        Ok(mut guard) => Some(f(&mut guard)),
        Err(_) => {
            tracing::warn!("chain lock acquisition timed out, dropping request");
            None
        }
    }
}

pub struct Dispatcher {
    pub node_version: i32,
    pub node_nonce: shared::Hash256,
    pub chain: Arc<Mutex<ChainEngine>>,
    pub peers: PeerTable,
    pub ibd: Arc<Mutex<IbdController>>,
}

impl Dispatcher {
    /// Processes one inbound envelope from `addr`. Returns `false` if the
    /// peer should be disconnected.
    pub async fn handle(&self, addr: SocketAddr, envelope: Envelope) -> bool {
        if !envelope.checksum_is_valid() {
            tracing::debug!(%addr, "dropping message with bad checksum");
            return true;
        }

        let mut peers = self.peers.lock().await;
        let Some(peer) = peers.get_mut(&addr) else {
            return true;
        };
        peer.last_message_in = now_ms();

        if envelope.msg_type == MSG_VERSION {
            return self.handle_version(peer, &envelope);
        }
        if peer.version == 0 {
            tracing::debug!(%addr, "non-Version message before handshake version");
            return false;
        }
        if envelope.msg_type == MSG_VERSION_ACK {
            return self.handle_version_ack(peer);
        }
        if !peer.has_handshake {
            tracing::debug!(%addr, "message before handshake completed");
            return false;
        }

        drop(peers);

        match envelope.msg_type {
            MSG_GET_LATEST_BLOCK => self.handle_get_latest_block(addr).await,
            MSG_LATEST_BLOCK => self.handle_latest_block(addr, &envelope).await,
            MSG_GET_BLOCKS => self.handle_get_blocks(addr, &envelope).await,
            MSG_BLOCKS => self.handle_blocks(addr, &envelope).await,
            MSG_GET_MEMPOOL => self.handle_get_mempool(addr).await,
            MSG_MEMPOOL => self.handle_mempool(addr, &envelope).await,
            MSG_PING => self.handle_ping(addr).await,
            MSG_PONG => self.handle_pong(addr).await,
            _ => true,
        }
    }

    fn handle_version(&self, peer: &mut PeerConnection, envelope: &Envelope) -> bool {
        if peer.version > 0 {
            return false; // duplicate Version after handshake
        }
        let Ok(payload) = envelope.decode_payload::<VersionPayload>() else {
            return false;
        };
        if payload.nonce == self.node_nonce {
            return false; // self-loop
        }
        if payload.ver < self.node_version {
            return false;
        }
        peer.version = payload.ver;
        peer.last_height = payload.height;

        if peer.is_outbound {
            peer.enqueue(Envelope::encode_payload(
                MSG_VERSION,
                &VersionPayload {
                    ver: self.node_version,
                    height: 0,
                    nonce: self.node_nonce,
                },
            ).expect("serializable payload"));
        } else {
            peer.enqueue(Envelope::new(MSG_VERSION_ACK, "{}".to_string()));
        }
        true
    }

    fn handle_version_ack(&self, peer: &mut PeerConnection) -> bool {
        if !peer.has_handshake {
            peer.has_handshake = true;
            peer.enqueue(Envelope::new(MSG_VERSION_ACK, "{}".to_string()));
            if !peer.is_outbound {
                peer.enqueue(Envelope::new(MSG_GET_LATEST_BLOCK, "{}".to_string()));
            }
        }
        true
    }

    async fn handle_get_latest_block(&self, addr: SocketAddr) -> bool {
        if self.ibd.lock().await.phase() != IbdPhase::Succeeded {
            return true;
        }
        let Some(latest) = with_chain_lock(&self.chain, |c| c.latest()).await else {
            return true;
        };
        self.send_to(addr, Envelope::encode_payload(MSG_LATEST_BLOCK, &LatestBlockPayload { block: latest }).unwrap())
            .await;
        true
    }

    async fn handle_latest_block(&self, addr: SocketAddr, envelope: &Envelope) -> bool {
        let Ok(payload) = envelope.decode_payload::<LatestBlockPayload>() else {
            return false;
        };

        let mut ibd = self.ibd.lock().await;
        if ibd.phase() == IbdPhase::Preparing {
            ibd.record_latest_block(addr, payload.block, now_ms());
            let ready = ibd.all_responded();
            drop(ibd);
            if ready {
                self.ibd.lock().await.enter_running();
                self.advance_running().await;
            }
            return true;
        }
        drop(ibd);

        let merged = {
            let mut peers = self.peers.lock().await;
            let Some(peer) = peers.get_mut(&addr) else { return true };
            peer.get_stored_and_new_blocks(vec![payload.block])
        };
        let peer_height = merged.last().map(|b| b.height).unwrap_or(0);

        let result = with_chain_lock(&self.chain, |c| {
            c.add_blocks_from_peer(merged, peer_height, now_ms())
        })
        .await;

        match result {
            Some(Ok(AddBlocksResult::AddedSingleBlock)) | Some(Ok(AddBlocksResult::AddedMultipleBlocks)) | Some(Ok(AddBlocksResult::ReplacedMultipleBlocks)) => {
                self.clear_stored(addr).await;
                self.broadcast_latest(Some(addr)).await;
                true
            }
            Some(Ok(AddBlocksResult::NothingChanged)) => true,
            Some(Ok(AddBlocksResult::NeedMore { from_height })) | Some(Ok(AddBlocksResult::NeedMoreShouldStore { from_height })) => {
                self.request_blocks(addr, from_height).await;
                true
            }
            _ => false,
        }
    }

    async fn handle_get_blocks(&self, addr: SocketAddr, envelope: &Envelope) -> bool {
        if self.ibd.lock().await.phase() != IbdPhase::Succeeded {
            return true;
        }
        let Ok(payload) = envelope.decode_payload::<GetBlocksPayload>() else {
            return false;
        };
        let max = payload.max_count.clamp(1, crate::params::MAX_GET_BLOCKS);

        let blocks = with_chain_lock(&self.chain, |c| {
            let mut out = Vec::new();
            let mut h = payload.start_index;
            while out.len() < max as usize && h <= c.height() {
                if let Some(b) = c.get_by_height(h) {
                    out.push(b);
                }
                h += 1;
            }
            out
        })
        .await
        .unwrap_or_default();

        self.send_to(addr, Envelope::encode_payload(MSG_BLOCKS, &BlocksPayload { blocks }).unwrap())
            .await;
        true
    }

    async fn handle_blocks(&self, addr: SocketAddr, envelope: &Envelope) -> bool {
        let ibd_running = self.ibd.lock().await.phase() == IbdPhase::Running;
        if ibd_running {
            let is_selected = self.ibd.lock().await.current_peer() == Some(addr);
            if !is_selected {
                return true; // silently ignore
            }
        }

        let Ok(payload) = envelope.decode_payload::<BlocksPayload>() else {
            return false;
        };

        let merged = {
            let mut peers = self.peers.lock().await;
            let Some(peer) = peers.get_mut(&addr) else { return true };
            peer.get_stored_and_new_blocks(payload.blocks)
        };
        let peer_height = merged.last().map(|b| b.height).unwrap_or(0);

        let result = with_chain_lock(&self.chain, |c| {
            c.add_blocks_from_peer(merged, peer_height, now_ms())
        })
        .await;

        match result {
            Some(Ok(AddBlocksResult::AddedSingleBlock))
            | Some(Ok(AddBlocksResult::AddedMultipleBlocks))
            | Some(Ok(AddBlocksResult::ReplacedMultipleBlocks)) => {
                self.clear_stored(addr).await;
                if ibd_running {
                    self.advance_running().await;
                } else {
                    self.broadcast_latest(Some(addr)).await;
                }
                true
            }
            Some(Ok(AddBlocksResult::NeedMore { from_height }))
            | Some(Ok(AddBlocksResult::NeedMoreShouldStore { from_height })) => {
                self.request_blocks(addr, from_height).await;
                true
            }
            _ => {
                if ibd_running {
                    self.ibd.lock().await.drop_peer(&addr);
                    self.advance_to_next_ibd_peer().await;
                }
                false
            }
        }
    }

    async fn handle_get_mempool(&self, addr: SocketAddr) -> bool {
        if self.ibd.lock().await.phase() != IbdPhase::Succeeded {
            return true;
        }
        let txs = with_chain_lock(&self.chain, |c| c.pending_for_relay(MAX_PENDING_TO_SEND))
            .await
            .unwrap_or_default();
        self.send_to(
            addr,
            Envelope::encode_payload(MSG_MEMPOOL, &MempoolPayload { rel: false, txs }).unwrap(),
        )
        .await;
        true
    }

    async fn handle_mempool(&self, addr: SocketAddr, envelope: &Envelope) -> bool {
        if self.ibd.lock().await.phase() != IbdPhase::Succeeded {
            return true;
        }
        let Ok(payload) = envelope.decode_payload::<MempoolPayload>() else {
            return false;
        };
        let accepted = payload.txs;
        let txs: Vec<_> = accepted.iter().map(|p| p.tx.clone()).collect();
        let result = with_chain_lock(&self.chain, |c| c.add_pending(txs, now_ms())).await;

        match result {
            Some(AddPendingResult::Added) => {
                self.relay_mempool_except(addr, accepted).await;
                true
            }
            Some(AddPendingResult::HardRejected) => false,
            _ => true,
        }
    }

    async fn handle_ping(&self, addr: SocketAddr) -> bool {
        self.send_to(addr, Envelope::new(MSG_PONG, "{}".to_string())).await;
        true
    }

    async fn handle_pong(&self, addr: SocketAddr) -> bool {
        let mut peers = self.peers.lock().await;
        if let Some(peer) = peers.get_mut(&addr) {
            peer.last_ping = now_ms();
        }
        true
    }

    async fn send_to(&self, addr: SocketAddr, envelope: Envelope) {
        let peers = self.peers.lock().await;
        if let Some(peer) = peers.get(&addr) {
            peer.enqueue(envelope);
        }
    }

    async fn clear_stored(&self, addr: SocketAddr) {
        let mut peers = self.peers.lock().await;
        if let Some(peer) = peers.get_mut(&addr) {
            peer.clear_stored_blocks();
        }
    }

    async fn request_blocks(&self, addr: SocketAddr, from_height: Height) {
        self.send_to(
            addr,
            Envelope::encode_payload(
                MSG_GET_BLOCKS,
                &GetBlocksPayload {
                    start_index: from_height,
                    max_count: crate::params::MAX_GET_BLOCKS,
                },
            )
            .unwrap(),
        )
        .await;
    }

    async fn broadcast_latest(&self, except: Option<SocketAddr>) {
        let Some(latest) = with_chain_lock(&self.chain, |c| c.latest()).await else {
            return;
        };
        let envelope = Envelope::encode_payload(MSG_LATEST_BLOCK, &LatestBlockPayload { block: latest }).unwrap();
        let peers = self.peers.lock().await;
        for (addr, peer) in peers.iter() {
            if Some(*addr) != except {
                peer.enqueue(envelope.clone());
            }
        }
    }

    /// Broadcasts the current latest block to every connected peer, with no
    /// originating peer to exclude. Called after a locally mined block is
    /// committed.
    pub async fn broadcast_mined_block(&self) {
        self.broadcast_latest(None).await;
    }

    async fn relay_mempool_except(&self, except: SocketAddr, txs: Vec<PendingTransaction>) {
        let envelope = Envelope::encode_payload(MSG_MEMPOOL, &MempoolPayload { rel: true, txs }).unwrap();
        let peers = self.peers.lock().await;
        for (addr, peer) in peers.iter() {
            if *addr != except {
                peer.enqueue(envelope.clone());
            }
        }
    }

    /// Drives the `Running`-phase state machine for the current peer.
    async fn advance_running(&self) {
        loop {
            let Some(current) = self.ibd.lock().await.current_peer() else {
                self.ibd.lock().await.mark_failed();
                return;
            };

            let local_height = with_chain_lock(&self.chain, |c| c.height()).await.unwrap_or(0);
            let peer_height = {
                let peers = self.peers.lock().await;
                peers.get(&current).map(|p| p.last_height).unwrap_or(0)
            };

            if peer_height <= local_height {
                self.broadcast_latest(Some(current)).await;
                self.ibd.lock().await.mark_succeeded();
                return;
            }
            if peer_height == local_height + 1 {
                self.request_blocks(current, local_height + 1).await;
                return;
            }

            let mut ibd = self.ibd.lock().await;
            if ibd.ranges_exhausted() {
                ibd.plan_ranges(local_height, peer_height);
            } else {
                ibd.advance_range();
            }
            let range = ibd.current_range();
            drop(ibd);

            let Some((start, max)) = range else {
                self.advance_to_next_ibd_peer().await;
                continue;
            };
            self.send_to(
                current,
                Envelope::encode_payload(MSG_GET_BLOCKS, &GetBlocksPayload { start_index: start, max_count: max }).unwrap(),
            )
            .await;
            return;
        }
    }

    async fn advance_to_next_ibd_peer(&self) {
        let mut ibd = self.ibd.lock().await;
        ibd.advance_peer();
        if !ibd.has_next_peer() {
            ibd.mark_failed();
            return;
        }
        drop(ibd);
        Box::pin(self.advance_running()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::MAX_GET_BLOCKS;
    use emberchain_core::genesis_block;

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn other_addr() -> SocketAddr {
        "127.0.0.1:9001".parse().unwrap()
    }

    async fn dispatcher_with_fresh_chain() -> (Dispatcher, tokio::sync::mpsc::UnboundedReceiver<Envelope>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = Arc::new(Mutex::new(ChainEngine::load(dir.path()).expect("fresh engine loads")));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut table = HashMap::new();
        table.insert(peer_addr(), PeerConnection::new(peer_addr(), true, tx));
        let dispatcher = Dispatcher {
            node_version: 1,
            node_nonce: shared::Hash256::zero(),
            chain,
            peers: Arc::new(Mutex::new(table)),
            ibd: Arc::new(Mutex::new(IbdController::new())),
        };
        (dispatcher, rx)
    }

    fn get_blocks_range(envelope: &Envelope) -> (Height, u32) {
        let payload: GetBlocksPayload = envelope.decode_payload().expect("GetBlocks payload decodes");
        (payload.start_index, payload.max_count)
    }

    /// A peer far ahead of a fresh chain should be walked across its planned
    /// ranges one `GetBlocks` at a time, only replanning once the queue is
    /// exhausted — not recomputing the whole range list on every response.
    #[tokio::test]
    async fn advance_running_walks_planned_ranges_before_replanning() {
        let (dispatcher, mut rx) = dispatcher_with_fresh_chain().await;

        let mut peer_tip = genesis_block();
        peer_tip.height = 70;
        {
            let mut ibd = dispatcher.ibd.lock().await;
            ibd.begin_preparing(&[peer_addr()], 0);
            ibd.record_latest_block(peer_addr(), peer_tip, 0);
            ibd.enter_running();
        }
        dispatcher.peers.lock().await.get_mut(&peer_addr()).unwrap().last_height = 70;

        dispatcher.advance_running().await;
        assert_eq!(get_blocks_range(&rx.recv().await.unwrap()), (1, MAX_GET_BLOCKS));

        dispatcher.advance_running().await;
        assert_eq!(get_blocks_range(&rx.recv().await.unwrap()), (33, MAX_GET_BLOCKS));

        dispatcher.advance_running().await;
        assert_eq!(get_blocks_range(&rx.recv().await.unwrap()), (65, MAX_GET_BLOCKS));

        // The queue is now exhausted and there is only one ranked peer, so
        // the next call falls through to `advance_to_next_ibd_peer` and the
        // whole download fails rather than looping forever.
        dispatcher.advance_running().await;
        assert_eq!(dispatcher.ibd.lock().await.phase(), IbdPhase::Failed);
    }

    /// Once the local height reaches the peer's, `advance_running` stops
    /// requesting ranges, marks the download succeeded, and broadcasts the
    /// latest block to every other peer (excluding the one it came from).
    #[tokio::test]
    async fn advance_running_succeeds_once_peer_is_caught_up() {
        let (dispatcher, _rx) = dispatcher_with_fresh_chain().await;
        let (other_tx, mut other_rx) = tokio::sync::mpsc::unbounded_channel();
        dispatcher
            .peers
            .lock()
            .await
            .insert(other_addr(), PeerConnection::new(other_addr(), true, other_tx));

        let mut peer_tip = genesis_block();
        peer_tip.height = 0;
        {
            let mut ibd = dispatcher.ibd.lock().await;
            ibd.begin_preparing(&[peer_addr()], 0);
            ibd.record_latest_block(peer_addr(), peer_tip, 0);
            ibd.enter_running();
        }
        dispatcher.peers.lock().await.get_mut(&peer_addr()).unwrap().last_height = 0;

        dispatcher.advance_running().await;
        assert_eq!(dispatcher.ibd.lock().await.phase(), IbdPhase::Succeeded);
        // Broadcasts to the other connected peer, but not back to the one
        // the caught-up check was run against.
        assert!(other_rx.recv().await.is_some());
    }
}

