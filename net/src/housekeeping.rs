//! The house-keeping sweep: a lock over the peer list distinct from the
//! chain lock, run on its own cadence to close stale connections and keep
//! live ones pinged.

use tokio_util::sync::CancellationToken;

use crate::dispatcher::PeerTable;
use crate::message::{now_ms, Envelope, MSG_PING};
use crate::params::{HOUSEKEEPING_INTERVAL, HOUSEKEEPING_WARMUP, OUTBOUND_SILENCE_TIMEOUT, PING_INTERVAL};

/// Runs until `cancel` fires. Intended to be spawned once per node.
pub async fn run(peers: PeerTable, cancel: CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(HOUSEKEEPING_WARMUP) => {}
        _ = cancel.cancelled() => return,
    }

    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => sweep(&peers).await,
            _ = cancel.cancelled() => return,
        }
    }
}

async fn sweep(peers: &PeerTable) {
    let now = now_ms();
    let mut table = peers.lock().await;
    let mut stale = Vec::new();

    for (addr, peer) in table.iter_mut() {
        let silent_for = now.saturating_sub(peer.last_message_in);
        if silent_for > OUTBOUND_SILENCE_TIMEOUT.as_millis() as i64 {
            peer.should_disconnect = true;
            stale.push(*addr);
            continue;
        }
        if now.saturating_sub(peer.last_ping) > PING_INTERVAL.as_millis() as i64 {
            peer.enqueue(Envelope::new(MSG_PING, "{}".to_string()));
            peer.last_ping = now;
        }
    }

    for addr in &stale {
        tracing::info!(%addr, "house-keeping sweep closing silent peer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    use crate::connection::PeerConnection;

    #[tokio::test]
    async fn sweep_marks_silent_peer_for_disconnect() {
        let addr: SocketAddr = "127.0.0.1:9" .parse().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut conn = PeerConnection::new(addr, true, tx);
        conn.last_message_in = 0;
        conn.last_ping = 0;

        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
        peers.lock().await.insert(addr, conn);

        sweep(&peers).await;
        let table = peers.lock().await;
        assert!(table.get(&addr).unwrap().should_disconnect);
    }
}
