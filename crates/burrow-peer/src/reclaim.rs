use serde::Serialize;
use tracing::{info, warn};

use burrow_protocol::Message;

use crate::peer::Peer;

#[derive(Debug, Serialize)]
pub struct ReclaimOutcome {
    pub evicted: usize,
    pub capacity: u64,
    pub occupation: u64,
}

/// Operator-triggered reclaim: adopt the new byte budget and, when the
/// current occupation exceeds it, evict redundant chunks. Admission is
/// suspended for the duration of the eviction pass.
pub async fn reclaim_to(peer: &Peer, max_bytes: u64) -> ReclaimOutcome {
    info!(
        "Reclaim: capacity {} -> {} (occupation {})",
        peer.state.capacity(),
        max_bytes,
        peer.state.occupation()
    );
    peer.state.set_capacity(max_bytes);

    let mut evicted = 0;
    if peer.state.occupation() > max_bytes {
        peer.state.set_accepting(false);
        evicted = free_space(peer).await;
        peer.state.set_accepting(true);
    }
    peer.state.persist();

    ReclaimOutcome {
        evicted,
        capacity: peer.state.capacity(),
        occupation: peer.state.occupation(),
    }
}

/// Evict every saved chunk whose confirmed-peer count exceeds its declared
/// replication degree, announcing each eviction with a REMOVED notice.
///
/// Policy note: the pass drops all over-replicated chunks it finds, not
/// just enough to fall under the capacity target.
pub async fn free_space(peer: &Peer) -> usize {
    let victims = peer.state.evict_over_replicated();
    if victims.is_empty() {
        info!("Reclaim: no over-replicated chunks to evict");
        return 0;
    }

    for chunk in &victims {
        let notice = Message::removed(
            &peer.config.version,
            peer.config.peer_id,
            &chunk.file_id,
            chunk.chunk_no,
        );
        if let Err(e) = peer.control.send(&notice).await {
            warn!("REMOVED notice for {} failed: {:#}", chunk.chunk_id(), e);
        }
        if let Err(e) = peer.store.delete_chunk(&chunk.file_id, chunk.chunk_no).await {
            warn!("Evicting {} from disk failed: {:#}", chunk.chunk_id(), e);
        }
        info!(
            "Evicted {} ({} holders, degree {})",
            chunk.chunk_id(),
            chunk.peers.len(),
            chunk.replication_degree
        );
    }

    peer.state.refresh_occupation(&peer.store).await;
    peer.state.persist();
    victims.len()
}
