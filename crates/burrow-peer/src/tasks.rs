use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use burrow_protocol::{Message, MessageKind};

use crate::peer::Peer;
use crate::state::Admission;

/// Upper bound of the randomized pre-reply delay that desynchronizes
/// simultaneous repliers on the shared channels.
const MAX_REPLY_JITTER_MS: u64 = 400;

fn reply_jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..=MAX_REPLY_JITTER_MS))
}

/// Drain the inbound queue fed by the three receive loops; each message
/// runs its handler as its own task, bounded by the inbound permit pool so
/// one slow disk-bound handler cannot stall the receive loops.
pub async fn run_dispatcher(peer: Arc<Peer>, mut inbound: mpsc::Receiver<Message>) {
    while let Some(msg) = inbound.recv().await {
        if msg.sender == peer.config.peer_id {
            // our own multicast echo
            continue;
        }
        let Ok(permit) = peer.inbound_permits.clone().acquire_owned().await else {
            return;
        };
        let peer = peer.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let kind = msg.kind;
            let id = msg.chunk_id();
            if let Err(e) = handle(peer, msg).await {
                // failures stay contained at the task boundary
                warn!("{} handler for {} failed: {:#}", kind, id, e);
            }
        });
    }
}

async fn handle(peer: Arc<Peer>, msg: Message) -> Result<()> {
    debug!(
        "inbound {} from peer {} for {}",
        msg.kind,
        msg.sender,
        msg.chunk_id()
    );
    match msg.kind {
        MessageKind::PutChunk => handle_putchunk(peer, msg).await,
        MessageKind::Stored => handle_stored(peer, msg),
        MessageKind::GetChunk => handle_getchunk(peer, msg),
        MessageKind::Chunk => handle_chunk(peer, msg),
        MessageKind::Delete => handle_delete(peer, msg).await,
        MessageKind::Removed => handle_removed(peer, msg),
        MessageKind::Debug => {
            debug!(
                "DEBUG from peer {}: {}",
                msg.sender,
                String::from_utf8_lossy(&msg.body)
            );
            Ok(())
        }
    }
}

/// Storer side of the backup protocol.
async fn handle_putchunk(peer: Arc<Peer>, msg: Message) -> Result<()> {
    let size = msg.body.len() as u64;
    match peer.state.try_admit(
        &msg.file_id,
        msg.chunk_no,
        msg.replication_degree,
        size,
    ) {
        Admission::Admitted => {
            if let Err(e) = peer
                .store
                .write_chunk(&msg.file_id, msg.chunk_no, &msg.body)
                .await
            {
                peer.state.rollback_admission(&msg.chunk_id(), size);
                return Err(e).with_context(|| format!("storing chunk {}", msg.chunk_id()));
            }
            peer.state.refresh_occupation(&peer.store).await;
            peer.state.persist();
            info!("Stored chunk {} ({} bytes)", msg.chunk_id(), size);
            schedule_stored_reply(&peer, msg.file_id, msg.chunk_no);
        }
        Admission::Duplicate => {
            // expected under UDP redelivery; confirm again, do not re-store
            peer.state.persist();
            schedule_stored_reply(&peer, msg.file_id, msg.chunk_no);
        }
        Admission::CapacityExceeded => {
            // the protocol has no negative acknowledgment; staying silent
            // is the signal
            debug!("No space for chunk {} ({} bytes)", msg.chunk_id(), size);
        }
        Admission::OwnChunk | Admission::DeletedFile | Admission::NotAccepting => {}
    }
    Ok(())
}

/// Schedule the jittered STORED reply as its own sleeping task; it never
/// occupies an inbound pool permit.
fn schedule_stored_reply(peer: &Arc<Peer>, file_id: String, chunk_no: u32) {
    let peer = peer.clone();
    let delay = reply_jitter();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let reply = Message::stored(&peer.config.version, peer.config.peer_id, &file_id, chunk_no);
        if let Err(e) = peer.control.send(&reply).await {
            warn!("STORED reply for {} failed: {:#}", reply.chunk_id(), e);
        }
    });
}

fn handle_stored(peer: Arc<Peer>, msg: Message) -> Result<()> {
    if peer.state.record_confirmation(&msg.chunk_id(), msg.sender) {
        debug!("Peer {} confirmed {}", msg.sender, msg.chunk_id());
        peer.state.persist();
    }
    Ok(())
}

/// Storer side of the restore protocol: answer with the chunk payload after
/// the jitter window, unless another peer already served it meanwhile.
fn handle_getchunk(peer: Arc<Peer>, msg: Message) -> Result<()> {
    let id = msg.chunk_id();
    if !peer.state.saved_contains(&id) {
        return Ok(());
    }

    peer.restores.clear_served(&id);
    let delay = reply_jitter();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let id = msg.chunk_id();
        if peer.restores.was_served(&id) {
            debug!("CHUNK {} already served by another peer", id);
            return;
        }
        let body = match peer.store.read_chunk(&msg.file_id, msg.chunk_no).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Cannot read chunk {} for restore: {:#}", id, e);
                return;
            }
        };
        let reply = Message::chunk(
            &peer.config.version,
            peer.config.peer_id,
            &msg.file_id,
            msg.chunk_no,
            body,
        );
        if let Err(e) = peer.restore_data.send(&reply).await {
            warn!("CHUNK reply for {} failed: {:#}", id, e);
        }
    });
    Ok(())
}

fn handle_chunk(peer: Arc<Peer>, msg: Message) -> Result<()> {
    peer.restores.record_chunk(&msg.file_id, msg.chunk_no, msg.body);
    Ok(())
}

async fn handle_delete(peer: Arc<Peer>, msg: Message) -> Result<()> {
    let removed = peer.state.delete_saved_file(&msg.file_id);
    peer.store.delete_file(&msg.file_id).await?;
    peer.state.mark_deleted(&msg.file_id);
    peer.state.refresh_occupation(&peer.store).await;
    peer.state.persist();
    if !removed.is_empty() {
        info!(
            "Deleted {} chunks of file {} on request of peer {}",
            removed.len(),
            msg.file_id,
            msg.sender
        );
    }
    Ok(())
}

fn handle_removed(peer: Arc<Peer>, msg: Message) -> Result<()> {
    // Extension point: a storer dropping below the desired degree could
    // re-advertise readiness here.
    if peer.state.record_removal(&msg.chunk_id(), msg.sender) {
        debug!("Peer {} dropped its copy of {}", msg.sender, msg.chunk_id());
        peer.state.persist();
    }
    Ok(())
}
