use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use burrow_protocol::Message;

use crate::channel::MulticastChannel;
use crate::chunker;
use crate::config::Config;
use crate::restore::RestoreRegistry;
use crate::state::{PeerState, StateReport};
use crate::store::ChunkStore;

/// Bound on simultaneous inbound message handlers. Wide: handlers are short
/// except for disk I/O.
pub const INBOUND_WORKERS: usize = 64;

/// Bound on simultaneous outbound chunk transmissions. Narrower: each task
/// holds a chunk payload.
pub const OUTBOUND_WORKERS: usize = 32;

/// How long a restore initiator waits for the full set of CHUNK replies.
const RESTORE_TIMEOUT: Duration = Duration::from_secs(15);

/// One peer process: its durable state, chunk store, the three multicast
/// channels and the two worker-pool bounds. Everything the handlers and the
/// operator surface touch hangs off an `Arc<Peer>`.
pub struct Peer {
    pub config: Config,
    pub state: PeerState,
    pub store: ChunkStore,
    pub control: Arc<MulticastChannel>,
    pub backup_data: Arc<MulticastChannel>,
    pub restore_data: Arc<MulticastChannel>,
    pub restores: RestoreRegistry,
    pub inbound_permits: Arc<Semaphore>,
    pub outbound_permits: Arc<Semaphore>,
}

#[derive(Debug, Serialize)]
pub struct BackupStarted {
    pub file_id: String,
    pub chunks: u32,
}

impl Peer {
    /// Initiate a backup: register the file (write-ahead relative to any
    /// chunk transmission), split it and enqueue one PUTCHUNK per chunk on
    /// the outbound pool. Returns once every send is enqueued; replication
    /// confirmations trickle in as STORED messages.
    pub async fn backup(self: &Arc<Self>, path: &str, replication_degree: u8) -> Result<BackupStarted> {
        let file_id = chunker::file_id(Path::new(path))
            .await
            .with_context(|| format!("cannot read source file {}", path))?;
        self.state.register_backup(path, &file_id);
        self.state.persist();

        let size = fs::metadata(path).await?.len();
        let bodies = chunker::split_for_backup(Path::new(path)).await?;
        let total = bodies.len() as u32;
        info!(
            "Backup of {} ({} bytes): fileId {}, {} chunks, degree {}",
            path, size, file_id, total, replication_degree
        );

        for (index, body) in bodies.into_iter().enumerate() {
            self.enqueue_putchunk(&file_id, index as u32 + 1, replication_degree, body);
        }
        self.state.persist();

        Ok(BackupStarted {
            file_id,
            chunks: total,
        })
    }

    /// Register the SentChunk and hand the PUTCHUNK to the outbound pool.
    fn enqueue_putchunk(self: &Arc<Self>, file_id: &str, chunk_no: u32, degree: u8, body: Bytes) {
        self.state.register_sent(file_id, chunk_no, degree);
        let msg = Message::putchunk(
            &self.config.version,
            self.config.peer_id,
            file_id,
            chunk_no,
            degree,
            body,
        );
        let peer = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = peer.outbound_permits.clone().acquire_owned().await else {
                return;
            };
            if let Err(e) = peer.backup_data.send(&msg).await {
                warn!("PUTCHUNK {} send failed: {:#}", msg.chunk_id(), e);
            }
        });
    }

    /// Restore a previously backed-up file. The chunk count derives from
    /// the still-present local copy; the reassembled content is written
    /// under `{root}/restored/`.
    pub async fn restore(&self, path: &str) -> Result<PathBuf> {
        let file_id = self
            .state
            .backed_up_file_id(path)
            .with_context(|| format!("{} was never backed up from this peer", path))?;
        let size = fs::metadata(path)
            .await
            .with_context(|| format!("local copy of {} needed to derive the chunk count", path))?
            .len();
        let total = chunker::chunk_count(size);
        info!("Restore of {}: fileId {}, {} chunks", path, file_id, total);

        let collected = self.restores.begin(&file_id, total);
        for chunk_no in 1..=total {
            let msg = Message::getchunk(&self.config.version, self.config.peer_id, &file_id, chunk_no);
            self.control.send(&msg).await?;
        }

        let data = match tokio::time::timeout(RESTORE_TIMEOUT, collected).await {
            Ok(Ok(data)) => data,
            _ => {
                self.restores.cancel(&file_id);
                anyhow::bail!("restore of {} timed out before all chunks arrived", path);
            }
        };

        let name = Path::new(path)
            .file_name()
            .context("restore path has no file name")?;
        let out_dir = self.config.root.join("restored");
        fs::create_dir_all(&out_dir).await?;
        let out = out_dir.join(name);
        fs::write(&out, &data).await?;
        info!("Restored {} ({} bytes) to {}", path, data.len(), out.display());
        Ok(out)
    }

    /// Delete a backed-up file network-wide. DELETE is resent over
    /// escalating intervals to compensate for unreliable delivery; there is
    /// no acknowledgment, so the call simply blocks for the full schedule.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let file_id = self
            .state
            .backed_up_file_id(path)
            .with_context(|| format!("{} was never backed up from this peer", path))?;
        info!("Delete of {} (fileId {})", path, file_id);

        let msg = Message::delete(&self.config.version, self.config.peer_id, &file_id);
        for pause_secs in 1..=5u64 {
            if let Err(e) = self.control.send(&msg).await {
                warn!("DELETE send failed: {:#}", e);
            }
            tokio::time::sleep(Duration::from_secs(pause_secs)).await;
        }

        self.state.delete_backed_up(path);
        self.state.mark_deleted(&file_id);
        self.state.persist();
        info!("Delete of {} finished", path);
        Ok(())
    }

    pub fn state_report(&self) -> StateReport {
        self.state.report()
    }
}
