use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use burrow_protocol::chunk_id;

use crate::store::ChunkStore;

/// A chunk this peer pushed to the network for storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentChunk {
    pub file_id: String,
    pub chunk_no: u32,
    pub replication_degree: u8,
    /// Peers that confirmed storing it (set semantics: idempotent).
    pub peers: HashSet<u64>,
}

/// A chunk this peer stores locally on behalf of another peer. Durable
/// record only; the payload lives on disk and is never serialized with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedChunk {
    pub file_id: String,
    pub chunk_no: u32,
    pub replication_degree: u8,
    /// Peers observed to hold this chunk, this peer included.
    pub peers: HashSet<u64>,
    /// Whether a PUTCHUNK for this chunk has been received.
    pub putchunk_seen: bool,
}

impl SentChunk {
    pub fn chunk_id(&self) -> String {
        chunk_id(&self.file_id, self.chunk_no)
    }
}

impl SavedChunk {
    pub fn chunk_id(&self) -> String {
        chunk_id(&self.file_id, self.chunk_no)
    }
}

/// Outcome of the single authoritative capacity-check-and-admit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Reserved: the caller must write the payload and roll back on failure.
    Admitted,
    /// Already stored here; a STORED reply is still owed (UDP redelivery).
    Duplicate,
    /// This peer originated the store request for this chunk.
    OwnChunk,
    /// `occupation + size` would exceed capacity. Declined silently.
    CapacityExceeded,
    /// The file was deleted; stale in-flight message.
    DeletedFile,
    /// Mid-reclaim; not accepting requests.
    NotAccepting,
}

/// What gets serialized to the snapshot file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    sent: HashMap<String, SentChunk>,
    saved: HashMap<String, SavedChunk>,
    backed_up: HashMap<String, String>,
    deleted: HashSet<String>,
    capacity: u64,
}

/// Operator-facing view of the whole state.
#[derive(Debug, Serialize)]
pub struct StateReport {
    pub peer_id: u64,
    pub capacity: u64,
    pub occupation: u64,
    pub backed_up_files: HashMap<String, String>,
    pub sent_chunks: Vec<ChunkReport>,
    pub saved_chunks: Vec<ChunkReport>,
    pub deleted_files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ChunkReport {
    pub chunk_id: String,
    pub replication_degree: u8,
    pub confirmed_peers: usize,
}

/// The durable, process-wide record of what this peer stores, what it asked
/// others to store, and its capacity budget. Exclusively owned by this
/// process; peers reconcile only through exchanged messages.
pub struct PeerState {
    peer_id: u64,
    snapshot_path: PathBuf,
    capacity: AtomicU64,
    occupation: AtomicU64,
    accepting: AtomicBool,
    sent: Mutex<HashMap<String, SentChunk>>,
    saved: Mutex<HashMap<String, SavedChunk>>,
    backed_up: Mutex<HashMap<String, String>>,
    deleted: Mutex<HashSet<String>>,
}

// A poisoned lock only means a handler task panicked mid-update; the maps
// are still usable and the protocol is self-healing.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PeerState {
    /// Load the last persisted snapshot, or start fresh when there is none
    /// (or it is unreadable).
    pub fn load(peer_id: u64, root: &Path, default_capacity: u64) -> Self {
        let snapshot_path = root.join("state.json");
        let snapshot = std::fs::read(&snapshot_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Snapshot>(&bytes).ok());

        let snapshot = match snapshot {
            Some(snapshot) => {
                info!(
                    "State snapshot loaded: {} saved, {} sent, {} backed up",
                    snapshot.saved.len(),
                    snapshot.sent.len(),
                    snapshot.backed_up.len()
                );
                snapshot
            }
            None => {
                info!("No usable state snapshot at {}, starting fresh", snapshot_path.display());
                Snapshot {
                    capacity: default_capacity,
                    ..Snapshot::default()
                }
            }
        };

        Self {
            peer_id,
            snapshot_path,
            capacity: AtomicU64::new(snapshot.capacity),
            occupation: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            sent: Mutex::new(snapshot.sent),
            saved: Mutex::new(snapshot.saved),
            backed_up: Mutex::new(snapshot.backed_up),
            deleted: Mutex::new(snapshot.deleted),
        }
    }

    /// Serialize the whole state to the snapshot file (temp file + rename,
    /// last writer wins). Failure is logged, never fatal: the in-memory
    /// state stays authoritative and the next mutation persists again.
    pub fn persist(&self) {
        let snapshot = Snapshot {
            sent: lock(&self.sent).clone(),
            saved: lock(&self.saved).clone(),
            backed_up: lock(&self.backed_up).clone(),
            deleted: lock(&self.deleted).clone(),
            capacity: self.capacity(),
        };

        let bytes = match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("State snapshot serialization failed: {}", e);
                return;
            }
        };

        let tmp = self.snapshot_path.with_extension("json.tmp");
        let outcome = std::fs::write(&tmp, &bytes)
            .and_then(|_| std::fs::rename(&tmp, &self.snapshot_path));
        if let Err(e) = outcome {
            warn!("State snapshot persist failed, retrying on next mutation: {}", e);
        }
    }

    /// Recompute occupation by measuring the on-disk chunk tree. Called
    /// after every structural mutation; authoritative over any in-memory
    /// tally.
    pub async fn refresh_occupation(&self, store: &ChunkStore) {
        match store.disk_usage().await {
            Ok(bytes) => self.occupation.store(bytes, Ordering::SeqCst),
            Err(e) => warn!("Occupation scan failed, keeping previous value: {}", e),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn occupation(&self) -> u64 {
        self.occupation.load(Ordering::SeqCst)
    }

    pub fn set_capacity(&self, bytes: u64) {
        self.capacity.store(bytes, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    // ── Backup bookkeeping ──────────────────────────────────────────────

    pub fn register_backup(&self, path: &str, file_id: &str) {
        lock(&self.backed_up).insert(path.to_string(), file_id.to_string());
    }

    pub fn backed_up_file_id(&self, path: &str) -> Option<String> {
        lock(&self.backed_up).get(path).cloned()
    }

    pub fn register_sent(&self, file_id: &str, chunk_no: u32, replication_degree: u8) {
        lock(&self.sent).insert(
            chunk_id(file_id, chunk_no),
            SentChunk {
                file_id: file_id.to_string(),
                chunk_no,
                replication_degree,
                peers: HashSet::new(),
            },
        );
    }

    // ── Admission ───────────────────────────────────────────────────────

    /// The single authoritative capacity-check-and-admit operation. The
    /// check-then-reserve runs under the saved-map lock so that two
    /// concurrent admits cannot jointly exceed capacity; the occupation
    /// reservation is rolled back by `rollback_admission` if the payload
    /// write fails.
    pub fn try_admit(&self, file_id: &str, chunk_no: u32, degree: u8, size: u64) -> Admission {
        if !self.is_accepting() {
            return Admission::NotAccepting;
        }
        if self.is_deleted(file_id) {
            return Admission::DeletedFile;
        }

        let id = chunk_id(file_id, chunk_no);
        let mut saved = lock(&self.saved);

        if let Some(existing) = saved.get_mut(&id) {
            existing.putchunk_seen = true;
            return Admission::Duplicate;
        }
        if lock(&self.sent).contains_key(&id) {
            return Admission::OwnChunk;
        }
        if self.occupation() + size > self.capacity() {
            return Admission::CapacityExceeded;
        }

        self.occupation.fetch_add(size, Ordering::SeqCst);
        let mut peers = HashSet::new();
        peers.insert(self.peer_id);
        saved.insert(
            id,
            SavedChunk {
                file_id: file_id.to_string(),
                chunk_no,
                replication_degree: degree,
                peers,
                putchunk_seen: true,
            },
        );
        Admission::Admitted
    }

    /// Undo an admission whose payload write failed: all-or-nothing, no
    /// partially registered chunk survives. A concurrent occupation refresh
    /// may already have dropped the reservation from the counter, so the
    /// subtraction must not wrap.
    pub fn rollback_admission(&self, chunk_id: &str, size: u64) {
        lock(&self.saved).remove(chunk_id);
        let _ = self
            .occupation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |occupation| {
                Some(occupation.saturating_sub(size))
            });
    }

    // ── Confirmations ───────────────────────────────────────────────────

    /// Add `peer` to the confirmed set of the matching sent or saved chunk.
    /// Idempotent; returns whether anything changed.
    pub fn record_confirmation(&self, chunk_id: &str, peer: u64) -> bool {
        if let Some(chunk) = lock(&self.sent).get_mut(chunk_id) {
            return chunk.peers.insert(peer);
        }
        if let Some(chunk) = lock(&self.saved).get_mut(chunk_id) {
            return chunk.peers.insert(peer);
        }
        false
    }

    /// A peer announced it dropped its copy: shrink the confirmed set.
    pub fn record_removal(&self, chunk_id: &str, peer: u64) -> bool {
        if let Some(chunk) = lock(&self.sent).get_mut(chunk_id) {
            return chunk.peers.remove(&peer);
        }
        if let Some(chunk) = lock(&self.saved).get_mut(chunk_id) {
            return chunk.peers.remove(&peer);
        }
        false
    }

    // ── Saved-chunk queries ─────────────────────────────────────────────

    pub fn saved_contains(&self, chunk_id: &str) -> bool {
        lock(&self.saved).contains_key(chunk_id)
    }

    /// Saved chunks whose confirmed-peer count strictly exceeds their
    /// declared replication degree: this peer's copy is redundant.
    pub fn over_replicated(&self) -> Vec<SavedChunk> {
        lock(&self.saved)
            .values()
            .filter(|chunk| chunk.peers.len() > chunk.replication_degree as usize)
            .cloned()
            .collect()
    }

    /// Drop every over-replicated saved-chunk record in one pass, returning
    /// the removed records so the caller can broadcast the eviction notices
    /// and clear the payloads from disk.
    pub fn evict_over_replicated(&self) -> Vec<SavedChunk> {
        let mut saved = lock(&self.saved);
        let victims: Vec<String> = saved
            .values()
            .filter(|chunk| chunk.peers.len() > chunk.replication_degree as usize)
            .map(|chunk| chunk.chunk_id())
            .collect();
        victims
            .iter()
            .filter_map(|id| saved.remove(id))
            .collect()
    }

    // ── Deletion ────────────────────────────────────────────────────────

    /// Drop every saved-chunk record of a file; returns the removed records
    /// so the caller can clear the payloads from disk.
    pub fn delete_saved_file(&self, file_id: &str) -> Vec<SavedChunk> {
        let mut saved = lock(&self.saved);
        let victims: Vec<String> = saved
            .values()
            .filter(|chunk| chunk.file_id == file_id)
            .map(|chunk| chunk.chunk_id())
            .collect();
        victims
            .iter()
            .filter_map(|id| saved.remove(id))
            .collect()
    }

    /// Drop the backed-up entry for `path` and every SentChunk of its file.
    /// Returns the fileId, or None when the path was never backed up (or
    /// already deleted): re-running delete is a no-op.
    pub fn delete_backed_up(&self, path: &str) -> Option<String> {
        let file_id = lock(&self.backed_up).remove(path)?;
        lock(&self.sent).retain(|_, chunk| chunk.file_id != file_id);
        Some(file_id)
    }

    pub fn mark_deleted(&self, file_id: &str) {
        lock(&self.deleted).insert(file_id.to_string());
    }

    pub fn is_deleted(&self, file_id: &str) -> bool {
        lock(&self.deleted).contains(file_id)
    }

    // ── Reporting ───────────────────────────────────────────────────────

    pub fn report(&self) -> StateReport {
        let sent_chunks = lock(&self.sent)
            .values()
            .map(|chunk| ChunkReport {
                chunk_id: chunk.chunk_id(),
                replication_degree: chunk.replication_degree,
                confirmed_peers: chunk.peers.len(),
            })
            .collect();
        let saved_chunks = lock(&self.saved)
            .values()
            .map(|chunk| ChunkReport {
                chunk_id: chunk.chunk_id(),
                replication_degree: chunk.replication_degree,
                confirmed_peers: chunk.peers.len(),
            })
            .collect();

        StateReport {
            peer_id: self.peer_id,
            capacity: self.capacity(),
            occupation: self.occupation(),
            backed_up_files: lock(&self.backed_up).clone(),
            sent_chunks,
            saved_chunks,
            deleted_files: lock(&self.deleted).iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state(capacity: u64) -> PeerState {
        let root = std::env::temp_dir().join("burrow_state_test_fresh");
        PeerState::load(1, &root, capacity)
    }

    #[test]
    fn test_admit_within_capacity() {
        let state = fresh_state(1000);
        assert_eq!(state.try_admit("f", 1, 2, 600), Admission::Admitted);
        assert_eq!(state.occupation(), 600);
        assert!(state.saved_contains("f_1"));
    }

    #[test]
    fn test_admit_over_capacity_declined() {
        let state = fresh_state(1000);
        assert_eq!(state.try_admit("f", 1, 2, 600), Admission::Admitted);
        assert_eq!(state.try_admit("f", 2, 2, 600), Admission::CapacityExceeded);
        assert!(!state.saved_contains("f_2"));
        assert_eq!(state.occupation(), 600);
    }

    #[test]
    fn test_admit_duplicate() {
        let state = fresh_state(1000);
        assert_eq!(state.try_admit("f", 1, 2, 100), Admission::Admitted);
        assert_eq!(state.try_admit("f", 1, 2, 100), Admission::Duplicate);
        assert_eq!(state.occupation(), 100);
    }

    #[test]
    fn test_admit_own_chunk() {
        let state = fresh_state(1000);
        state.register_sent("f", 1, 2);
        assert_eq!(state.try_admit("f", 1, 2, 100), Admission::OwnChunk);
    }

    #[test]
    fn test_admit_deleted_file_and_not_accepting() {
        let state = fresh_state(1000);
        state.mark_deleted("gone");
        assert_eq!(state.try_admit("gone", 1, 2, 10), Admission::DeletedFile);

        state.set_accepting(false);
        assert_eq!(state.try_admit("f", 1, 2, 10), Admission::NotAccepting);
    }

    #[test]
    fn test_rollback_admission() {
        let state = fresh_state(1000);
        assert_eq!(state.try_admit("f", 1, 2, 100), Admission::Admitted);
        state.rollback_admission("f_1", 100);
        assert!(!state.saved_contains("f_1"));
        assert_eq!(state.occupation(), 0);
        // the chunk can be admitted again afterwards
        assert_eq!(state.try_admit("f", 1, 2, 100), Admission::Admitted);
    }

    #[tokio::test]
    async fn test_rollback_after_occupation_refresh_does_not_wrap() {
        let root = std::env::temp_dir().join("burrow_state_test_rollback_refresh");
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        let store = ChunkStore::new(&root).await.unwrap();

        let state = PeerState::load(1, &root, 1000);
        assert_eq!(state.try_admit("f", 1, 2, 100), Admission::Admitted);
        // a disk scan lands between the reservation and the failed write:
        // nothing is on disk yet, so it zeroes the counter
        state.refresh_occupation(&store).await;
        assert_eq!(state.occupation(), 0);

        state.rollback_admission("f_1", 100);
        assert_eq!(state.occupation(), 0);
        // capacity is still free; admission must not be wedged shut
        assert_eq!(state.try_admit("g", 1, 2, 1), Admission::Admitted);
    }

    #[tokio::test]
    async fn test_refresh_occupation_matches_disk_footprint() {
        let root = std::env::temp_dir().join("burrow_state_test_refresh");
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        let store = ChunkStore::new(&root).await.unwrap();

        let state = PeerState::load(1, &root, 1000);
        assert_eq!(state.try_admit("f", 1, 2, 100), Admission::Admitted);
        store.write_chunk("f", 1, &[0u8; 100]).await.unwrap();
        state.refresh_occupation(&store).await;
        assert_eq!(state.occupation(), store.disk_usage().await.unwrap());
        assert_eq!(state.occupation(), 100);

        state.delete_saved_file("f");
        store.delete_file("f").await.unwrap();
        state.refresh_occupation(&store).await;
        assert_eq!(state.occupation(), 0);
    }

    #[test]
    fn test_confirmation_is_idempotent() {
        let state = fresh_state(1000);
        state.register_sent("f", 1, 2);
        assert!(state.record_confirmation("f_1", 7));
        assert!(!state.record_confirmation("f_1", 7));
        assert!(state.record_confirmation("f_1", 8));
        let report = state.report();
        assert_eq!(report.sent_chunks[0].confirmed_peers, 2);
    }

    #[test]
    fn test_confirmation_untracked_is_noop() {
        let state = fresh_state(1000);
        assert!(!state.record_confirmation("nope_1", 7));
    }

    #[test]
    fn test_removal_shrinks_confirmed_set() {
        let state = fresh_state(1000);
        state.register_sent("f", 1, 2);
        state.record_confirmation("f_1", 7);
        state.record_confirmation("f_1", 8);
        assert!(state.record_removal("f_1", 7));
        assert!(!state.record_removal("f_1", 7));
        assert_eq!(state.report().sent_chunks[0].confirmed_peers, 1);
    }

    #[test]
    fn test_over_replicated_selection() {
        let state = fresh_state(10_000);
        // degree 1, two confirmations besides ourselves -> over-replicated
        state.try_admit("f", 1, 1, 10);
        state.record_confirmation("f_1", 7);
        // degree 2, only ourselves -> not over-replicated
        state.try_admit("f", 2, 2, 10);

        let over = state.over_replicated();
        assert_eq!(over.len(), 1);
        assert_eq!(over[0].chunk_id(), "f_1");
    }

    #[test]
    fn test_evict_over_replicated_leaves_no_violation_behind() {
        let state = fresh_state(10_000);
        // two over-replicated chunks, one healthy
        state.try_admit("f", 1, 1, 10);
        state.record_confirmation("f_1", 7);
        state.try_admit("f", 2, 1, 10);
        state.record_confirmation("f_2", 7);
        state.try_admit("g", 1, 2, 10);

        let evicted = state.evict_over_replicated();
        let mut ids: Vec<String> = evicted.iter().map(|chunk| chunk.chunk_id()).collect();
        ids.sort();
        assert_eq!(ids, vec!["f_1", "f_2"]);

        assert!(state.over_replicated().is_empty());
        assert!(!state.saved_contains("f_1"));
        assert!(!state.saved_contains("f_2"));
        assert!(state.saved_contains("g_1"));

        // a second pass finds nothing left to evict
        assert!(state.evict_over_replicated().is_empty());
    }

    #[test]
    fn test_delete_saved_file_removes_only_matching() {
        let state = fresh_state(10_000);
        state.try_admit("a", 1, 1, 10);
        state.try_admit("a", 2, 1, 10);
        state.try_admit("b", 1, 1, 10);

        let removed = state.delete_saved_file("a");
        assert_eq!(removed.len(), 2);
        assert!(!state.saved_contains("a_1"));
        assert!(!state.saved_contains("a_2"));
        assert!(state.saved_contains("b_1"));
    }

    #[test]
    fn test_delete_backed_up_clears_sent_chunks() {
        let state = fresh_state(1000);
        state.register_backup("/tmp/x", "fx");
        state.register_sent("fx", 1, 2);
        state.register_sent("fx", 2, 2);
        state.register_sent("other", 1, 2);

        assert_eq!(state.delete_backed_up("/tmp/x").as_deref(), Some("fx"));
        assert!(state.backed_up_file_id("/tmp/x").is_none());
        let report = state.report();
        assert_eq!(report.sent_chunks.len(), 1);
        assert_eq!(report.sent_chunks[0].chunk_id, "other_1");

        // re-running delete on an already-deleted path is a no-op
        assert_eq!(state.delete_backed_up("/tmp/x"), None);
    }

    #[test]
    fn test_persist_and_load_roundtrip() {
        let root = std::env::temp_dir().join("burrow_state_test_persist");
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();

        let state = PeerState::load(1, &root, 5000);
        state.register_backup("/tmp/x", "fx");
        state.register_sent("fx", 1, 2);
        state.record_confirmation("fx_1", 9);
        state.try_admit("other", 3, 1, 42);
        state.mark_deleted("dead");
        state.set_capacity(4000);
        state.persist();

        let reloaded = PeerState::load(1, &root, 5000);
        assert_eq!(reloaded.capacity(), 4000);
        assert_eq!(reloaded.backed_up_file_id("/tmp/x").as_deref(), Some("fx"));
        assert!(reloaded.saved_contains("other_3"));
        assert!(reloaded.is_deleted("dead"));
        assert_eq!(reloaded.report().sent_chunks[0].confirmed_peers, 1);
    }
}
