use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use burrow_protocol::chunk_id;

/// An in-flight restore of one file: CHUNK bodies accumulate until every
/// chunk number up to `expected` has arrived, then the file content is
/// assembled and handed to the waiting initiator.
struct Session {
    expected: u32,
    chunks: HashMap<u32, Bytes>,
    done: Option<oneshot::Sender<Vec<u8>>>,
}

/// Tracks active restore sessions and which chunk ids were recently served
/// on the restore channel (for duplicate-reply suppression: a peer about to
/// answer a GETCHUNK stays silent when it saw another peer's CHUNK during
/// its jitter delay).
#[derive(Default)]
pub struct RestoreRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    served: Mutex<HashSet<String>>,
}

impl RestoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session; the receiver resolves with the assembled file bytes
    /// once all `expected` chunks arrived.
    pub fn begin(&self, file_id: &str, expected: u32) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.insert(
            file_id.to_string(),
            Session {
                expected,
                chunks: HashMap::new(),
                done: Some(tx),
            },
        );
        rx
    }

    /// Abandon a session (timeout or error on the initiator side).
    pub fn cancel(&self, file_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.remove(file_id);
    }

    /// Record an observed CHUNK. Always feeds the suppression memory; feeds
    /// a session only if one is active for the file.
    pub fn record_chunk(&self, file_id: &str, chunk_no: u32, body: Bytes) {
        self.mark_served(&chunk_id(file_id, chunk_no));

        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let Some(session) = sessions.get_mut(file_id) else {
            return;
        };
        session.chunks.entry(chunk_no).or_insert(body);
        debug!(
            "restore {}: {}/{} chunks collected",
            file_id,
            session.chunks.len(),
            session.expected
        );

        if session.chunks.len() as u32 >= session.expected {
            let Some(mut session) = sessions.remove(file_id) else {
                return;
            };
            let mut data = Vec::new();
            for chunk_no in 1..=session.expected {
                if let Some(body) = session.chunks.remove(&chunk_no) {
                    data.extend_from_slice(&body);
                }
            }
            if let Some(done) = session.done.take() {
                // the initiator may have timed out and dropped the receiver
                let _ = done.send(data);
            }
        }
    }

    pub fn mark_served(&self, chunk_id: &str) {
        let mut served = self.served.lock().unwrap_or_else(|p| p.into_inner());
        served.insert(chunk_id.to_string());
    }

    /// Forget any previous CHUNK sighting so the next `was_served` reflects
    /// only what arrives during the caller's jitter window.
    pub fn clear_served(&self, chunk_id: &str) {
        let mut served = self.served.lock().unwrap_or_else(|p| p.into_inner());
        served.remove(chunk_id);
    }

    pub fn was_served(&self, chunk_id: &str) -> bool {
        let served = self.served.lock().unwrap_or_else(|p| p.into_inner());
        served.contains(chunk_id)
    }
}
