use std::path::{Path, PathBuf};

use anyhow::Result;
use bytes::Bytes;
use tokio::fs;
use tracing::{info, warn};

/// On-disk chunk payload store.
///
/// One flat file per chunk at `{root}/chunks/{fileId}/{chunkNo}`. The store
/// holds no metadata; occupation accounting walks the tree so that it stays
/// truthful across crashes between a chunk write and a state persist.
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    pub async fn new(root: &Path) -> Result<Self> {
        let dir = root.join("chunks");
        fs::create_dir_all(&dir).await?;
        info!("Chunk store directory: {}", dir.display());
        Ok(Self { dir })
    }

    fn chunk_path(&self, file_id: &str, chunk_no: u32) -> PathBuf {
        self.dir.join(file_id).join(chunk_no.to_string())
    }

    /// Write a chunk payload. The caller rolls its admission back if this
    /// fails, so a failed write never leaves a registered chunk behind.
    pub async fn write_chunk(&self, file_id: &str, chunk_no: u32, data: &[u8]) -> Result<()> {
        let path = self.chunk_path(file_id, chunk_no);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }

    pub async fn read_chunk(&self, file_id: &str, chunk_no: u32) -> Result<Bytes> {
        let data = fs::read(self.chunk_path(file_id, chunk_no)).await?;
        Ok(Bytes::from(data))
    }

    /// Delete one chunk payload, pruning the file's directory when it
    /// becomes empty. A missing payload is not an error.
    pub async fn delete_chunk(&self, file_id: &str, chunk_no: u32) -> Result<()> {
        let path = self.chunk_path(file_id, chunk_no);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Chunk {}/{} already gone from disk", file_id, chunk_no);
            }
            Err(e) => return Err(e.into()),
        }
        // Best effort: remove_dir refuses non-empty directories.
        let _ = fs::remove_dir(self.dir.join(file_id)).await;
        Ok(())
    }

    /// Delete every stored chunk of a file.
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        match fs::remove_dir_all(self.dir.join(file_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// True on-disk footprint of all stored chunks, in bytes.
    pub async fn disk_usage(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut stack = vec![self.dir.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }
}
