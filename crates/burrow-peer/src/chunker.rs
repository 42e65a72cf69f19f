use std::path::Path;

use anyhow::Result;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Fixed chunk size: the unit of replication.
pub const CHUNK_SIZE: usize = 64_000;

/// Content-derived file identifier: SHA-256 over the path string followed by
/// the streamed file content, hex-encoded. The path salt keeps two identical
/// files backed up under different names apart.
pub async fn file_id(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());

    let mut file = fs::File::open(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Number of PUTCHUNK messages a backup of `file_size` bytes produces,
/// counting the empty tail chunk sent when the size is an exact multiple of
/// the chunk size. The receiver reconstructs the total size as
/// `(lastChunkNo - 1) * CHUNK_SIZE + lastChunkBodyLength`.
pub fn chunk_count(file_size: u64) -> u32 {
    (file_size / CHUNK_SIZE as u64 + 1) as u32
}

/// All PUTCHUNK bodies a backup of `path` sends, in chunk order. When the
/// file size is an exact multiple of `CHUNK_SIZE` (or the file is empty),
/// an empty tail body is appended to mark the true end of the file.
pub async fn split_for_backup(path: &Path) -> Result<Vec<Bytes>> {
    let mut chunks = Chunker::open(path).await?;
    let mut bodies = Vec::new();
    while let Some(body) = chunks.next_chunk().await? {
        bodies.push(body);
    }
    if bodies.last().map_or(true, |body| body.len() == CHUNK_SIZE) {
        bodies.push(Bytes::new());
    }
    Ok(bodies)
}

/// Lazy, non-restartable sequence of fixed-size chunks read from a file.
/// The final yielded chunk may be shorter than `CHUNK_SIZE`; the empty tail
/// for exact-multiple files is the caller's responsibility.
pub struct Chunker {
    file: fs::File,
    exhausted: bool,
}

impl Chunker {
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            file: fs::File::open(path).await?,
            exhausted: false,
        })
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        while filled < CHUNK_SIZE {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled < CHUNK_SIZE {
            self.exhausted = true;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(Bytes::from(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_file(tag: &str, size: usize) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("burrow_chunker_test_{}", tag));
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_exact_multiple_splits_into_full_chunks() {
        let path = temp_file("exact", 2 * CHUNK_SIZE).await;
        let mut chunker = Chunker::open(&path).await.unwrap();
        assert_eq!(chunker.next_chunk().await.unwrap().unwrap().len(), CHUNK_SIZE);
        assert_eq!(chunker.next_chunk().await.unwrap().unwrap().len(), CHUNK_SIZE);
        assert!(chunker.next_chunk().await.unwrap().is_none());
        // backup appends the empty tail, for three messages total
        assert_eq!(chunk_count(2 * CHUNK_SIZE as u64), 3);
    }

    #[tokio::test]
    async fn test_short_tail() {
        let path = temp_file("tail", CHUNK_SIZE + 100).await;
        let mut chunker = Chunker::open(&path).await.unwrap();
        assert_eq!(chunker.next_chunk().await.unwrap().unwrap().len(), CHUNK_SIZE);
        assert_eq!(chunker.next_chunk().await.unwrap().unwrap().len(), 100);
        assert!(chunker.next_chunk().await.unwrap().is_none());
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 100), 2);
    }

    #[tokio::test]
    async fn test_small_file_single_chunk() {
        let path = temp_file("small", 100).await;
        let mut chunker = Chunker::open(&path).await.unwrap();
        assert_eq!(chunker.next_chunk().await.unwrap().unwrap().len(), 100);
        assert!(chunker.next_chunk().await.unwrap().is_none());
        assert_eq!(chunk_count(100), 1);
    }

    #[tokio::test]
    async fn test_split_for_backup_exact_multiple_appends_empty_tail() {
        let path = temp_file("split_exact", 2 * CHUNK_SIZE).await;
        let bodies = split_for_backup(&path).await.unwrap();
        let lens: Vec<usize> = bodies.iter().map(|body| body.len()).collect();
        assert_eq!(lens, vec![CHUNK_SIZE, CHUNK_SIZE, 0]);
        assert_eq!(bodies.len() as u32, chunk_count(2 * CHUNK_SIZE as u64));
    }

    #[tokio::test]
    async fn test_split_for_backup_short_tail_has_no_extra_chunk() {
        let path = temp_file("split_tail", CHUNK_SIZE + 100).await;
        let bodies = split_for_backup(&path).await.unwrap();
        let lens: Vec<usize> = bodies.iter().map(|body| body.len()).collect();
        assert_eq!(lens, vec![CHUNK_SIZE, 100]);
    }

    #[tokio::test]
    async fn test_split_for_backup_empty_file_is_one_empty_chunk() {
        let path = temp_file("split_empty", 0).await;
        let bodies = split_for_backup(&path).await.unwrap();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].is_empty());
    }

    #[tokio::test]
    async fn test_file_id_is_stable_and_path_salted() {
        let a = temp_file("id_a", 500).await;
        let b = temp_file("id_b", 500).await;
        let id_a1 = file_id(&a).await.unwrap();
        let id_a2 = file_id(&a).await.unwrap();
        let id_b = file_id(&b).await.unwrap();
        assert_eq!(id_a1, id_a2);
        // same content, different path
        assert_ne!(id_a1, id_b);
        assert_eq!(id_a1.len(), 64);
    }
}
