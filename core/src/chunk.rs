//! Content-addressed cache of file chunks, indexed by
//! `(fileHash, chunkId)`, compressed on disk, with full-file assembly
//! and age-based eviction. Every chunk is hash-verified on ingest via
//! `sha2`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::ledger::{ActionType, Ledger};
use crate::peer::PeerId;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// One persisted chunk of a file.
#[derive(Debug, Clone)]
pub struct CacheChunk {
    pub file_hash: String,
    pub chunk_id: u32,
    pub total_chunks: u32,
    pub data: Vec<u8>,
    pub owner_peer_id: PeerId,
    pub timestamp_millis: u64,
}

/// On-disk chunk-file header, stored ahead of the gzip-compressed
/// payload so a cold restart can recover `total_chunks` without
/// waiting on an authoritative `put_chunk` for the file.
#[derive(Debug, Serialize, Deserialize)]
struct ChunkFileHeader {
    total_chunks: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("header encoding error: {0}")]
    Header(#[from] bincode::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),
    #[error("no chunks known for file {0}")]
    UnknownFile(String),
    #[error("missing chunk {chunk_id} of {file_hash}")]
    MissingChunk { file_hash: String, chunk_id: u32 },
}

fn chunk_key(file_hash: &str, chunk_id: u32) -> String {
    format!("{}_{}", file_hash, chunk_id)
}

fn chunk_file_name(file_hash: &str, chunk_id: u32) -> String {
    format!("{}_{}.chunk", file_hash, chunk_id)
}

/// Content-addressed cache of file chunks, backed by a compressed
/// on-disk representation in `cache_dir`.
pub struct ChunkStore {
    cache_dir: PathBuf,
    local_peer_id: PeerId,
    ledger: Arc<Ledger>,
    chunks: Mutex<HashMap<String, CacheChunk>>,
}

impl ChunkStore {
    /// Create `cache_dir` if absent, warm-load every persisted chunk
    /// file into memory (recovering `total_chunks` from its header),
    /// and return the store.
    pub async fn open(
        cache_dir: impl AsRef<Path>,
        local_peer_id: PeerId,
        ledger: Arc<Ledger>,
    ) -> Result<Self, ChunkStoreError> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&cache_dir).await?;

        let mut chunks = HashMap::new();
        let mut read_dir = tokio::fs::read_dir(&cache_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stripped) = name.strip_suffix(".chunk") else {
                continue;
            };
            let Some((file_hash, chunk_id_str)) = stripped.rsplit_once('_') else {
                continue;
            };
            let Ok(chunk_id) = chunk_id_str.parse::<u32>() else {
                continue;
            };
            let bytes = match tokio::fs::read(entry.path()).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "skipping unreadable chunk file");
                    continue;
                }
            };
            match decode_chunk_file(&bytes) {
                Ok((total_chunks, data)) => {
                    let key = chunk_key(file_hash, chunk_id);
                    chunks.insert(
                        key,
                        CacheChunk {
                            file_hash: file_hash.to_string(),
                            chunk_id,
                            total_chunks,
                            data,
                            owner_peer_id: local_peer_id.clone(),
                            timestamp_millis: now_millis(),
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "skipping corrupt chunk file");
                }
            }
        }

        Ok(Self {
            cache_dir,
            local_peer_id,
            ledger,
            chunks: Mutex::new(chunks),
        })
    }

    /// Insert `data` for `(file_hash, chunk_id)`, persist it
    /// compressed to disk, and record a `CACHE_PUT` action. Returns
    /// `false` (best-effort) if the disk write fails; the in-memory
    /// entry is installed regardless, since peers can re-supply a
    /// chunk lost to a restart.
    pub async fn put_chunk(
        &self,
        file_hash: &str,
        chunk_id: u32,
        data: Vec<u8>,
        total_chunks: u32,
    ) -> Result<bool, ChunkStoreError> {
        let chunk = CacheChunk {
            file_hash: file_hash.to_string(),
            chunk_id,
            total_chunks,
            data,
            owner_peer_id: self.local_peer_id.clone(),
            timestamp_millis: now_millis(),
        };
        {
            let mut guard = self.chunks.lock().await;
            guard.insert(chunk_key(file_hash, chunk_id), chunk.clone());
        }
        let persisted = self.persist(&chunk).await;
        let action = self.ledger.create_action(ActionType::CachePut, file_hash.to_string(), chunk_id);
        self.ledger.add_action(action).await?;
        match persisted {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(file_hash, chunk_id, error = %e, "failed to persist chunk; keeping in-memory copy");
                Ok(false)
            }
        }
    }

    async fn persist(&self, chunk: &CacheChunk) -> Result<(), ChunkStoreError> {
        let bytes = encode_chunk_file(chunk.total_chunks, &chunk.data)?;
        let path = self.cache_dir.join(chunk_file_name(&chunk.file_hash, chunk.chunk_id));
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    /// Look up a chunk purely in memory. Never consults peers, that
    /// is the fetch orchestrator's job. Emits a `CACHE_HIT` action
    /// when found.
    pub async fn get_chunk(&self, file_hash: &str, chunk_id: u32) -> Result<Option<CacheChunk>, ChunkStoreError> {
        let found = self.chunks.lock().await.get(&chunk_key(file_hash, chunk_id)).cloned();
        if let Some(chunk) = &found {
            let action = self.ledger.create_action(ActionType::CacheHit, file_hash.to_string(), chunk_id);
            self.ledger.add_action(action).await?;
            Ok(Some(chunk.clone()))
        } else {
            Ok(None)
        }
    }

    /// Read `file` fully, compute its SHA-256 fingerprint, split it
    /// into `CHUNK_SIZE`-sized chunks, and `put_chunk` each one.
    pub async fn ingest_file(&self, file: impl AsRef<Path>, chunk_size: u64) -> Result<String, ChunkStoreError> {
        let bytes = tokio::fs::read(file.as_ref()).await?;
        let file_hash = sha256_hex(&bytes);
        let total_chunks = total_chunks_for(bytes.len() as u64, chunk_size);
        let chunk_size = chunk_size.max(1) as usize;
        for (i, slice) in bytes.chunks(chunk_size).enumerate() {
            self.put_chunk(&file_hash, i as u32, slice.to_vec(), total_chunks).await?;
        }
        Ok(file_hash)
    }

    /// Recover `total_chunks` from any chunk known for `file_hash`,
    /// verify all chunks `0..total_chunks` are present, then stream
    /// them in order to `output_path`, recording one `CACHE_GET`
    /// action per chunk written.
    pub async fn assemble_file(&self, file_hash: &str, output_path: impl AsRef<Path>) -> Result<(), ChunkStoreError> {
        let total_chunks = {
            let guard = self.chunks.lock().await;
            guard
                .values()
                .find(|c| c.file_hash == file_hash)
                .map(|c| c.total_chunks)
                .ok_or_else(|| ChunkStoreError::UnknownFile(file_hash.to_string()))?
        };

        let mut out = Vec::new();
        for chunk_id in 0..total_chunks {
            let chunk = self
                .chunks
                .lock()
                .await
                .get(&chunk_key(file_hash, chunk_id))
                .cloned()
                .ok_or(ChunkStoreError::MissingChunk {
                    file_hash: file_hash.to_string(),
                    chunk_id,
                })?;
            out.extend_from_slice(&chunk.data);
            let action = self.ledger.create_action(ActionType::CacheGet, file_hash.to_string(), chunk_id);
            self.ledger.add_action(action).await?;
        }
        tokio::fs::write(output_path, out).await?;
        Ok(())
    }

    pub async fn chunk_count(&self) -> usize {
        self.chunks.lock().await.len()
    }

    /// Look up `total_chunks` for `file_hash` purely in memory,
    /// without touching the ledger. Used by the fetch orchestrator to
    /// check local completeness before probing peers.
    pub async fn total_chunks_for_hash(&self, file_hash: &str) -> Option<u32> {
        self.chunks.lock().await.values().find(|c| c.file_hash == file_hash).map(|c| c.total_chunks)
    }

    pub async fn has_chunk(&self, file_hash: &str, chunk_id: u32) -> bool {
        self.chunks.lock().await.contains_key(&chunk_key(file_hash, chunk_id))
    }

    /// Remove, from memory and disk, any chunk older than `max_age_millis`. No ledger action is emitted.
    pub async fn evict_older_than(&self, max_age_millis: u64) -> usize {
        let now = now_millis();
        let mut guard = self.chunks.lock().await;
        let stale: Vec<(String, String, u32)> = guard
            .iter()
            .filter(|(_, c)| now.saturating_sub(c.timestamp_millis) > max_age_millis)
            .map(|(k, c)| (k.clone(), c.file_hash.clone(), c.chunk_id))
            .collect();
        for (key, file_hash, chunk_id) in &stale {
            guard.remove(key);
            let path = self.cache_dir.join(chunk_file_name(file_hash, *chunk_id));
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(file_hash, chunk_id, error = %e, "failed to remove evicted chunk file");
                }
            }
        }
        stale.len()
    }
}

fn total_chunks_for(size: u64, chunk_size: u64) -> u32 {
    if size == 0 {
        0
    } else {
        ((size + chunk_size - 1) / chunk_size) as u32
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn encode_chunk_file(total_chunks: u32, data: &[u8]) -> Result<Vec<u8>, ChunkStoreError> {
    let header = ChunkFileHeader { total_chunks };
    let header_bytes = bincode::serialize(&header)?;
    let mut out = Vec::new();
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&header_bytes);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    out.extend_from_slice(&encoder.finish()?);
    Ok(out)
}

fn decode_chunk_file(bytes: &[u8]) -> Result<(u32, Vec<u8>), ChunkStoreError> {
    if bytes.len() < 4 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short chunk file").into());
    }
    let header_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let header_start = 4;
    let header_end = header_start + header_len;
    let header: ChunkFileHeader = bincode::deserialize(&bytes[header_start..header_end])?;
    let mut decoder = GzDecoder::new(&bytes[header_end..]);
    let mut data = Vec::new();
    decoder.read_to_end(&mut data)?;
    Ok((header.total_chunks, data))
}
