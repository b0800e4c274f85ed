//! Fetch orchestrator: given a file fingerprint, locate its chunks
//! across active peers, fetch them in parallel, assemble the file,
//! and record accounting through the existing Ledger/Chunk Store
//! paths.
//!
//! Composes `chunk`, `peer`, and `transport`: probes peers for each
//! chunk in turn, then fans the remaining chunks out across a bounded
//! worker pool sized by a `tokio::sync::Semaphore` rather than a fixed
//! thread count.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::chunk::ChunkStore;
use crate::peer::{PeerRecord, PeerRegistry};
use crate::transport::{Message, Transport};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("chunk store error: {0}")]
    ChunkStore(#[from] crate::chunk::ChunkStoreError),
    #[error("no active peers known")]
    NoActivePeers,
    #[error("no peer served chunk 0 of {0}")]
    ChunkZeroUnavailable(String),
    #[error("no peer served chunk {chunk_id} of {file_hash}")]
    ChunkUnavailable { file_hash: String, chunk_id: u32 },
}

/// Summary returned by [`FetchOrchestrator::file_info`].
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub file_hash: String,
    pub total_chunks: u32,
    pub estimated_size: u64,
    pub chunks_locally: u32,
}

/// Composes the chunk store, peer registry, and transport to serve
/// `fetch`/`file_info` against the swarm. Holds no state of its own
/// beyond the `Arc`s it wraps.
pub struct FetchOrchestrator {
    local_peer_id: String,
    chunk_store: Arc<ChunkStore>,
    peer_registry: PeerRegistry,
    transport: Arc<Transport>,
    worker_pool: usize,
}

impl FetchOrchestrator {
    pub fn new(
        local_peer_id: String,
        chunk_store: Arc<ChunkStore>,
        peer_registry: PeerRegistry,
        transport: Arc<Transport>,
        worker_pool: usize,
    ) -> Self {
        Self {
            local_peer_id,
            chunk_store,
            peer_registry,
            transport,
            worker_pool: worker_pool.max(1),
        }
    }

    /// Step 1-6 of the fetch algorithm: try local assembly first, then
    /// probe peers for chunk 0 to learn `total_chunks`, then fetch the
    /// remainder with bounded parallelism, then assemble.
    pub async fn fetch(&self, file_hash: &str, output_path: impl AsRef<std::path::Path>) -> Result<bool, FetchError> {
        if self.chunk_store.assemble_file(file_hash, output_path.as_ref()).await.is_ok() {
            return Ok(true);
        }

        let peers = self.peer_registry.active_peers().await;
        if peers.is_empty() {
            return Err(FetchError::NoActivePeers);
        }

        let total_chunks = self.fetch_chunk_zero(file_hash, &peers).await?;

        if total_chunks > 1 {
            let semaphore = Arc::new(Semaphore::new(self.worker_pool));
            let mut tasks = Vec::with_capacity((total_chunks - 1) as usize);
            for chunk_id in 1..total_chunks {
                let semaphore = semaphore.clone();
                let peers = peers.clone();
                let file_hash = file_hash.to_string();
                let from_peer_id = self.local_peer_id.clone();
                let transport = self.transport.clone();
                let chunk_store = self.chunk_store.clone();
                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore never closed");
                    fetch_one_chunk(&transport, &chunk_store, &peers, &from_peer_id, &file_hash, chunk_id, total_chunks)
                        .await
                }));
            }
            for task in tasks {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "fetch worker task panicked");
                        return Err(FetchError::ChunkUnavailable { file_hash: file_hash.to_string(), chunk_id: 0 });
                    }
                }
            }
        }

        Ok(self.chunk_store.assemble_file(file_hash, output_path).await.is_ok())
    }

    async fn fetch_chunk_zero(&self, file_hash: &str, peers: &[PeerRecord]) -> Result<u32, FetchError> {
        for peer in peers {
            let request = Message::FileRequest {
                from_peer_id: self.local_peer_id.clone(),
                file_hash: file_hash.to_string(),
                chunk_id: 0,
            };
            if let Some(Message::FileResponse { success: true, data: Some(data), total_chunks: Some(total_chunks), .. }) =
                self.transport.send(peer, request).await
            {
                self.chunk_store.put_chunk(file_hash, 0, data, total_chunks).await?;
                return Ok(total_chunks);
            }
        }
        Err(FetchError::ChunkZeroUnavailable(file_hash.to_string()))
    }

    /// Reports `{fileHash, totalChunks, estimatedSize, chunksLocally}`.
    /// Consults the local chunk store first, falling back to a
    /// chunk-0 peer probe (without fetching the rest).
    pub async fn file_info(&self, file_hash: &str) -> Option<FileInfo> {
        if let Some(total_chunks) = self.chunk_store.total_chunks_for_hash(file_hash).await {
            return Some(self.build_file_info(file_hash, total_chunks).await);
        }

        let peers = self.peer_registry.active_peers().await;
        for peer in peers {
            let request = Message::FileRequest {
                from_peer_id: self.local_peer_id.clone(),
                file_hash: file_hash.to_string(),
                chunk_id: 0,
            };
            if let Some(Message::FileResponse { success: true, total_chunks: Some(total_chunks), .. }) =
                self.transport.send(&peer, request).await
            {
                return Some(self.build_file_info(file_hash, total_chunks).await);
            }
        }
        None
    }

    async fn build_file_info(&self, file_hash: &str, total_chunks: u32) -> FileInfo {
        let mut chunks_locally = 0u32;
        let mut chunk_data_len = 0u64;
        for chunk_id in 0..total_chunks {
            if let Ok(Some(chunk)) = self.chunk_store.get_chunk(file_hash, chunk_id).await {
                chunks_locally += 1;
                if chunk_data_len == 0 {
                    chunk_data_len = chunk.data.len() as u64;
                }
            }
        }
        FileInfo {
            file_hash: file_hash.to_string(),
            total_chunks,
            estimated_size: chunk_data_len * total_chunks as u64,
            chunks_locally,
        }
    }
}

async fn fetch_one_chunk(
    transport: &Transport,
    chunk_store: &ChunkStore,
    peers: &[PeerRecord],
    from_peer_id: &str,
    file_hash: &str,
    chunk_id: u32,
    total_chunks: u32,
) -> Result<(), FetchError> {
    for peer in peers {
        let request = Message::FileRequest {
            from_peer_id: from_peer_id.to_string(),
            file_hash: file_hash.to_string(),
            chunk_id,
        };
        if let Some(Message::FileResponse { success: true, data: Some(data), .. }) = transport.send(peer, request).await {
            chunk_store.put_chunk(file_hash, chunk_id, data, total_chunks).await?;
            return Ok(());
        }
    }
    Err(FetchError::ChunkUnavailable { file_hash: file_hash.to_string(), chunk_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::transport::MessageKind;

    async fn orchestrator_for(dir: &std::path::Path, local_id: &str) -> (FetchOrchestrator, Arc<ChunkStore>, PeerRegistry, Arc<Transport>) {
        let ledger = Arc::new(Ledger::open(dir.join("ledger"), local_id.to_string(), 100).await.unwrap());
        let chunk_store = Arc::new(ChunkStore::open(dir.join("cache"), local_id.to_string(), ledger).await.unwrap());
        let peer_registry = PeerRegistry::new(local_id.to_string(), 300_000);
        let transport = Arc::new(Transport::builder().build(peer_registry.clone()));
        let orchestrator = FetchOrchestrator::new(
            local_id.to_string(),
            chunk_store.clone(),
            peer_registry.clone(),
            transport.clone(),
            10,
        );
        (orchestrator, chunk_store, peer_registry, transport)
    }

    /// Serves chunks ingested into its own chunk store over FileRequest/FileResponse.
    async fn spawn_serving_node(dir: &std::path::Path, local_id: &str) -> (std::net::SocketAddr, Arc<ChunkStore>) {
        let ledger = Arc::new(Ledger::open(dir.join("ledger"), local_id.to_string(), 100).await.unwrap());
        let chunk_store = Arc::new(ChunkStore::open(dir.join("cache"), local_id.to_string(), ledger).await.unwrap());
        let registry = PeerRegistry::new(local_id.to_string(), 300_000);
        let serving_store = chunk_store.clone();
        let transport = Transport::builder()
            .register_handler(MessageKind::FileRequest, move |msg| {
                let store = serving_store.clone();
                async move {
                    let Message::FileRequest { file_hash, chunk_id, .. } = msg else { unreachable!() };
                    match store.get_chunk(&file_hash, chunk_id).await {
                        Ok(Some(chunk)) => Some(Message::FileResponse {
                            file_hash,
                            chunk_id,
                            success: true,
                            data: Some(chunk.data),
                            total_chunks: Some(chunk.total_chunks),
                            error: None,
                        }),
                        _ => Some(Message::FileResponse {
                            file_hash,
                            chunk_id,
                            success: false,
                            data: None,
                            total_chunks: None,
                            error: Some("not found".into()),
                        }),
                    }
                }
            })
            .build(registry);
        let addr = transport.start("127.0.0.1", 0).await.unwrap();
        // Detach: the accept loop runs on its own spawned task and outlives this handle.
        (addr, chunk_store)
    }

    #[tokio::test]
    async fn fetch_prefers_local_assembly_when_already_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, chunk_store, _registry, _transport) = orchestrator_for(dir.path(), "local").await;
        let src = dir.path().join("in.bin");
        tokio::fs::write(&src, b"hello world").await.unwrap();
        let hash = chunk_store.ingest_file(&src, crate::chunk::DEFAULT_CHUNK_SIZE).await.unwrap();
        let out = dir.path().join("out.bin");
        let ok = orchestrator.fetch(&hash, &out).await.unwrap();
        assert!(ok);
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn fetch_fails_with_no_active_peers_and_nothing_local() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _chunk_store, _registry, _transport) = orchestrator_for(dir.path(), "local").await;
        let out = dir.path().join("out.bin");
        let result = orchestrator.fetch("unknown-hash", &out).await;
        assert!(matches!(result, Err(FetchError::NoActivePeers)));
    }

    #[tokio::test]
    async fn fetch_pulls_all_chunks_from_a_single_remote_peer() {
        let server_dir = tempfile::tempdir().unwrap();
        let (server_addr, server_store) = spawn_serving_node(server_dir.path(), "server").await;
        let data = vec![9u8; 2_500_000];
        let src = server_dir.path().join("in.bin");
        tokio::fs::write(&src, &data).await.unwrap();
        let hash = server_store.ingest_file(&src, crate::chunk::DEFAULT_CHUNK_SIZE).await.unwrap();

        let client_dir = tempfile::tempdir().unwrap();
        let (orchestrator, _chunk_store, registry, _transport) = orchestrator_for(client_dir.path(), "client").await;
        registry
            .add(PeerRecord::new("server".into(), server_addr.ip().to_string(), server_addr.port()))
            .await;

        let out = client_dir.path().join("out.bin");
        let ok = orchestrator.fetch(&hash, &out).await.unwrap();
        assert!(ok);
        assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    }

    #[tokio::test]
    async fn file_info_falls_back_to_peer_probe_when_nothing_local() {
        let server_dir = tempfile::tempdir().unwrap();
        let (server_addr, server_store) = spawn_serving_node(server_dir.path(), "server").await;
        let src = server_dir.path().join("in.bin");
        tokio::fs::write(&src, b"abcdefgh").await.unwrap();
        let hash = server_store.ingest_file(&src, crate::chunk::DEFAULT_CHUNK_SIZE).await.unwrap();

        let client_dir = tempfile::tempdir().unwrap();
        let (orchestrator, _chunk_store, registry, _transport) = orchestrator_for(client_dir.path(), "client").await;
        registry
            .add(PeerRecord::new("server".into(), server_addr.ip().to_string(), server_addr.port()))
            .await;

        let info = orchestrator.file_info(&hash).await.unwrap();
        assert_eq!(info.total_chunks, 1);
        assert_eq!(info.chunks_locally, 0);
    }
}
