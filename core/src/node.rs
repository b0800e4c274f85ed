//! Node wiring: assembles the Ledger, Chunk Store, Peer Registry,
//! Transport, and Fetch Orchestrator into one boot/shutdown sequence.

use std::path::Path;
use std::sync::Arc;

use crate::chunk::ChunkStore;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::fetch::FetchOrchestrator;
use crate::ledger::Ledger;
use crate::peer::{PeerId, PeerRecord, PeerRegistry};
use crate::transport::{Message, MessageKind, PeerListEntry, Transport};

/// A fully wired node: transport bound, peer eviction running, ready
/// to serve inbound messages and local `fetch`/`ingest` calls.
pub struct Node {
    pub local_peer_id: PeerId,
    pub config: NodeConfig,
    pub ledger: Arc<Ledger>,
    pub chunk_store: Arc<ChunkStore>,
    pub peer_registry: PeerRegistry,
    pub transport: Arc<Transport>,
    pub fetch: Arc<FetchOrchestrator>,
    local_addr: std::net::SocketAddr,
}

impl Node {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Ingest a local file into the chunk store using the node's
    /// configured `chunk_size`. Thin wrapper the embedding driver
    /// calls for local `cache put` commands.
    pub async fn ingest_file(&self, file: impl AsRef<Path>) -> Result<String, NodeError> {
        Ok(self.chunk_store.ingest_file(file, self.config.chunk_size).await?)
    }

    /// Fetch a file by fingerprint from the swarm, assembling it at
    /// `output_path`. Thin wrapper over [`FetchOrchestrator::fetch`]
    /// for the embedding driver's local `cache get` commands.
    pub async fn fetch_file(&self, file_hash: &str, output_path: impl AsRef<Path>) -> Result<bool, crate::fetch::FetchError> {
        self.fetch.fetch(file_hash, output_path).await
    }

    /// Boot order: Ledger reload → Chunk Store warm-load → Transport
    /// bind → Peer Registry eviction timer (already running once
    /// `PeerRegistry::new` returns) → optional bootstrap dial.
    pub async fn bootstrap(config: NodeConfig) -> Result<Self, NodeError> {
        let local_peer_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(peer_id = %local_peer_id, "booting node");

        let ledger = Arc::new(
            Ledger::open(
                Path::new(&config.ledger_dir),
                local_peer_id.clone(),
                config.max_actions_per_block,
            )
            .await?,
        );
        let chunk_store = Arc::new(
            ChunkStore::open(Path::new(&config.cache_dir), local_peer_id.clone(), ledger.clone()).await?,
        );
        let peer_registry = PeerRegistry::new(local_peer_id.clone(), config.peer_timeout_millis);

        let transport = Arc::new(build_transport(local_peer_id.clone(), ledger.clone(), chunk_store.clone(), peer_registry.clone()));
        let local_addr = transport.start(&config.bind_host, config.bind_port).await?;
        tracing::info!(%local_addr, "transport bound");

        spawn_ledger_gossip(ledger.clone(), transport.clone()).await;

        let fetch = Arc::new(FetchOrchestrator::new(
            local_peer_id.clone(),
            chunk_store.clone(),
            peer_registry.clone(),
            transport.clone(),
            config.fetch_worker_pool,
        ));

        let node = Self {
            local_peer_id,
            config,
            ledger,
            chunk_store,
            peer_registry,
            transport,
            fetch,
            local_addr,
        };

        if let Some(bootstrap_addr) = node.config.bootstrap_peer.clone() {
            node.join_via(&bootstrap_addr).await;
        }

        Ok(node)
    }

    /// Dial `bootstrap_addr` with JOIN, and on success pull its chain
    /// via a LEDGER_SYNC call carrying our own tip hash.
    async fn join_via(&self, bootstrap_addr: &str) {
        let Some((host, port)) = bootstrap_addr.rsplit_once(':').and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p))) else {
            tracing::warn!(bootstrap_addr, "malformed bootstrap peer address, skipping join");
            return;
        };
        let bootstrap_peer = PeerRecord::new(bootstrap_addr.to_string(), host.clone(), port);

        let join = Message::Join {
            from_peer_id: self.local_peer_id.clone(),
            host: self.config.bind_host.clone(),
            port: self.local_addr.port(),
        };
        let Some(Message::JoinResponse { success: true }) = self.transport.send(&bootstrap_peer, join).await else {
            tracing::warn!(bootstrap_addr, "join rejected or unreachable");
            return;
        };
        self.peer_registry.add(PeerRecord::new(bootstrap_addr.to_string(), host, port)).await;
        tracing::info!(bootstrap_addr, "joined bootstrap peer");

        let last_block_hash = self.ledger.last_block().await.block_hash;
        let sync = Message::LedgerSync { from_peer_id: self.local_peer_id.clone(), last_block_hash };
        if let Some(Message::LedgerSyncResponse { blocks, .. }) = self.transport.send(&bootstrap_peer, sync).await {
            for block in blocks {
                if let Err(e) = self.ledger.add_block(block).await {
                    tracing::warn!(error = %e, "failed to persist synced block");
                }
            }
        }
    }

    /// Stop accepting, seal any open block with pending actions, and
    /// return. The peer-registry eviction task stops when the last
    /// `PeerRegistry` clone (held here) drops.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.transport.stop().await;
        self.ledger.seal_current_block().await?;
        tracing::info!("node shut down");
        Ok(())
    }
}

/// Drain the ledger's sealed-block channel for the lifetime of the
/// node and gossip each one to every active peer as a `LEDGER_ENTRY`
/// (the consuming `LedgerEntry` handler already lives in
/// [`build_transport`]). Fire-and-forget, same as
/// `Transport::broadcast` itself: a stalled or dead peer never blocks
/// gossip of the next sealed block.
async fn spawn_ledger_gossip(ledger: Arc<Ledger>, transport: Arc<Transport>) {
    let mut sealed_blocks = ledger
        .take_seal_receiver()
        .await
        .expect("seal receiver is taken exactly once, at boot");
    tokio::spawn(async move {
        while let Some(block) = sealed_blocks.recv().await {
            tracing::debug!(block_id = %block.block_id, "gossiping sealed block");
            transport.broadcast(Message::LedgerEntry { block }).await;
        }
    });
}

fn build_transport(local_peer_id: PeerId, ledger: Arc<Ledger>, chunk_store: Arc<ChunkStore>, peer_registry: PeerRegistry) -> Transport {
    let join_registry = peer_registry.clone();
    let join_ledger = ledger.clone();
    let join_transport_id = local_peer_id.clone();

    let peer_list_registry = peer_registry.clone();

    let file_chunk_store = chunk_store.clone();

    let sync_ledger = ledger.clone();

    let entry_ledger = ledger.clone();

    Transport::builder()
        .register_handler(MessageKind::Join, move |msg| {
            let registry = join_registry.clone();
            let ledger = join_ledger.clone();
            let local_peer_id = join_transport_id.clone();
            async move {
                let Message::Join { from_peer_id, host, port } = msg else { unreachable!("dispatched by kind") };
                let peer = PeerRecord::new(from_peer_id.clone(), host.clone(), port);
                registry.add(peer.clone()).await;

                let registry = registry.clone();
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    notify_new_peer(local_peer_id, registry, ledger, peer).await;
                });

                Some(Message::JoinResponse { success: true })
            }
        })
        .register_handler(MessageKind::PeerList, move |msg| {
            let registry = peer_list_registry.clone();
            async move {
                let Message::PeerList { peers } = msg else { unreachable!("dispatched by kind") };
                for entry in peers {
                    registry.add(PeerRecord::new(entry.id, entry.host, entry.port)).await;
                }
                None
            }
        })
        .register_handler(MessageKind::FileRequest, move |msg| {
            let chunk_store = file_chunk_store.clone();
            async move {
                let Message::FileRequest { file_hash, chunk_id, .. } = msg else { unreachable!("dispatched by kind") };
                match chunk_store.get_chunk(&file_hash, chunk_id).await {
                    Ok(Some(chunk)) => Some(Message::FileResponse {
                        file_hash,
                        chunk_id,
                        success: true,
                        data: Some(chunk.data),
                        total_chunks: Some(chunk.total_chunks),
                        error: None,
                    }),
                    Ok(None) => Some(Message::FileResponse {
                        file_hash,
                        chunk_id,
                        success: false,
                        data: None,
                        total_chunks: None,
                        error: Some("chunk not found".to_string()),
                    }),
                    Err(e) => Some(Message::FileResponse {
                        file_hash,
                        chunk_id,
                        success: false,
                        data: None,
                        total_chunks: None,
                        error: Some(e.to_string()),
                    }),
                }
            }
        })
        .register_handler(MessageKind::LedgerSync, move |msg| {
            let ledger = sync_ledger.clone();
            async move {
                let Message::LedgerSync { last_block_hash, .. } = msg else { unreachable!("dispatched by kind") };
                let blocks = ledger.get_blocks_since(&last_block_hash).await;
                let blocks_count = blocks.len() as u32;
                Some(Message::LedgerSyncResponse { blocks, blocks_count })
            }
        })
        .register_handler(MessageKind::LedgerEntry, move |msg| {
            let ledger = entry_ledger.clone();
            async move {
                let Message::LedgerEntry { block } = msg else { unreachable!("dispatched by kind") };
                if let Err(e) = ledger.add_block(block).await {
                    tracing::warn!(error = %e, "failed to persist gossiped block");
                }
                None
            }
        })
        .register_handler(MessageKind::Ping, move |msg| async move {
            let Message::Ping { .. } = msg else { unreachable!("dispatched by kind") };
            Some(Message::Pong)
        })
        .build(peer_registry)
}

/// The asynchronous half of the join flow: push our other known peers
/// to the new peer, then pull its chain via the same LEDGER_SYNC call
/// a client makes, merging anything it returns.
async fn notify_new_peer(local_peer_id: PeerId, registry: PeerRegistry, ledger: Arc<Ledger>, new_peer: PeerRecord) {
    let transport = Transport::builder().build(registry.clone());

    let peers: Vec<PeerListEntry> = registry
        .active_peers()
        .await
        .into_iter()
        .filter(|p| p.id != new_peer.id)
        .map(|p| PeerListEntry { id: p.id, host: p.host, port: p.port })
        .collect();
    let _ = transport.send(&new_peer, Message::PeerList { peers }).await;

    let last_block_hash = ledger.last_block().await.block_hash;
    let sync = Message::LedgerSync { from_peer_id: local_peer_id, last_block_hash };
    if let Some(Message::LedgerSyncResponse { blocks, .. }) = transport.send(&new_peer, sync).await {
        for block in blocks {
            if let Err(e) = ledger.add_block(block).await {
                tracing::warn!(error = %e, "failed to persist block from new peer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(dir: &Path, bind_port: u16, bootstrap_peer: Option<String>) -> NodeConfig {
        let mut c = NodeConfig::default();
        c.bind_host = "127.0.0.1".to_string();
        c.bind_port = bind_port;
        c.ledger_dir = dir.join("ledger").to_string_lossy().into_owned();
        c.cache_dir = dir.join("cache").to_string_lossy().into_owned();
        c.bootstrap_peer = bootstrap_peer;
        c.peer_timeout_millis = 300_000;
        c
    }

    #[tokio::test]
    async fn bootstrap_binds_transport_and_opens_a_fresh_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::bootstrap(config_for(dir.path(), 0, None)).await.unwrap();
        assert_eq!(node.ledger.chain_size().await, 1);
        assert_eq!(node.peer_registry.active_count().await, 0);
        assert!(node.local_addr().port() > 0);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn second_node_joins_first_and_both_register_each_other() {
        let dir_a = tempfile::tempdir().unwrap();
        let node_a = Node::bootstrap(config_for(dir_a.path(), 0, None)).await.unwrap();

        let bootstrap_addr = format!("127.0.0.1:{}", node_a.local_addr().port());
        let dir_b = tempfile::tempdir().unwrap();
        let node_b = Node::bootstrap(config_for(dir_b.path(), 0, Some(bootstrap_addr))).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(node_a.peer_registry.active_count().await, 1);
        assert_eq!(node_b.peer_registry.active_count().await, 1);

        node_a.shutdown().await.unwrap();
        node_b.shutdown().await.unwrap();
    }

    /// A node bootstraps from a peer and fetches a file it has never
    /// seen, entirely over the wire.
    #[tokio::test]
    async fn two_peer_fetch_retrieves_a_file_introduced_only_on_the_bootstrap_peer() {
        let dir_a = tempfile::tempdir().unwrap();
        let node_a = Node::bootstrap(config_for(dir_a.path(), 0, None)).await.unwrap();

        let mut data = vec![0u8; 1_048_577];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let src = dir_a.path().join("in.bin");
        tokio::fs::write(&src, &data).await.unwrap();
        let hash = node_a.chunk_store.ingest_file(&src, crate::chunk::DEFAULT_CHUNK_SIZE).await.unwrap();
        assert_eq!(node_a.chunk_store.total_chunks_for_hash(&hash).await, Some(2));

        let bootstrap_addr = format!("127.0.0.1:{}", node_a.local_addr().port());
        let dir_b = tempfile::tempdir().unwrap();
        let node_b = Node::bootstrap(config_for(dir_b.path(), 0, Some(bootstrap_addr))).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let out = dir_b.path().join("out.bin");
        let ok = node_b.fetch.fetch(&hash, &out).await.unwrap();
        assert!(ok);
        assert_eq!(node_b.chunk_store.chunk_count().await, 2);
        assert_eq!(tokio::fs::read(&out).await.unwrap(), data);

        node_a.shutdown().await.unwrap();
        node_b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ingest_file_and_fetch_file_wrappers_round_trip_locally() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::bootstrap(config_for(dir.path(), 0, None)).await.unwrap();

        let src = dir.path().join("in.bin");
        tokio::fs::write(&src, b"hello via node wrapper").await.unwrap();
        let hash = node.ingest_file(&src).await.unwrap();

        let out = dir.path().join("out.bin");
        let ok = node.fetch_file(&hash, &out).await.unwrap();
        assert!(ok);
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"hello via node wrapper");

        node.shutdown().await.unwrap();
    }

    /// Sealing a block on one node gossips it to an already-joined
    /// peer as a `LEDGER_ENTRY`, without a second `LEDGER_SYNC` round.
    #[tokio::test]
    async fn sealing_a_block_gossips_it_to_active_peers() {
        let dir_a = tempfile::tempdir().unwrap();
        let mut config_a = config_for(dir_a.path(), 0, None);
        config_a.max_actions_per_block = 1;
        let node_a = Node::bootstrap(config_a).await.unwrap();

        let bootstrap_addr = format!("127.0.0.1:{}", node_a.local_addr().port());
        let dir_b = tempfile::tempdir().unwrap();
        let node_b = Node::bootstrap(config_for(dir_b.path(), 0, Some(bootstrap_addr))).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let chain_size_before = node_b.ledger.chain_size().await;

        let src = dir_a.path().join("in.bin");
        tokio::fs::write(&src, b"trigger a seal").await.unwrap();
        node_a.ingest_file(&src).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        assert!(node_b.ledger.chain_size().await > chain_size_before);
        assert!(node_b.ledger.validate_chain().await);

        node_a.shutdown().await.unwrap();
        node_b.shutdown().await.unwrap();
    }
}
