//! In-memory registry of known peers with liveness state and periodic
//! eviction of stale peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Opaque peer identity, generated at first boot and stable for the process lifetime.
pub type PeerId = String;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// What the registry knows about one peer. Equality is by `id`.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    pub last_seen_millis: u64,
    pub active: bool,
}

impl PartialEq for PeerRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl PeerRecord {
    pub fn new(id: PeerId, host: String, port: u16) -> Self {
        Self {
            id,
            host,
            port,
            last_seen_millis: now_millis(),
            active: true,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared, concurrent-safe map of known peers plus a background
/// eviction task. Construct with [`PeerRegistry::new`]; the eviction
/// task runs for as long as the returned [`PeerRegistry`] (and its
/// clones) are alive, and is aborted when the last handle drops.
pub struct PeerRegistry {
    local_id: PeerId,
    peers: Arc<Mutex<HashMap<PeerId, PeerRecord>>>,
    peer_timeout_millis: u64,
    eviction_task: Arc<JoinHandle<()>>,
}

impl Clone for PeerRegistry {
    fn clone(&self) -> Self {
        Self {
            local_id: self.local_id.clone(),
            peers: self.peers.clone(),
            peer_timeout_millis: self.peer_timeout_millis,
            eviction_task: self.eviction_task.clone(),
        }
    }
}

/// Remove any peer whose `last_seen_millis` is more than
/// `peer_timeout_millis` in the past. Shared by the background 60s
/// loop and [`PeerRegistry::evict_stale_peers`] so there is exactly
/// one eviction rule to test against.
fn evict_stale(peers: &mut HashMap<PeerId, PeerRecord>, peer_timeout_millis: u64) -> usize {
    let now = now_millis();
    let before = peers.len();
    peers.retain(|_, record| now.saturating_sub(record.last_seen_millis) <= peer_timeout_millis);
    before - peers.len()
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        if Arc::strong_count(&self.eviction_task) == 1 {
            self.eviction_task.abort();
        }
    }
}

const EVICTION_INTERVAL_MILLIS: u64 = 60_000;

impl PeerRegistry {
    /// Build a registry for `local_id` and start its 60s eviction task
    /// (peers silent for more than `peer_timeout_millis` are dropped).
    pub fn new(local_id: PeerId, peer_timeout_millis: u64) -> Self {
        let peers: Arc<Mutex<HashMap<PeerId, PeerRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let eviction_peers = peers.clone();
        let eviction_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(EVICTION_INTERVAL_MILLIS))
                    .await;
                let mut guard = eviction_peers.lock().await;
                let evicted = evict_stale(&mut guard, peer_timeout_millis);
                if evicted > 0 {
                    tracing::info!(evicted, remaining = guard.len(), "evicted stale peers");
                }
            }
        });
        Self {
            local_id,
            peers,
            peer_timeout_millis,
            eviction_task: Arc::new(eviction_task),
        }
    }

    /// Run one eviction pass immediately instead of waiting for the
    /// background 60s timer. The background loop and this method
    /// share the same [`evict_stale`] rule.
    pub async fn evict_stale_peers(&self) -> usize {
        let mut guard = self.peers.lock().await;
        evict_stale(&mut guard, self.peer_timeout_millis)
    }

    /// Add a peer, or refresh it if already known. Adding the local
    /// peer id is a no-op (self-exclusion). Returns `true` only when
    /// the peer was previously unknown.
    pub async fn add(&self, peer: PeerRecord) -> bool {
        if peer.id == self.local_id {
            return false;
        }
        let mut guard = self.peers.lock().await;
        match guard.get_mut(&peer.id) {
            Some(existing) => {
                existing.last_seen_millis = now_millis();
                existing.host = peer.host;
                existing.port = peer.port;
                false
            }
            None => {
                let id = peer.id.clone();
                guard.insert(peer.id.clone(), peer);
                tracing::info!(peer_id = %id, "PEER_JOIN");
                true
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<PeerRecord> {
        self.peers.lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<PeerRecord> {
        self.peers.lock().await.remove(id)
    }

    pub async fn active_peers(&self) -> Vec<PeerRecord> {
        self.peers
            .lock()
            .await
            .values()
            .filter(|p| p.active)
            .cloned()
            .collect()
    }

    pub async fn all_peers(&self) -> Vec<PeerRecord> {
        self.peers.lock().await.values().cloned().collect()
    }

    pub async fn mark_active(&self, id: &str) {
        let mut guard = self.peers.lock().await;
        if let Some(record) = guard.get_mut(id) {
            record.active = true;
            record.last_seen_millis = now_millis();
        }
    }

    pub async fn mark_inactive(&self, id: &str) {
        let mut guard = self.peers.lock().await;
        if let Some(record) = guard.get_mut(id) {
            record.active = false;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.peers.lock().await.values().filter(|p| p.active).count()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}
