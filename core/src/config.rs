//! Node configuration: defaults plus environment-variable overrides.
//!
//! Discovering and parsing a config *file* is the embedding driver's
//! job; this module only defines the struct, its defaults, and the
//! env-var override half.

use serde::{Deserialize, Serialize};

/// Tunables and addresses a node needs to boot. Construct with
/// [`NodeConfig::default`] and override fields, or call
/// [`NodeConfig::from_env`] to layer `SWARMCACHE_*` environment
/// variables on top of the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Host the transport listener binds to.
    pub bind_host: String,
    /// Port the transport listener binds to.
    pub bind_port: u16,
    /// Directory holding persisted ledger blocks.
    pub ledger_dir: String,
    /// Directory holding persisted chunk files.
    pub cache_dir: String,
    /// Optional `host:port` of a peer to dial at boot and JOIN through.
    pub bootstrap_peer: Option<String>,
    /// Bytes per chunk. Spec default: 1 MiB.
    pub chunk_size: u64,
    /// Actions accumulated before a block is sealed. Spec default: 100.
    pub max_actions_per_block: usize,
    /// Milliseconds of silence before a peer is evicted. Spec default: 5 minutes.
    pub peer_timeout_millis: u64,
    /// Bounded worker-pool size for parallel chunk fetch. Spec default: 10.
    pub fetch_worker_pool: usize,
}

fn default_chunk_size() -> u64 {
    1024 * 1024
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 7654,
            ledger_dir: "./data/ledger".to_string(),
            cache_dir: "./data/cache".to_string(),
            bootstrap_peer: None,
            chunk_size: default_chunk_size(),
            max_actions_per_block: 100,
            peer_timeout_millis: 5 * 60 * 1000,
            fetch_worker_pool: 10,
        }
    }
}

impl NodeConfig {
    /// Layer `SWARMCACHE_*` environment variable overrides onto the defaults.
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = std::env::var("SWARMCACHE_BIND_HOST") {
            c.bind_host = v;
        }
        if let Ok(v) = std::env::var("SWARMCACHE_BIND_PORT") {
            if let Ok(p) = v.parse() {
                c.bind_port = p;
            }
        }
        if let Ok(v) = std::env::var("SWARMCACHE_LEDGER_DIR") {
            c.ledger_dir = v;
        }
        if let Ok(v) = std::env::var("SWARMCACHE_CACHE_DIR") {
            c.cache_dir = v;
        }
        if let Ok(v) = std::env::var("SWARMCACHE_BOOTSTRAP_PEER") {
            c.bootstrap_peer = Some(v);
        }
        if let Ok(v) = std::env::var("SWARMCACHE_CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                c.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("SWARMCACHE_MAX_ACTIONS_PER_BLOCK") {
            if let Ok(n) = v.parse() {
                c.max_actions_per_block = n;
            }
        }
        if let Ok(v) = std::env::var("SWARMCACHE_PEER_TIMEOUT_MILLIS") {
            if let Ok(n) = v.parse() {
                c.peer_timeout_millis = n;
            }
        }
        if let Ok(v) = std::env::var("SWARMCACHE_FETCH_WORKER_POOL") {
            if let Ok(n) = v.parse() {
                c.fetch_worker_pool = n;
            }
        }
        c
    }

    /// Parse a config from TOML text, falling back to defaults for
    /// unset fields. File discovery (which path to read, whether one
    /// exists at all) belongs to the embedding driver.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
