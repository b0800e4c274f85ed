//! `swarmcache-core`: the chunked content store, peer overlay, and
//! hash-chained action ledger behind a symmetric peer-to-peer content
//! distribution node.
//!
//! Every node embedding this crate can upload, serve, fetch, and
//! participate in ledger replication; there is no distinguished server
//! role. The interactive driver, config-file discovery, metrics
//! reporting, and any HTTP control surface are the embedding binary's
//! job; see `core::config` and `core::node` for the seams.

pub mod chunk;
pub mod config;
pub mod error;
pub mod fetch;
pub mod ledger;
pub mod node;
pub mod peer;
pub mod transport;

pub use config::NodeConfig;
pub use node::Node;
