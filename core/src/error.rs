//! Top-level error type for node bootstrap and shutdown.
//!
//! Per-subsystem errors live next to the code that raises them
//! (`ledger::LedgerError`, `chunk::ChunkStoreError`,
//! `transport::TransportError`, `fetch::FetchError`); this enum only
//! aggregates the ones that can surface out of `Node::bootstrap`.

use crate::chunk::ChunkStoreError;
use crate::ledger::LedgerError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("chunk store error: {0}")]
    ChunkStore(#[from] ChunkStoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
