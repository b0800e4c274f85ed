//! Wire message types: one variant per kind in the peer protocol. A
//! typed `enum` round-trips the nested primitive values (strings,
//! integers, booleans, byte arrays, lists) the protocol needs via
//! `bincode`'s derive machinery.

use serde::{Deserialize, Serialize};

use crate::ledger::Block;
use crate::peer::PeerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListEntry {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Join {
        from_peer_id: PeerId,
        host: String,
        port: u16,
    },
    JoinResponse {
        success: bool,
    },
    PeerList {
        peers: Vec<PeerListEntry>,
    },
    FileRequest {
        from_peer_id: PeerId,
        file_hash: String,
        chunk_id: u32,
    },
    FileResponse {
        file_hash: String,
        chunk_id: u32,
        success: bool,
        data: Option<Vec<u8>>,
        total_chunks: Option<u32>,
        error: Option<String>,
    },
    LedgerSync {
        from_peer_id: PeerId,
        last_block_hash: String,
    },
    LedgerSyncResponse {
        blocks: Vec<Block>,
        blocks_count: u32,
    },
    LedgerEntry {
        block: Block,
    },
    Ping {
        from_peer_id: PeerId,
    },
    Pong,
}

/// Discriminant used for handler registration; `Message` itself
/// carries the payload, `MessageKind` is just the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Join,
    JoinResponse,
    PeerList,
    FileRequest,
    FileResponse,
    LedgerSync,
    LedgerSyncResponse,
    LedgerEntry,
    Ping,
    Pong,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Join { .. } => MessageKind::Join,
            Message::JoinResponse { .. } => MessageKind::JoinResponse,
            Message::PeerList { .. } => MessageKind::PeerList,
            Message::FileRequest { .. } => MessageKind::FileRequest,
            Message::FileResponse { .. } => MessageKind::FileResponse,
            Message::LedgerSync { .. } => MessageKind::LedgerSync,
            Message::LedgerSyncResponse { .. } => MessageKind::LedgerSyncResponse,
            Message::LedgerEntry { .. } => MessageKind::LedgerEntry,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong => MessageKind::Pong,
        }
    }

    /// Message types for which the dial path waits for one response frame.
    pub fn expects_response(&self) -> bool {
        matches!(
            self.kind(),
            MessageKind::Join | MessageKind::FileRequest | MessageKind::LedgerSync | MessageKind::Ping
        )
    }
}
