//! Framed transport: length-prefixed message encode/decode over a
//! TCP stream, a multi-connection accept loop, and a dial path with
//! timeouts. See `frame`, `server`, `client` for the pieces; this
//! module ties them to a [`crate::peer::PeerRegistry`] so send/dial
//! failures mark the destination peer inactive.

mod client;
mod frame;
mod message;
mod server;

pub use frame::FrameError;
pub use message::{Message, MessageKind, PeerListEntry};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::peer::{PeerRecord, PeerRegistry};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<Message>> + Send>>;
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;
pub(crate) type HandlerMap = HashMap<MessageKind, Handler>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport already started")]
    AlreadyStarted,
}

/// Accumulates handlers before [`Transport::start`]; once started,
/// the handler map is immutable (populated during init, read-only
/// thereafter).
#[derive(Default)]
pub struct TransportBuilder {
    handlers: HandlerMap,
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<F, Fut>(mut self, kind: MessageKind, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Message>> + Send + 'static,
    {
        self.handlers.insert(kind, Arc::new(move |msg| Box::pin(handler(msg)) as HandlerFuture));
        self
    }

    pub fn build(self, peer_registry: PeerRegistry) -> Transport {
        Transport {
            handlers: Arc::new(self.handlers),
            peer_registry,
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
        }
    }
}

/// The transport itself only synchronizes the handler map (immutable
/// after `start`) and the listen socket's lifecycle; all application
/// state protection belongs to the Ledger and Chunk Store.
pub struct Transport {
    handlers: Arc<HandlerMap>,
    peer_registry: PeerRegistry,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    /// Bind `bind_host:bind_port` and start the accept loop on its
    /// own task. Each accepted connection is, in turn, handled on its
    /// own task (see `server::run_accept_loop`). Returns the bound
    /// address (useful when `bind_port` is `0`, e.g. in tests).
    pub async fn start(&self, bind_host: &str, bind_port: u16) -> Result<std::net::SocketAddr, TransportError> {
        let mut guard = self.accept_task.lock().await;
        if guard.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let listener = tokio::net::TcpListener::bind((bind_host, bind_port)).await?;
        let local_addr = listener.local_addr()?;

        let handlers = self.handlers.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = server::run_accept_loop(listener, handlers, cancel).await {
                tracing::error!(error = %e, "transport accept loop exited with error");
            }
        });
        *guard = Some(task);
        Ok(local_addr)
    }

    /// Stop accepting new connections. In-flight handlers are left to
    /// finish; callers that need "no actions lost" semantics (the
    /// ledger) must seal their own pending state before calling this.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Send `message` to `peer`. Any failure (connect/read/write
    /// timeout, malformed frame) marks `peer` inactive and returns
    /// `None`; never propagates beyond that.
    pub async fn send(&self, peer: &PeerRecord, message: Message) -> Option<Message> {
        match client::dial(&peer.addr(), &message).await {
            Ok(response) => {
                self.peer_registry.mark_active(&peer.id).await;
                response
            }
            Err(e) => {
                tracing::debug!(peer_id = %peer.id, error = %e, "send failed, marking peer inactive");
                self.peer_registry.mark_inactive(&peer.id).await;
                None
            }
        }
    }

    /// Fire-and-forget `message` to every currently active peer. No
    /// ordering guarantee across peers; a per-peer failure does not
    /// affect any other peer.
    pub async fn broadcast(&self, message: Message) {
        let peers = self.peer_registry.active_peers().await;
        for peer in peers {
            let message = message.clone();
            let registry = self.peer_registry.clone();
            tokio::spawn(async move {
                if let Err(e) = client::dial(&peer.addr(), &message).await {
                    tracing::debug!(peer_id = %peer.id, error = %e, "broadcast send failed");
                    registry.mark_inactive(&peer.id).await;
                } else {
                    registry.mark_active(&peer.id).await;
                }
            });
        }
    }
}
