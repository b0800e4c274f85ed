//! Accept loop: one task per inbound connection, dispatching to the
//! handler registered for the frame's message kind. No handshake or
//! encryption: read one frame, dispatch, optionally reply.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::frame::{read_frame, write_frame};
use super::HandlerMap;

pub async fn run_accept_loop(listener: TcpListener, handlers: Arc<HandlerMap>, cancel: CancellationToken) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "transport listening");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("transport accept loop stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let handlers = handlers.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, handlers).await {
                                tracing::debug!(%addr, error = %e, "connection handling failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, addr: SocketAddr, handlers: Arc<HandlerMap>) -> std::io::Result<()> {
    let message = match read_frame(&mut stream).await {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(%addr, error = %e, "malformed inbound frame");
            return Ok(());
        }
    };
    let kind = message.kind();
    let Some(handler) = handlers.get(&kind) else {
        tracing::debug!(%addr, ?kind, "no handler registered for message kind");
        return Ok(());
    };
    if let Some(response) = handler(message).await {
        if let Err(e) = write_frame(&mut stream, &response).await {
            tracing::debug!(%addr, error = %e, "failed to write response frame");
        }
    }
    Ok(())
}
