//! Dial path: connect with a timeout, write one frame, and for
//! response-expecting message kinds read one frame back.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::frame::{read_frame, write_frame, FrameError};
use super::message::Message;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("read timed out")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connect to `addr`, send `message`, and, only for message kinds
/// that expect one, read back a single response frame. Any failure
/// is the caller's cue to mark the destination peer inactive; this
/// function itself does not touch the peer registry.
pub async fn dial(addr: &str, message: &Message) -> Result<Option<Message>, DialError> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| DialError::ConnectTimeout)??;

    timeout(WRITE_TIMEOUT, write_frame(&mut stream, message))
        .await
        .map_err(|_| DialError::WriteTimeout)??;

    if !message.expects_response() {
        return Ok(None);
    }

    let response = timeout(READ_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| DialError::ReadTimeout)??;
    Ok(Some(response))
}
