//! The duplex, message-framed transport a [`crate::Session`] is built on.
//!
//! Anything that can send and receive whole [`relay_protocol::Frame`]s —
//! an `axum` WebSocket, a `tokio_tungstenite` client socket, an in-memory
//! pair for tests — implements this.

use relay_protocol::Frame;
use std::future::Future;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("frame codec error: {0}")]
    Codec(#[from] relay_protocol::MuxFrameError),
    #[error("transport I/O error: {0}")]
    Io(String),
}

pub trait MuxTransport: Send {
    fn send_frame(&mut self, frame: Frame) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// `Ok(None)` signals a clean close.
    fn recv_frame(&mut self) -> impl Future<Output = Result<Option<Frame>, TransportError>> + Send;
}
