use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use relay_protocol::{Direction, Frame};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::error::MuxError;

#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Eof,
    Reset,
}

/// One independent duplex byte channel inside a [`crate::Session`].
///
/// Implements `AsyncRead`/`AsyncWrite` so callers can
/// `tokio::io::copy_bidirectional` it against a TCP socket or an HTTP body,
/// exactly as the gateway and agent bridges need.
pub struct MuxStream {
    pub(crate) stream_id: u32,
    pub(crate) inbound: mpsc::UnboundedReceiver<StreamEvent>,
    pub(crate) read_buf: Option<Bytes>,
    pub(crate) read_closed: bool,
    pub(crate) outbound: PollSender<Frame>,
    pub(crate) raw_outbound: mpsc::Sender<Frame>,
    pub(crate) write_closed: bool,
    pub(crate) peer_done_reading: Arc<AtomicBool>,
    pub(crate) session_gone: Arc<AtomicBool>,
}

impl MuxStream {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if let Some(chunk) = self.read_buf.take() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.read_buf = Some(chunk.slice(n..));
                }
                return Poll::Ready(Ok(()));
            }
            if self.read_closed {
                return Poll::Ready(Ok(()));
            }
            match self.inbound.poll_recv(cx) {
                Poll::Ready(Some(StreamEvent::Data(bytes))) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    self.read_buf = Some(bytes);
                    continue;
                }
                Poll::Ready(Some(StreamEvent::Eof)) => {
                    self.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(StreamEvent::Reset)) => {
                    self.read_closed = true;
                    return Poll::Ready(Err(MuxError::Reset.into()));
                }
                Poll::Ready(None) => {
                    self.read_closed = true;
                    if self.session_gone.load(Ordering::Acquire) {
                        return Poll::Ready(Err(MuxError::SessionGone.into()));
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(MuxError::SessionGone.into()));
        }
        if self.peer_done_reading.load(Ordering::Acquire) {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer is no longer reading this stream",
            )));
        }
        match self.outbound.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let stream_id = self.stream_id;
                let frame = Frame::Data {
                    stream_id,
                    bytes: Bytes::copy_from_slice(buf),
                };
                match self.outbound.send_item(frame) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(_) => {
                        self.write_closed = true;
                        Poll::Ready(Err(MuxError::SessionGone.into()))
                    }
                }
            }
            Poll::Ready(Err(_)) => {
                self.write_closed = true;
                Poll::Ready(Err(MuxError::SessionGone.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if !self.write_closed {
            self.write_closed = true;
            let _ = self.raw_outbound.try_send(Frame::HalfClose {
                stream_id: self.stream_id,
                dir: Direction::Send,
            });
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.write_closed {
            let _ = self.raw_outbound.try_send(Frame::HalfClose {
                stream_id: self.stream_id,
                dir: Direction::Send,
            });
        }
    }
}
