//! A multi-stream session over a message-framed duplex transport (§4.B).
//!
//! Either end of a [`Session`] may [`Session::open`] an independent,
//! flow-controlled, FIFO byte stream; the peer receives it through
//! [`Session::accept`]. Streams implement `AsyncRead`/`AsyncWrite` directly
//! so they splice naturally with `tokio::io::copy_bidirectional`.

mod error;
mod session;
mod stream;
mod transport;

pub use error::MuxError;
pub use session::{Role, Session};
pub use stream::MuxStream;
pub use transport::{MuxTransport, TransportError};
