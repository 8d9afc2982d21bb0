#[derive(Debug, Clone, thiserror::Error)]
pub enum MuxError {
    /// The session's transport has closed or errored; every stream on it
    /// terminates with this distinguishable error (§4.B).
    #[error("session gone")]
    SessionGone,
    #[error("stream reset by peer")]
    Reset,
    #[error("stream id exhausted")]
    StreamIdExhausted,
}

impl From<MuxError> for std::io::Error {
    fn from(e: MuxError) -> Self {
        let kind = match e {
            MuxError::SessionGone => std::io::ErrorKind::BrokenPipe,
            MuxError::Reset => std::io::ErrorKind::ConnectionReset,
            MuxError::StreamIdExhausted => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}
