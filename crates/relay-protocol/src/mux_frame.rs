//! Wire format for the stream multiplexer (§4.B).
//!
//! Frames ride as binary WebSocket messages on the agent-relay control
//! channel and on the stdio-over-websocket user surface. Each frame is a
//! fixed 10-byte header followed by an optional payload:
//!
//! ```text
//! [0..4]  magic: 0x52584d58 ("RXMX")
//! [4]     version: 1
//! [5]     kind: FrameKind as u8
//! [6..10] stream_id (u32, little-endian)
//! [10..]  payload (kind-dependent; empty for Open/HalfClose/Reset/GoAway)
//! ```
//!
//! `Data` and `HalfClose` frames additionally encode their fields in the
//! payload via `bincode` so the header stays fixed-size across all kinds.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const MUX_HEADER_SIZE: usize = 10;
pub const MUX_MAGIC: u32 = 0x584d_5852; // "RXMX" in LE
pub const MUX_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    Open = 0,
    Data = 1,
    HalfClose = 2,
    Reset = 3,
    GoAway = 4,
}

impl FrameKind {
    fn from_u8(b: u8) -> Result<Self, MuxFrameError> {
        Ok(match b {
            0 => FrameKind::Open,
            1 => FrameKind::Data,
            2 => FrameKind::HalfClose,
            3 => FrameKind::Reset,
            4 => FrameKind::GoAway,
            other => return Err(MuxFrameError::UnknownKind(other)),
        })
    }
}

/// Which direction of a stream is being half-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// No more data will be sent by the frame's originator.
    Send,
    /// The originator will no longer read; further data may be dropped.
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Initiator opens a new stream with the given id.
    Open { stream_id: u32 },
    /// A chunk of stream payload.
    Data { stream_id: u32, bytes: Bytes },
    /// One direction of a stream is closing; the other may continue.
    HalfClose { stream_id: u32, dir: Direction },
    /// Abrupt, non-graceful stream teardown (e.g. quota rejection).
    Reset { stream_id: u32 },
    /// The whole session is going away; every open stream must be torn down.
    GoAway,
}

impl Frame {
    fn stream_id(&self) -> u32 {
        match self {
            Frame::Open { stream_id }
            | Frame::Data { stream_id, .. }
            | Frame::HalfClose { stream_id, .. }
            | Frame::Reset { stream_id } => *stream_id,
            Frame::GoAway => 0,
        }
    }

    fn kind(&self) -> FrameKind {
        match self {
            Frame::Open { .. } => FrameKind::Open,
            Frame::Data { .. } => FrameKind::Data,
            Frame::HalfClose { .. } => FrameKind::HalfClose,
            Frame::Reset { .. } => FrameKind::Reset,
            Frame::GoAway => FrameKind::GoAway,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MUX_HEADER_SIZE + 16);
        buf.extend_from_slice(&MUX_MAGIC.to_le_bytes());
        buf.extend_from_slice(&[MUX_VERSION, self.kind() as u8]);
        buf.extend_from_slice(&self.stream_id().to_le_bytes());
        match self {
            Frame::Data { bytes, .. } => buf.extend_from_slice(bytes),
            Frame::HalfClose { dir, .. } => {
                buf.extend_from_slice(&bincode::serialize(dir).expect("Direction encodes"));
            }
            Frame::Open { .. } | Frame::Reset { .. } | Frame::GoAway => {}
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MuxFrameError> {
        if buf.len() < MUX_HEADER_SIZE {
            return Err(MuxFrameError::TooShort(buf.len()));
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MUX_MAGIC {
            return Err(MuxFrameError::BadMagic(magic));
        }
        let version = buf[4];
        if version != MUX_VERSION {
            return Err(MuxFrameError::UnsupportedVersion(version));
        }
        let kind = FrameKind::from_u8(buf[5])?;
        let stream_id = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let payload = &buf[MUX_HEADER_SIZE..];
        Ok(match kind {
            FrameKind::Open => Frame::Open { stream_id },
            FrameKind::Data => Frame::Data {
                stream_id,
                bytes: Bytes::copy_from_slice(payload),
            },
            FrameKind::HalfClose => Frame::HalfClose {
                stream_id,
                dir: bincode::deserialize(payload).map_err(|_| MuxFrameError::BadPayload)?,
            },
            FrameKind::Reset => Frame::Reset { stream_id },
            FrameKind::GoAway => Frame::GoAway,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MuxFrameError {
    #[error("buffer too short: {0} bytes (need at least {MUX_HEADER_SIZE})")]
    TooShort(usize),
    #[error("bad magic: 0x{0:08x} (expected 0x{MUX_MAGIC:08x})")]
    BadMagic(u32),
    #[error("unsupported version: {0} (expected {MUX_VERSION})")]
    UnsupportedVersion(u8),
    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),
    #[error("malformed frame payload")]
    BadPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_roundtrip() {
        let f = Frame::Open { stream_id: 7 };
        assert_eq!(Frame::decode(&f.encode()).unwrap(), f);
    }

    #[test]
    fn data_roundtrip() {
        let f = Frame::Data {
            stream_id: 3,
            bytes: Bytes::from_static(b"hello world"),
        };
        assert_eq!(Frame::decode(&f.encode()).unwrap(), f);
    }

    #[test]
    fn half_close_roundtrip_both_directions() {
        for dir in [Direction::Send, Direction::Receive] {
            let f = Frame::HalfClose { stream_id: 1, dir };
            assert_eq!(Frame::decode(&f.encode()).unwrap(), f);
        }
    }

    #[test]
    fn reset_and_goaway_roundtrip() {
        assert_eq!(
            Frame::decode(&Frame::Reset { stream_id: 9 }.encode()).unwrap(),
            Frame::Reset { stream_id: 9 }
        );
        assert_eq!(Frame::decode(&Frame::GoAway.encode()).unwrap(), Frame::GoAway);
    }

    #[test]
    fn decode_too_short() {
        let buf = [0u8; 4];
        match Frame::decode(&buf) {
            Err(MuxFrameError::TooShort(4)) => {}
            other => panic!("expected TooShort(4), got {other:?}"),
        }
    }

    #[test]
    fn decode_bad_magic() {
        let mut buf = [0u8; MUX_HEADER_SIZE];
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        match Frame::decode(&buf) {
            Err(MuxFrameError::BadMagic(0xDEADBEEF)) => {}
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn decode_unknown_kind() {
        let mut buf = [0u8; MUX_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MUX_MAGIC.to_le_bytes());
        buf[4] = MUX_VERSION;
        buf[5] = 0xFF;
        assert!(matches!(Frame::decode(&buf), Err(MuxFrameError::UnknownKind(0xFF))));
    }

    #[test]
    fn empty_data_payload_roundtrips() {
        let f = Frame::Data {
            stream_id: 0,
            bytes: Bytes::new(),
        };
        assert_eq!(Frame::decode(&f.encode()).unwrap(), f);
    }
}
