use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use relay_protocol::{Direction, Frame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;

use crate::error::MuxError;
use crate::stream::{MuxStream, StreamEvent};
use crate::transport::MuxTransport;

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Which half of the id space a session's locally-initiated streams draw
/// from, so both ends can open streams without colliding on an id. The
/// relay server is always `Even`; agents and CLI clients are always `Odd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Even,
    Odd,
}

struct StreamSlot {
    inbound_tx: mpsc::UnboundedSender<StreamEvent>,
    peer_done_reading: Arc<AtomicBool>,
}

/// An authenticated, multiplexed session over one duplex transport.
/// At most one per agent identity, per the registry's uniqueness invariant.
pub struct Session {
    next_id: AtomicU32,
    outbound_tx: mpsc::Sender<Frame>,
    streams: Arc<Mutex<HashMap<u32, StreamSlot>>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    gone: Arc<AtomicBool>,
}

impl Session {
    /// Spawns the read/write pump and returns the session handle plus its
    /// join handle (awaiting the handle observes the transport's demise).
    pub fn new<T>(transport: T, role: Role) -> (Session, JoinHandle<()>)
    where
        T: MuxTransport + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_CHANNEL_CAPACITY);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel::<MuxStream>();
        let streams: Arc<Mutex<HashMap<u32, StreamSlot>>> = Arc::new(Mutex::new(HashMap::new()));
        let gone = Arc::new(AtomicBool::new(false));

        let start_id = match role {
            Role::Even => 2,
            Role::Odd => 1,
        };

        let session = Session {
            next_id: AtomicU32::new(start_id),
            outbound_tx: outbound_tx.clone(),
            streams: streams.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            gone: gone.clone(),
        };

        let handle = tokio::spawn(run_actor(
            transport,
            outbound_rx,
            outbound_tx,
            accept_tx,
            streams,
            gone,
        ));
        (session, handle)
    }

    /// Initiator opens a new stream (§4.B `open()`).
    pub async fn open(&self) -> Result<MuxStream, MuxError> {
        if self.gone.load(Ordering::Acquire) {
            return Err(MuxError::SessionGone);
        }
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = register_stream(id, &self.streams, &self.outbound_tx, &self.gone);
        self.outbound_tx
            .send(Frame::Open { stream_id: id })
            .await
            .map_err(|_| MuxError::SessionGone)?;
        Ok(stream)
    }

    /// Peer loops on this to receive remotely-initiated streams (§4.B
    /// `accept()`). Returns `None` once the session is gone.
    pub async fn accept(&self) -> Option<MuxStream> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await
    }

    /// Propagates to all live streams (§4.B `closeSession()`).
    pub async fn close(&self) {
        let _ = self.outbound_tx.send(Frame::GoAway).await;
    }

    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }
}

fn register_stream(
    stream_id: u32,
    streams: &Arc<Mutex<HashMap<u32, StreamSlot>>>,
    outbound_tx: &mpsc::Sender<Frame>,
    session_gone: &Arc<AtomicBool>,
) -> MuxStream {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let peer_done_reading = Arc::new(AtomicBool::new(false));
    streams.lock().unwrap().insert(
        stream_id,
        StreamSlot {
            inbound_tx,
            peer_done_reading: peer_done_reading.clone(),
        },
    );
    MuxStream {
        stream_id,
        inbound: inbound_rx,
        read_buf: None,
        read_closed: false,
        outbound: PollSender::new(outbound_tx.clone()),
        raw_outbound: outbound_tx.clone(),
        write_closed: false,
        peer_done_reading,
        session_gone: session_gone.clone(),
    }
}

fn handle_inbound(
    frame: Frame,
    outbound_tx: &mpsc::Sender<Frame>,
    accept_tx: &mpsc::UnboundedSender<MuxStream>,
    streams: &Arc<Mutex<HashMap<u32, StreamSlot>>>,
    gone: &Arc<AtomicBool>,
) {
    match frame {
        Frame::Open { stream_id } => {
            let stream = register_stream(stream_id, streams, outbound_tx, gone);
            if accept_tx.send(stream).is_err() {
                tracing::debug!(stream_id, "accept queue closed, dropping incoming stream");
                streams.lock().unwrap().remove(&stream_id);
            }
        }
        Frame::Data { stream_id, bytes } => {
            let slot = streams.lock().unwrap();
            if let Some(slot) = slot.get(&stream_id) {
                let _ = slot.inbound_tx.send(StreamEvent::Data(bytes));
            } else {
                tracing::trace!(stream_id, "data frame for unknown/closed stream, dropping");
            }
        }
        Frame::HalfClose { stream_id, dir } => {
            let slot = streams.lock().unwrap();
            if let Some(slot) = slot.get(&stream_id) {
                match dir {
                    Direction::Send => {
                        let _ = slot.inbound_tx.send(StreamEvent::Eof);
                    }
                    Direction::Receive => {
                        slot.peer_done_reading.store(true, Ordering::Release);
                    }
                }
            }
        }
        Frame::Reset { stream_id } => {
            let mut slots = streams.lock().unwrap();
            if let Some(slot) = slots.remove(&stream_id) {
                slot.peer_done_reading.store(true, Ordering::Release);
                let _ = slot.inbound_tx.send(StreamEvent::Reset);
            }
        }
        Frame::GoAway => unreachable!("GoAway is handled by the caller before dispatch"),
    }
}

async fn run_actor<T: MuxTransport>(
    mut transport: T,
    mut outbound_rx: mpsc::Receiver<Frame>,
    outbound_tx: mpsc::Sender<Frame>,
    accept_tx: mpsc::UnboundedSender<MuxStream>,
    streams: Arc<Mutex<HashMap<u32, StreamSlot>>>,
    gone: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;
            incoming = transport.recv_frame() => {
                match incoming {
                    Ok(Some(Frame::GoAway)) => break,
                    Ok(Some(frame)) => handle_inbound(frame, &outbound_tx, &accept_tx, &streams, &gone),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "mux transport recv error, tearing down session");
                        break;
                    }
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        let is_goaway = matches!(frame, Frame::GoAway);
                        if let Err(e) = transport.send_frame(frame).await {
                            tracing::debug!(error = %e, "mux transport send error, tearing down session");
                            break;
                        }
                        if is_goaway {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    gone.store(true, Ordering::Release);
    let mut streams = streams.lock().unwrap();
    streams.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc as tmpsc;

    /// An in-process transport pair wired directly to each other, standing
    /// in for a WebSocket in tests.
    struct PairedTransport {
        tx: tmpsc::UnboundedSender<Frame>,
        rx: tmpsc::UnboundedReceiver<Frame>,
    }

    impl MuxTransport for PairedTransport {
        async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
            self.tx.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn recv_frame(&mut self) -> Result<Option<Frame>, TransportError> {
            Ok(self.rx.recv().await)
        }
    }

    fn paired() -> (PairedTransport, PairedTransport) {
        let (a_tx, b_rx) = tmpsc::unbounded_channel();
        let (b_tx, a_rx) = tmpsc::unbounded_channel();
        (
            PairedTransport { tx: a_tx, rx: a_rx },
            PairedTransport { tx: b_tx, rx: b_rx },
        )
    }

    #[tokio::test]
    async fn open_accept_and_splice_data() {
        let (t1, t2) = paired();
        let (server, _h1) = Session::new(t1, Role::Even);
        let (agent, _h2) = Session::new(t2, Role::Odd);

        let agent_accept = tokio::spawn(async move { agent.accept().await });

        let mut client_stream = server.open().await.unwrap();
        let mut agent_stream = agent_accept.await.unwrap().expect("stream accepted");

        client_stream.write_all(b"hello").await.unwrap();
        client_stream.flush().await.unwrap();

        let mut buf = [0u8; 5];
        agent_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn half_close_one_direction_leaves_other_open() {
        let (t1, t2) = paired();
        let (server, _h1) = Session::new(t1, Role::Even);
        let (agent, _h2) = Session::new(t2, Role::Odd);

        let agent_accept = tokio::spawn(async move { agent.accept().await });
        let mut client_stream = server.open().await.unwrap();
        let mut agent_stream = agent_accept.await.unwrap().unwrap();

        client_stream.shutdown().await.unwrap();

        let mut buf = Vec::new();
        agent_stream.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        agent_stream.write_all(b"still alive").await.unwrap();
        agent_stream.flush().await.unwrap();
        let mut buf = [0u8; 11];
        client_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still alive");
    }

    #[tokio::test]
    async fn closing_session_errors_out_open_streams() {
        let (t1, t2) = paired();
        let (server, h1) = Session::new(t1, Role::Even);
        let (agent, h2) = Session::new(t2, Role::Odd);

        let agent_accept = tokio::spawn(async move { agent.accept().await });
        let mut client_stream = server.open().await.unwrap();
        let mut agent_stream = agent_accept.await.unwrap().unwrap();

        server.close().await;
        let _ = h1.await;
        let _ = h2.await;

        let mut buf = [0u8; 1];
        let err = client_stream.read(&mut buf).await;
        assert!(err.is_err() || matches!(err, Ok(0)));
        let err = agent_stream.write_all(b"x").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn even_and_odd_roles_never_collide() {
        let (t1, t2) = paired();
        let (server, _h1) = Session::new(t1, Role::Even);
        let (agent, _h2) = Session::new(t2, Role::Odd);

        let mut server_ids = VecDeque::new();
        for _ in 0..4 {
            server_ids.push_back(server.open().await.unwrap().stream_id());
        }
        let mut agent_ids = VecDeque::new();
        for _ in 0..4 {
            agent_ids.push_back(agent.open().await.unwrap().stream_id());
        }
        assert!(server_ids.iter().all(|id| id % 2 == 0));
        assert!(agent_ids.iter().all(|id| id % 2 == 1));
    }
}
