//! A single TCP connection to one remote peer: handshake, choke/interest
//! state, bitfield, and the keep-alive/idle-watchdog pair that keep a
//! connection that's gone quiet from lingering forever.
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::instrument;

use super::handshake::Handshake;
use super::message::{Bitfield, Message, PeerWireError, PeerWireResult};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(180);

/// The four choke/interest booleans from the protocol's point of view,
/// starting at `(true, false, true, false)` for every newly dialed
/// connection.
#[derive(Debug, Clone, Copy)]
pub struct ChokeState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokeState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Owns one TCP link to one remote peer.
pub struct PeerConnection {
    reader: ReadHalf<TcpStream>,
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
    last_write: Arc<Mutex<Instant>>,
    pub remote_peer_id: [u8; 20],
    pub state: ChokeState,
    pub bitfield: Bitfield,
    received_first_message: bool,
    keepalive_task: tokio::task::JoinHandle<()>,
}

impl PeerConnection {
    /// Dials `addr`, enforcing the 5 s TCP connect deadline, then performs
    /// the handshake and spawns the keep-alive sender.
    #[instrument(skip(info_hash, peer_id), fields(%addr))]
    pub async fn connect(
        addr: std::net::SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        num_pieces: usize,
    ) -> PeerWireResult<PeerConnection> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                PeerWireError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "TCP dial timed out",
                ))
            })??;

        Self::from_stream(stream, info_hash, peer_id, num_pieces).await
    }

    /// Performs the handshake over an already-connected stream (dialer or
    /// accepted-inbound side) and wraps it as a [`PeerConnection`].
    pub async fn from_stream(
        mut stream: TcpStream,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        num_pieces: usize,
    ) -> PeerWireResult<PeerConnection> {
        Handshake::new(info_hash, peer_id)
            .write_to(&mut stream)
            .await?;
        let remote = Handshake::read_from(&mut stream).await?;
        if remote.info_hash != info_hash {
            return Err(PeerWireError::HandshakeMismatch);
        }

        let (reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(writer));
        let last_write = Arc::new(Mutex::new(Instant::now()));

        let keepalive_task = spawn_keepalive_sender(writer.clone(), last_write.clone());

        Ok(PeerConnection {
            reader,
            writer,
            last_write,
            remote_peer_id: remote.peer_id,
            state: ChokeState::default(),
            bitfield: Bitfield::empty(num_pieces),
            received_first_message: false,
            keepalive_task,
        })
    }

    /// Sends a message, refreshing the outbound-silence clock the
    /// keep-alive sender watches.
    pub async fn send(&self, message: &Message) -> PeerWireResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&message.encode()).await?;
        *self.last_write.lock().await = Instant::now();
        Ok(())
    }

    /// Reads the next message, applying the 3-minute idle-read watchdog and
    /// updating `state`/`bitfield` for the transitions that affect them.
    /// Messages that require caller-side bookkeeping (Piece, Request,
    /// Cancel) are still returned for the caller to act on.
    pub async fn recv(&mut self) -> PeerWireResult<Message> {
        let message = timeout(IDLE_READ_TIMEOUT, Message::read_from(&mut self.reader))
            .await
            .map_err(|_| {
                PeerWireError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "no bytes received within the idle-read window",
                ))
            })??;

        match &message {
            Message::Choke => self.state.peer_choking = true,
            Message::Unchoke => self.state.peer_choking = false,
            Message::Interested => self.state.peer_interested = true,
            Message::NotInterested => self.state.peer_interested = false,
            Message::Have { piece_index } => self.bitfield.set(*piece_index as usize),
            Message::Bitfield(bits) => {
                if self.received_first_message {
                    return Err(PeerWireError::UnexpectedMessageOrder(
                        "Bitfield received after the first post-handshake message",
                    ));
                }
                self.bitfield = Bitfield::from_wire(bits, self.bitfield.num_pieces());
            }
            Message::KeepAlive => {}
            _ => {}
        }
        if !matches!(message, Message::KeepAlive) {
            self.received_first_message = true;
        }

        Ok(message)
    }

    pub async fn send_choke(&mut self, choking: bool) -> PeerWireResult<()> {
        self.state.am_choking = choking;
        self.send(&if choking { Message::Choke } else { Message::Unchoke })
            .await
    }

    pub async fn send_interested(&mut self, interested: bool) -> PeerWireResult<()> {
        self.state.am_interested = interested;
        self.send(&if interested {
            Message::Interested
        } else {
            Message::NotInterested
        })
        .await
    }

    /// A cheap, cloneable write-only handle, for broadcasting messages (e.g.
    /// `Have`) from a task other than the one that owns this connection's
    /// read loop.
    pub fn sender(&self) -> PeerSender {
        PeerSender {
            writer: self.writer.clone(),
            last_write: self.last_write.clone(),
        }
    }
}

/// A write-only handle to a [`PeerConnection`]'s socket, sharing the same
/// writer lock and outbound-silence clock the keep-alive sender watches.
#[derive(Clone)]
pub struct PeerSender {
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
    last_write: Arc<Mutex<Instant>>,
}

impl PeerSender {
    pub async fn send(&self, message: &Message) -> PeerWireResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&message.encode()).await?;
        *self.last_write.lock().await = Instant::now();
        Ok(())
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.keepalive_task.abort();
    }
}

fn spawn_keepalive_sender(
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
    last_write: Arc<Mutex<Instant>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        loop {
            ticker.tick().await;
            let elapsed = last_write.lock().await.elapsed();
            if elapsed >= KEEPALIVE_INTERVAL {
                let mut w = writer.lock().await;
                if w.write_all(&Message::KeepAlive.encode()).await.is_err() {
                    return;
                }
                *last_write.lock().await = Instant::now();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_matches_protocol_initial_values() {
        let state = ChokeState::default();
        assert!(state.am_choking);
        assert!(!state.am_interested);
        assert!(state.peer_choking);
        assert!(!state.peer_interested);
    }
}
