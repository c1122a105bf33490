//! Download scheduler: a bounded work queue of pieces, one worker task per
//! connected peer, and a single result-consumer task that writes completed
//! pieces through storage and broadcasts `Have`.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::download::{self, DownloadError, WorkItem};
use crate::metainfo::Metainfo;
use crate::peer::{Message, PeerConnection, PeerSender};
use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no peers survived handshake")]
    NoPeers,

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Outcome of one piece download attempt, as pushed by a worker to the
/// result-consumer task.
#[derive(Debug)]
pub enum PieceResult {
    Success { piece_index: u32, data: Vec<u8> },
    Failure { piece_index: u32 },
}

/// Fast-path state shared between the result consumer and `Snapshot()`:
/// never held across an `.await`.
#[derive(Debug, Default)]
pub struct SchedulerState {
    pub completed: HashSet<u32>,
    pub bytes_downloaded: u64,
    pub connected_peers: usize,
}

/// Runs the per-torrent scheduler: dials every peer, spawns one worker per
/// surviving connection, and drives the result-consumer loop until either
/// every piece completes or `cancel` fires.
///
/// Cheap to clone: every field is itself a shared handle, so a clone observes
/// the same live state as the original.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    done: watch::Receiver<bool>,
}

impl Scheduler {
    #[tracing::instrument(skip(metainfo, storage, peer_id, peer_addrs, cancel, initial_completed), fields(info_hash = %crate::metainfo::hash::to_hex(&metainfo.info_hash)))]
    pub async fn start(
        metainfo: Arc<Metainfo>,
        storage: Arc<Storage>,
        peer_id: [u8; 20],
        peer_addrs: Vec<SocketAddr>,
        cancel: CancellationToken,
        initial_completed: HashSet<u32>,
    ) -> SchedulerResult<Scheduler> {
        let num_pieces = metainfo.num_pieces();
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(num_pieces.max(1));
        let (result_tx, result_rx) = mpsc::channel::<PieceResult>(num_pieces.max(1) * 2);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        // Resuming after a stop must not re-download pieces already verified.
        for index in 0..num_pieces {
            let piece_index = index as u32;
            if initial_completed.contains(&piece_index) {
                continue;
            }
            let item = WorkItem {
                piece_index,
                piece_length: metainfo.piece_length(index) as u32,
                expected_hash: metainfo.info.pieces[index],
            };
            // capacity sized to num_pieces above, so this never blocks.
            work_tx.try_send(item).ok();
        }

        let state = Arc::new(Mutex::new(SchedulerState {
            completed: initial_completed,
            ..SchedulerState::default()
        }));
        let peer_senders = Arc::new(Mutex::new(Vec::<PeerSender>::new()));
        let info_hash = metainfo.info_hash;

        // Dial every candidate concurrently rather than one at a time; a
        // slow or unreachable peer must not delay the rest of the swarm.
        let mut dial_tasks = Vec::with_capacity(peer_addrs.len());
        for addr in peer_addrs {
            dial_tasks.push(tokio::spawn(async move {
                PeerConnection::connect(addr, info_hash, peer_id, num_pieces)
                    .await
                    .map_err(|e| (addr, e))
            }));
        }

        let mut surviving = 0;
        for task in dial_tasks {
            let conn = match task.await {
                Ok(Ok(conn)) => conn,
                Ok(Err((addr, e))) => {
                    tracing::debug!(%addr, error = %e, "peer dial/handshake failed");
                    continue;
                }
                Err(_) => continue, // dial task panicked
            };

            surviving += 1;
            state.lock().unwrap().connected_peers += 1;
            peer_senders.lock().unwrap().push(conn.sender());
            tokio::spawn(peer_worker(
                conn,
                work_rx.clone(),
                work_tx.clone(),
                result_tx.clone(),
                cancel.clone(),
                state.clone(),
            ));
        }
        drop(work_tx);

        if surviving == 0 {
            return Err(SchedulerError::NoPeers);
        }

        let already_done = state.lock().unwrap().completed.len() == num_pieces;
        let (done_tx, done_rx) = watch::channel(already_done);
        tokio::spawn(result_consumer(
            result_rx,
            storage,
            state.clone(),
            peer_senders,
            num_pieces,
            done_tx,
            cancel,
        ));

        Ok(Scheduler { state, done: done_rx })
    }

    pub fn snapshot(&self) -> SchedulerState {
        let state = self.state.lock().unwrap();
        SchedulerState {
            completed: state.completed.clone(),
            bytes_downloaded: state.bytes_downloaded,
            connected_peers: state.connected_peers,
        }
    }

    /// True once every piece has completed.
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once every piece has completed. Safe to call after
    /// completion already happened: unlike a bare `Notify`, the watch
    /// channel retains the `true` value for late subscribers instead of
    /// only waking whoever was already waiting.
    pub async fn wait_done(&self) {
        let mut rx = self.done.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

async fn peer_worker(
    mut conn: PeerConnection,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    work_tx: mpsc::Sender<WorkItem>,
    result_tx: mpsc::Sender<PieceResult>,
    cancel: CancellationToken,
    state: Arc<Mutex<SchedulerState>>,
) {
    // First post-handshake message: a Bitfield is stored; anything else is
    // left for normal processing (bitfield stays all-false).
    tokio::select! {
        _ = cancel.cancelled() => return,
        msg = conn.recv() => {
            match msg {
                Ok(Message::Bitfield(_)) => {} // already applied inside recv()
                Ok(_) | Err(_) => {}
            }
        }
    }

    if conn.send_interested(true).await.is_err() {
        return;
    }

    while conn.state.peer_choking {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = conn.recv() => {
                match msg {
                    Ok(_) => {} // Unchoke flips conn.state.peer_choking inside recv()
                    Err(_) => return,
                }
            }
        }
    }

    loop {
        let item = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else { return };

        if !conn.bitfield.has(item.piece_index as usize) {
            // don't hot-spin: yield the item to the tail and try another.
            if work_tx.send(item).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }

        match download::download_piece(&mut conn, &item).await {
            Ok(data) => {
                let piece_index = item.piece_index;
                if result_tx
                    .send(PieceResult::Success { piece_index, data })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(DownloadError::NotAvailable(_)) => {
                work_tx.send(item).await.ok();
            }
            Err(DownloadError::PeerChoked)
            | Err(DownloadError::HashMismatch)
            | Err(DownloadError::PeerWire(_)) => {
                let piece_index = item.piece_index;
                work_tx.send(item).await.ok();
                result_tx.send(PieceResult::Failure { piece_index }).await.ok();
                state.lock().unwrap().connected_peers -= 1;
                return;
            }
        }
    }
}

async fn result_consumer(
    mut result_rx: mpsc::Receiver<PieceResult>,
    storage: Arc<Storage>,
    state: Arc<Mutex<SchedulerState>>,
    peer_senders: Arc<Mutex<Vec<PeerSender>>>,
    num_pieces: usize,
    done: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = result_rx.recv() => {
                let Some(result) = result else { return };
                match result {
                    PieceResult::Success { piece_index, data } => {
                        let len = data.len() as u64;
                        if let Err(e) = storage.write_piece(piece_index as usize, data) {
                            tracing::warn!(piece_index, error = %e, "failed to write piece");
                            continue;
                        }
                        let mut state = state.lock().unwrap();
                        state.completed.insert(piece_index);
                        state.bytes_downloaded += len;
                        let done_count = state.completed.len();
                        drop(state);
                        tracing::debug!(piece_index, "piece completed");

                        let senders = peer_senders.lock().unwrap().clone();
                        for sender in senders {
                            // best-effort: one peer's I/O error doesn't stop the broadcast.
                            let _ = sender.send(&Message::Have { piece_index }).await;
                        }

                        if done_count == num_pieces {
                            tracing::info!("torrent completed");
                            done.send_replace(true);
                        }
                    }
                    PieceResult::Failure { piece_index } => {
                        tracing::debug!(piece_index, "piece attempt failed, re-queued");
                    }
                }
            }
        }
    }
}
