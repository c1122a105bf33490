//! Engine facade: ties metainfo parsing, the tracker client, and the
//! scheduler together behind a small set of idempotent operations, and owns
//! the registry of active torrents.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::magnet::{MagnetError, MagnetLink};
use crate::metainfo::{Metainfo, MetainfoError};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::{Storage, StorageError};
use crate::tracker::{Client, Event, TrackerError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("magnet URI error: {0}")]
    Magnet(#[from] MagnetError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("no torrent registered for that info-hash")]
    NotFound,

    #[error("torrent metadata is not yet available (magnet pending resolution)")]
    MetadataPending,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Engine-level configuration, set via [`Engine::configure`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub download_dir: PathBuf,
    pub incoming_port: u16,
    pub enable_upload: bool,
    pub enable_seeding: bool,
    pub auto_start: bool,
    pub max_peers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            incoming_port: 6881,
            enable_upload: false,
            enable_seeding: false,
            auto_start: false,
            max_peers: 50,
        }
    }
}

/// A torrent's lifecycle state, independent of whether its scheduler is
/// currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    AwaitingMetadata,
    Stopped,
    Started,
}

/// A consistent, I/O-free copy of one torrent's status, returned by
/// [`Engine::snapshot`].
#[derive(Debug, Clone)]
pub struct TorrentSnapshot {
    pub info_hash: [u8; 20],
    pub name: Option<String>,
    pub total_length: i64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub connected_peers: usize,
    pub state: TorrentState,
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub last_error: Option<String>,
}

struct EngineTorrent {
    metainfo: Option<Arc<Metainfo>>,
    magnet: Option<MagnetLink>,
    state: TorrentState,
    storage: Option<Arc<Storage>>,
    scheduler: Option<Scheduler>,
    cancel: Option<CancellationToken>,
    /// Piece indices verified so far; survives a stop so a later start only
    /// re-queues what's still missing.
    completed: HashSet<u32>,
    last_error: Option<String>,
}

/// The torrent download engine: a registry of torrents plus the
/// configuration that governs how new ones are handled.
pub struct Engine {
    config: RwLock<EngineConfig>,
    torrents: RwLock<HashMap<[u8; 20], EngineTorrent>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Engine> {
        validate_config(&config)?;
        Ok(Engine {
            config: RwLock::new(config),
            torrents: RwLock::new(HashMap::new()),
        })
    }

    /// Replaces engine-level configuration, stopping every live torrent
    /// first.
    pub async fn configure(&self, config: EngineConfig) -> EngineResult<()> {
        validate_config(&config)?;
        let info_hashes: Vec<[u8; 20]> = self.torrents.read().await.keys().copied().collect();
        for info_hash in info_hashes {
            self.stop(info_hash).await.ok();
        }
        *self.config.write().await = config;
        Ok(())
    }

    /// Parses `bytes` as a `.torrent` file and registers it. A torrent
    /// already registered under the same info-hash is returned unchanged.
    pub async fn add_from_file(&self, bytes: &[u8]) -> EngineResult<[u8; 20]> {
        let metainfo = Metainfo::parse(bytes)?;
        let info_hash = metainfo.info_hash;

        let mut torrents = self.torrents.write().await;
        if torrents.contains_key(&info_hash) {
            return Ok(info_hash);
        }

        let auto_start = self.config.read().await.auto_start;
        torrents.insert(
            info_hash,
            EngineTorrent {
                metainfo: Some(Arc::new(metainfo)),
                magnet: None,
                state: if auto_start {
                    TorrentState::Started
                } else {
                    TorrentState::Stopped
                },
                storage: None,
                scheduler: None,
                cancel: None,
                completed: HashSet::new(),
                last_error: None,
            },
        );
        drop(torrents);

        if auto_start {
            self.start(info_hash).await?;
        }
        Ok(info_hash)
    }

    /// Registers a magnet URI. Metadata exchange (BEP 9) is unimplemented,
    /// so the torrent sits in `AwaitingMetadata` until metainfo arrives by
    /// some other path (e.g. `add_from_file` with the same info-hash).
    pub async fn add_from_magnet(&self, uri: &str) -> EngineResult<[u8; 20]> {
        let magnet = MagnetLink::parse(uri)?;
        let info_hash = magnet.info_hash;

        let mut torrents = self.torrents.write().await;
        if torrents.contains_key(&info_hash) {
            return Ok(info_hash);
        }
        torrents.insert(
            info_hash,
            EngineTorrent {
                metainfo: None,
                magnet: Some(magnet),
                state: TorrentState::AwaitingMetadata,
                storage: None,
                scheduler: None,
                cancel: None,
                completed: HashSet::new(),
                last_error: None,
            },
        );
        Ok(info_hash)
    }

    /// Transitions a torrent to `Started`; idempotent if already started.
    ///
    /// The registry lock is only held to snapshot what's needed and to
    /// install the result — the tracker announce and peer dials run with no
    /// lock held, so `snapshot()`/`stop()` on other torrents are never
    /// blocked behind this torrent's network I/O.
    pub async fn start(&self, info_hash: [u8; 20]) -> EngineResult<()> {
        let (metainfo, initial_completed) = {
            let mut torrents = self.torrents.write().await;
            let torrent = torrents.get_mut(&info_hash).ok_or(EngineError::NotFound)?;
            if torrent.state == TorrentState::Started {
                return Ok(());
            }
            let metainfo = torrent.metainfo.clone().ok_or(EngineError::MetadataPending)?;
            (metainfo, torrent.completed.clone())
        };

        let config = self.config.read().await.clone();
        let outcome = start_torrent(&metainfo, &config, initial_completed).await;

        let mut torrents = self.torrents.write().await;
        let Some(torrent) = torrents.get_mut(&info_hash) else {
            return Ok(()); // deleted while the announce/dial was in flight
        };
        match outcome {
            Ok((storage, scheduler, cancel)) => {
                torrent.storage = Some(storage);
                torrent.scheduler = Some(scheduler);
                torrent.cancel = Some(cancel);
                torrent.state = TorrentState::Started;
                torrent.last_error = None;
                tracing::info!(info_hash = %crate::metainfo::hash::to_hex(&info_hash), "torrent started");
                Ok(())
            }
            Err(e) => {
                torrent.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Closes all peer connections, flushes storage, and transitions to
    /// `Stopped`; idempotent. The completion bitmap is kept so a later
    /// `start` only re-queues what's still missing.
    pub async fn stop(&self, info_hash: [u8; 20]) -> EngineResult<()> {
        let mut torrents = self.torrents.write().await;
        let torrent = torrents.get_mut(&info_hash).ok_or(EngineError::NotFound)?;

        if let Some(cancel) = torrent.cancel.take() {
            cancel.cancel();
        }
        if let Some(scheduler) = &torrent.scheduler {
            torrent.completed = scheduler.snapshot().completed;
        }
        if let Some(storage) = &torrent.storage {
            storage.flush()?;
        }
        torrent.scheduler = None;
        torrent.state = TorrentState::Stopped;
        tracing::info!(info_hash = %crate::metainfo::hash::to_hex(&info_hash), "torrent stopped");
        Ok(())
    }

    /// Stops the torrent, then removes it from the registry. Files on disk
    /// are left in place.
    pub async fn delete(&self, info_hash: [u8; 20]) -> EngineResult<()> {
        self.stop(info_hash).await?;
        self.torrents.write().await.remove(&info_hash);
        Ok(())
    }

    /// A consistent copy of every torrent's status. Never holds the
    /// registry lock across I/O.
    pub async fn snapshot(&self) -> Vec<TorrentSnapshot> {
        let torrents = self.torrents.read().await;
        torrents
            .iter()
            .map(|(info_hash, torrent)| {
                let (bytes_downloaded, connected_peers, completed_pieces) = torrent
                    .scheduler
                    .as_ref()
                    .map(|s| {
                        let snap = s.snapshot();
                        (snap.bytes_downloaded, snap.connected_peers, snap.completed.len())
                    })
                    .unwrap_or((0, 0, torrent.completed.len()));

                TorrentSnapshot {
                    info_hash: *info_hash,
                    name: torrent
                        .metainfo
                        .as_ref()
                        .map(|m| m.info.name.clone())
                        .or_else(|| torrent.magnet.as_ref().and_then(|m| m.display_name.clone())),
                    total_length: torrent.metainfo.as_ref().map(|m| m.total_length()).unwrap_or(0),
                    bytes_downloaded,
                    bytes_uploaded: 0, // upload serving is unimplemented; see DESIGN.md
                    connected_peers,
                    state: torrent.state,
                    completed_pieces,
                    total_pieces: torrent.metainfo.as_ref().map(|m| m.num_pieces()).unwrap_or(0),
                    last_error: torrent.last_error.clone(),
                }
            })
            .collect()
    }
}

/// Announces to the tracker, starts the scheduler for `metainfo`, and spawns
/// the long-lived re-announce timer ([`tracker_timer`]) that keeps the
/// tracker informed for the rest of the torrent's run. Split out of
/// [`Engine::start`] so the registry lock isn't held across any of this I/O.
async fn start_torrent(
    metainfo: &Arc<Metainfo>,
    config: &EngineConfig,
    initial_completed: HashSet<u32>,
) -> EngineResult<(Arc<Storage>, Scheduler, CancellationToken)> {
    let storage = Arc::new(Storage::allocate(metainfo, &config.download_dir, 64)?);
    let tracker_client = Client::new(config.incoming_port)?;

    let announce_url = metainfo
        .all_trackers()
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Configuration("torrent has no announce URL".into()))?;

    let response = tracker_client
        .announce(&announce_url, metainfo, Event::Started, 0, 0)
        .await?;

    let peer_addrs: Vec<SocketAddr> = response
        .peers
        .into_iter()
        .take(config.max_peers)
        .map(|p| SocketAddr::new(p.ip, p.port))
        .collect();

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::start(
        metainfo.clone(),
        storage.clone(),
        tracker_client.peer_id(),
        peer_addrs,
        cancel.clone(),
        initial_completed,
    )
    .await?;

    tokio::spawn(tracker_timer(
        tracker_client,
        announce_url,
        metainfo.clone(),
        scheduler.clone(),
        cancel.clone(),
        response.interval,
        response.min_interval,
    ));

    Ok((storage, scheduler, cancel))
}

/// Long-lived per-torrent re-announce loop, started alongside the scheduler
/// once the initial `started` announce succeeds. Honors tracker etiquette:
/// no announce repeats sooner than the larger of `interval`/`min_interval`,
/// except for the one `completed` or `stopped` event BEP 3 exempts from that
/// wait — `completed` fires the moment the last piece verifies, and
/// `stopped` fires immediately when `cancel` fires, both skipping the clock.
async fn tracker_timer(
    client: Client,
    announce_url: String,
    metainfo: Arc<Metainfo>,
    scheduler: Scheduler,
    cancel: CancellationToken,
    initial_interval: i64,
    initial_min_interval: Option<i64>,
) {
    let mut interval_secs = initial_interval.max(1);
    let mut min_interval_secs = initial_min_interval;
    let mut completed_announced = scheduler.is_done();

    loop {
        let wait = Duration::from_secs(
            interval_secs.max(min_interval_secs.unwrap_or(0)).max(1) as u64
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                let downloaded = scheduler.snapshot().bytes_downloaded as i64;
                if let Err(e) = client.announce(&announce_url, &metainfo, Event::Stopped, 0, downloaded).await {
                    tracing::debug!(error = %e, "stopped announce failed");
                }
                return;
            }
            _ = scheduler.wait_done(), if !completed_announced => {
                completed_announced = true;
                let downloaded = scheduler.snapshot().bytes_downloaded as i64;
                match client.announce(&announce_url, &metainfo, Event::Completed, 0, downloaded).await {
                    Ok(resp) => {
                        interval_secs = resp.interval.max(1);
                        min_interval_secs = resp.min_interval;
                    }
                    Err(e) => tracing::debug!(error = %e, "completed announce failed"),
                }
            }
            _ = tokio::time::sleep(wait) => {
                let downloaded = scheduler.snapshot().bytes_downloaded as i64;
                match client.announce(&announce_url, &metainfo, Event::Empty, 0, downloaded).await {
                    Ok(resp) => {
                        interval_secs = resp.interval.max(1);
                        min_interval_secs = resp.min_interval;
                    }
                    Err(e) => tracing::warn!(error = %e, "periodic tracker re-announce failed"),
                }
            }
        }
    }
}

fn validate_config(config: &EngineConfig) -> EngineResult<()> {
    if config.incoming_port == 0 {
        return Err(EngineError::Configuration(
            "incoming_port must be between 1 and 65535".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_zero_port() {
        let config = EngineConfig {
            incoming_port: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::new(config),
            Err(EngineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn magnet_only_torrent_awaits_metadata() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let uri = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a";
        let info_hash = engine.add_from_magnet(uri).await.unwrap();

        let err = engine.start(info_hash).await.unwrap_err();
        assert!(matches!(err, EngineError::MetadataPending));

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot[0].state, TorrentState::AwaitingMetadata);
    }

    #[tokio::test]
    async fn unknown_info_hash_is_not_found() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let err = engine.start([0u8; 20]).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound));
    }
}
