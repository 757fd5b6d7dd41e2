//! The process-wide façade: owns every active `Torrent`, the shared
//! operation queue each of them draws connect/announce slots from, and the
//! session store they persist into. Mirrors `Torrent` itself one level up —
//! `BtEngine` is driven directly (`&mut self` methods called from whatever
//! owns it, e.g. `main.rs`), while each `Torrent` runs on its own spawned
//! task and is reached only through the `TorrentTx` an `EngineHandle` wraps.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::interfaces::{FileSessionStore, SessionStore};
use crate::magnet::{self, MagnetLink};
use crate::metainfo::{Info, MetaInfo};
use crate::opqueue::OpQueue;
use crate::persist::schema::{TorrentSource, UserState};
use crate::persist::SessionPersistence;
use crate::store::FilePriority;
use crate::torrent::{Torrent, TorrentCommand, TorrentConfig, TorrentTx};
use crate::ID;

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// A caller-held reference to one running torrent, returned by every
/// `BtEngine` method that adds one. Cheap to clone; every clone reaches the
/// same underlying `Torrent` task.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    pub info_hash: ID,
    torrent_tx: TorrentTx,
}

impl EngineHandle {
    fn send_err(&self) -> EngineError {
        EngineError::UnknownTorrent(hex::encode(self.info_hash))
    }

    pub async fn set_file_priority(&self, file_idx: usize, priority: FilePriority) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.torrent_tx
            .send(TorrentCommand::SetFilePriority { file_idx, priority, reply })
            .map_err(|_| self.send_err())?;
        rx.await.map_err(|_| self.send_err())?.map_err(EngineError::from)
    }

    /// Gracefully shuts the torrent down: announces `stopped`, closes every
    /// peer session, then exits its task. Does not wait for that to finish.
    pub fn shutdown(&self) {
        self.torrent_tx.send(TorrentCommand::Shutdown).ok();
    }
}

/// What came back from a restore walk that was actually usable: either a
/// `.torrent` or a previously-fetched magnet info dict. A magnet entry with
/// no info dict yet is reported but not re-spawned — its metadata still
/// needs fetching, which is outside this engine's current scope.
pub enum RestoredTorrent {
    Spawned(EngineHandle),
    PendingMetadata { info_hash_hex: String, magnet_uri: Option<String> },
}

pub struct BtEngine {
    config: EngineConfig,
    persist: SessionPersistence,
    op_queue: Arc<std::sync::Mutex<OpQueue>>,
    torrents: Arc<tokio::sync::Mutex<HashMap<ID, TorrentTx>>>,
}

impl BtEngine {
    /// Builds an engine over `config`, rooting its session store at
    /// `config.state_dir`, and starts the background op-queue drain loop.
    pub fn new(config: EngineConfig) -> Self {
        let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(config.state_dir.clone()));
        Self::with_store(config, store)
    }

    /// As `new`, but with a caller-supplied `SessionStore` — the seam tests
    /// use to substitute an in-memory fake.
    pub fn with_store(config: EngineConfig, store: Arc<dyn SessionStore>) -> Self {
        let op_queue = Arc::new(std::sync::Mutex::new(OpQueue::new(
            config.op_rate_per_sec,
            config.op_burst,
            Instant::now(),
        )));
        let engine = Self {
            persist: SessionPersistence::new(store),
            op_queue,
            torrents: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            config,
        };
        engine.spawn_op_queue_drain();
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn spawn_op_queue_drain(&self) {
        let op_queue = self.op_queue.clone();
        let torrents = self.torrents.clone();
        let tick = self.config.op_tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let grant = { op_queue.lock().unwrap().drain_tick(Instant::now()) };
                let Some((hash, kind)) = grant else { continue };
                let tx = torrents.lock().await.get(&hash).cloned();
                if let Some(tx) = tx {
                    tx.send(TorrentCommand::OpGranted(kind)).ok();
                } else {
                    // The torrent was removed between request and grant.
                    tracing::debug!("dropping op grant for unknown torrent");
                }
                op_queue.lock().unwrap().consume(hash, kind);
            }
        });
    }

    fn torrent_config(&self, output_dir: Option<PathBuf>) -> TorrentConfig {
        TorrentConfig {
            client_id: self.config.client.client_id,
            listen_address: self.config.listen_address,
            min_max_peers: self.config.min_max_peers,
            output_dir: output_dir.unwrap_or_else(|| self.config.default_output_dir.clone()),
            disk_workers: self.config.disk_workers,
            announce_interval: self.config.announce_interval,
            op_queue: Some(self.op_queue.clone()),
        }
    }

    async fn spawn(&mut self, metainfo: MetaInfo) -> Result<EngineHandle> {
        let info_hash = metainfo.info_hash();
        let output_dir = None;
        let mut torrent = Torrent::new(metainfo, self.torrent_config(output_dir)).await?;
        let torrent_tx = torrent.handle();

        tokio::spawn(async move {
            if let Err(e) = torrent.start().await {
                tracing::error!("torrent {} exited with error: {}", hex::encode(info_hash), e);
            }
        });

        self.torrents.lock().await.insert(info_hash, torrent_tx.clone());
        Ok(EngineHandle { info_hash, torrent_tx })
    }

    /// Adds a torrent from a `.torrent` file on disk, persists its index
    /// entry and raw bytes, and starts it.
    pub async fn add_torrent_from_file<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<EngineHandle> {
        let raw = std::fs::read(path.as_ref())?;
        let metainfo = MetaInfo::from_bytes(&raw)?;
        let hex_hash = metainfo.info_hash_hex();

        let handle = self.spawn(metainfo).await?;

        self.persist.add_torrent(&hex_hash, TorrentSource::File, None, now_unix()).await?;
        self.persist.save_torrentfile(&hex_hash, &raw).await?;
        Ok(handle)
    }

    /// Parses and indexes a magnet link. Peer-side metadata exchange
    /// (BEP 9) isn't implemented, so no `Torrent` is spawned yet — the
    /// caller is expected to drive metadata fetch separately and call
    /// `add_torrent_from_infodict` once it has the bytes.
    pub async fn add_torrent_from_magnet(&mut self, uri: &str) -> Result<MagnetLink> {
        let link = magnet::parse(uri).map_err(|e| EngineError::InvalidMagnet(e.to_string()))?;
        let hex_hash = hex::encode(link.info_hash);
        self.persist
            .add_torrent(&hex_hash, TorrentSource::Magnet, Some(uri.to_string()), now_unix())
            .await?;
        Ok(link)
    }

    /// Completes a magnet-sourced add once its info dict has been fetched
    /// from peers: persists the dict and spawns the torrent.
    pub async fn add_torrent_from_infodict(&mut self, link: &MagnetLink, info: Info) -> Result<EngineHandle> {
        let hex_hash = hex::encode(link.info_hash);
        let raw = bencode::encode_to_raw(&info).map_err(crate::metainfo::MetaInfoError::from)?;

        let trackers: Vec<url::Url> = link.trackers.iter().filter_map(|t| url::Url::parse(t).ok()).collect();
        let metainfo = MetaInfo::from_info_and_trackers(info, trackers)?;
        let handle = self.spawn(metainfo).await?;

        self.persist.save_infodict(&hex_hash, &raw).await?;
        Ok(handle)
    }

    pub async fn remove_torrent(&mut self, info_hash: ID) -> Result<()> {
        let hex_hash = hex::encode(info_hash);
        if let Some(tx) = self.torrents.lock().await.remove(&info_hash) {
            tx.send(TorrentCommand::Shutdown).ok();
        }
        self.op_queue.lock().unwrap().cancel(info_hash);
        self.persist.remove_torrent(&hex_hash).await?;
        Ok(())
    }

    pub async fn set_file_priority(&self, info_hash: ID, file_idx: usize, priority: FilePriority) -> Result<()> {
        let tx = self
            .torrents
            .lock()
            .await
            .get(&info_hash)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTorrent(hex::encode(info_hash)))?;
        EngineHandle { info_hash, torrent_tx: tx }.set_file_priority(file_idx, priority).await
    }

    pub fn handles(&self) -> Arc<tokio::sync::Mutex<HashMap<ID, TorrentTx>>> {
        self.torrents.clone()
    }

    /// Re-adds every torrent found in the session store. `.torrent`-sourced
    /// entries are fully restored; magnet-sourced ones are only restored if
    /// their info dict was already fetched in a prior run, otherwise they
    /// come back as `PendingMetadata` for the caller to resume fetching.
    ///
    /// Restored torrents are re-verified from disk on startup (the same
    /// `Torrent::new` verification every fresh add goes through), so the
    /// persisted `bitfield` field is informational rather than authoritative.
    pub async fn restore(&mut self) -> Result<Vec<RestoredTorrent>> {
        let entries = self.persist.restore().await?;
        let mut restored = Vec::with_capacity(entries.len());

        for entry in entries {
            let metainfo = match (entry.source, &entry.torrentfile, &entry.infodict) {
                (TorrentSource::File, Some(raw), _) => Some(MetaInfo::from_bytes(raw)?),
                (TorrentSource::Magnet, _, Some(infodict)) => {
                    let info: Info = bencode::decode_bytes(infodict).map_err(crate::metainfo::MetaInfoError::from)?;
                    let link = magnet::parse(entry.magnet_uri.as_deref().unwrap_or_default()).ok();
                    let trackers: Vec<url::Url> = link
                        .map(|l| l.trackers.iter().filter_map(|t| url::Url::parse(t).ok()).collect())
                        .unwrap_or_default();
                    match MetaInfo::from_info_and_trackers(info, trackers) {
                        Ok(m) => Some(m),
                        Err(e) => {
                            tracing::warn!("skipping magnet restore for {}: {}", entry.info_hash, e);
                            None
                        }
                    }
                }
                _ => None,
            };

            let Some(metainfo) = metainfo else {
                restored.push(RestoredTorrent::PendingMetadata {
                    info_hash_hex: entry.info_hash,
                    magnet_uri: entry.magnet_uri,
                });
                continue;
            };

            let priorities = entry.state.as_ref().and_then(|s| s.file_priorities.clone());
            let paused = entry
                .state
                .as_ref()
                .map(|s| s.user_state == UserState::Paused)
                .unwrap_or(false);

            let handle = self.spawn(metainfo).await?;
            if let Some(bytes) = priorities {
                for (idx, raw) in bytes.into_iter().enumerate() {
                    let priority = match raw {
                        0 => FilePriority::Skip,
                        2 => FilePriority::High,
                        _ => FilePriority::Normal,
                    };
                    handle.set_file_priority(idx, priority).await?;
                }
            }
            if paused {
                // No pause/resume command exists yet; restored torrents
                // always resume active. Tracked as a known gap rather than
                // silently discarded: `entry.state.user_state` round-trips
                // through `session:torrent:{h}:state` unused.
                tracing::debug!("torrent {} was paused; restoring active anyway", hex::encode(handle.info_hash));
            }

            restored.push(RestoredTorrent::Spawned(handle));
        }

        Ok(restored)
    }

    /// Debounced periodic state save — call this from a caller-owned timer
    /// (e.g. on every `PieceWritten` notification, or every few seconds) to
    /// satisfy the "per verified piece (debounced)" write frequency; this
    /// engine doesn't run its own timer for it since it has no visibility
    /// into per-torrent piece completion without another plumbing layer.
    pub async fn save_state(&self, info_hash: ID, state: crate::persist::schema::TorrentState) -> Result<()> {
        self.persist.save_state(&hex::encode(info_hash), &state).await?;
        Ok(())
    }
}
