use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use crate::{
    choke::{ChokeAlgorithm, PeerSnapshot},
    disk::{DiskQueue, DEFAULT_MAX_WORKERS},
    fs::{ContentStorage, DiskError},
    metainfo::MetaInfo,
    opqueue::{OpKind, OpQueue},
    p2p::{state::SessionState, PeerCommand, PeerHandle},
    picker::Picker,
    store::{FilePriority, PieceClass, StoreInfo},
    swarm::{DiscoverySource, Swarm},
    tracker::{AnnounceParams, Event, TrackerError, TrackerManager},
    ID,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("tracker error: {0}")]
    TrackerError(#[from] TrackerError),

    #[error("disk error: {0}")]
    DiskError(#[from] DiskError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),
}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
pub type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

/// Commands that can be sent to a torrent from other tasks.
pub enum TorrentCommand {
    /// Sent by a peer session once its handshake completes.
    PeerConnected { address: SocketAddr, id: ID },

    /// Sent by a peer session whenever its state changes, so the choking
    /// algorithm (and stats reporting) can see every peer without reaching
    /// into the session tasks themselves.
    PeerState { address: SocketAddr, state: SessionState },

    /// Sent by a peer session once a piece it finalized has been written
    /// (or has failed hash verification).
    PieceWritten { idx: usize, valid: bool },

    /// Sent by a `Tracker` once an announce returns peers.
    PeersDiscovered(Vec<SocketAddr>),

    /// Sent by a peer session's own task once it exits, win or lose — the
    /// only place a peer is removed from `Torrent::peers`.
    PeerDisconnected { address: SocketAddr, error: Option<String> },

    /// Sent by `BtEngine`'s op-queue drain once this torrent has been
    /// granted a connect or announce slot.
    OpGranted(OpKind),

    /// Sent by an `EngineHandle::set_file_priority` call; answered on
    /// `reply` once applied.
    SetFilePriority { file_idx: usize, priority: FilePriority, reply: oneshot::Sender<Result<()>> },

    /// Sent by itself to shut down.
    Shutdown,
}

const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

#[derive(Debug)]
pub struct Torrent {
    ctx: Arc<TorrentContext>,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    tracker_mgr: TrackerManager,

    // Peers we know about, scored and backed off, but don't have a session
    // with yet.
    swarm: Swarm,

    choke: ChokeAlgorithm,

    torrent_rx: TorrentRx,
    torrent_tx: TorrentTx,

    start_time: Option<Instant>,
    listen_address: SocketAddr,
    min_max_peers: (u32, u32),
    announce_interval: Duration,
}

#[derive(Debug)]
pub struct TorrentContext {
    pub info_hash: ID,
    pub client_id: ID,
    pub picker: Picker,
    pub torrent_tx: TorrentTx,
    pub storage: Arc<ContentStorage>,
    pub disk_queue: Arc<DiskQueue>,
    pub piece_hashes: Vec<ID>,
    pub info: StoreInfo,
    pub listen_port: u16,

    /// `None` when a `Torrent` is driven directly (tests, `main.rs`'s bare
    /// mode); `Some` once `BtEngine` owns it, in which case connects and
    /// announces are rate-limited through the shared queue instead of
    /// firing unconditionally.
    pub op_queue: Option<Arc<std::sync::Mutex<OpQueue>>>,
}

pub struct TorrentConfig {
    pub client_id: ID,
    pub listen_address: SocketAddr,
    pub min_max_peers: (u32, u32),
    pub output_dir: std::path::PathBuf,
    pub disk_workers: usize,
    pub announce_interval: Duration,
    pub op_queue: Option<Arc<std::sync::Mutex<OpQueue>>>,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: *b"-RS0001-000000000000",
            listen_address: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 6881),
            min_max_peers: (5, 100),
            output_dir: std::path::PathBuf::from("downloads"),
            disk_workers: DEFAULT_MAX_WORKERS,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            op_queue: None,
        }
    }
}

impl Torrent {
    pub async fn new(metainfo: MetaInfo, config: TorrentConfig) -> Result<Self> {
        let info = StoreInfo::new(&metainfo, config.output_dir);
        let piece_hashes = metainfo.piece_hashes();
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();

        let storage = ContentStorage::new(info.clone())?;
        let hashes = piece_hashes.clone();
        let (storage, own_bitfield) = tokio::task::spawn_blocking(move || {
            let bitfield = storage.verify_all(&hashes);
            (storage, bitfield)
        })
        .await
        .expect("startup verification task panicked");
        let storage = Arc::new(storage);

        let picker = Picker::new(info.num_pieces, info.piece_len, info.last_piece_len);
        picker.piece_picker.write().await.set_own_bitfield(own_bitfield);

        let mut tracker_mgr = TrackerManager::new(metainfo.trackers());
        tracker_mgr.start(torrent_tx.clone()).await;

        Ok(Torrent {
            ctx: Arc::new(TorrentContext {
                info_hash: metainfo.info_hash(),
                client_id: config.client_id,
                picker,
                torrent_tx: torrent_tx.clone(),
                storage,
                disk_queue: Arc::new(DiskQueue::new(config.disk_workers)),
                piece_hashes,
                info,
                listen_port: config.listen_address.port(),
                op_queue: config.op_queue,
            }),
            tracker_mgr,
            peers: HashMap::new(),
            swarm: Swarm::new(),
            choke: ChokeAlgorithm::default(),
            torrent_rx,
            torrent_tx,
            start_time: None,
            listen_address: config.listen_address,
            min_max_peers: config.min_max_peers,
            announce_interval: config.announce_interval,
        })
    }

    /// A sender `BtEngine` keeps around after spawning this torrent, to
    /// deliver `TorrentCommand`s (op-queue grants, priority changes) to it.
    pub fn handle(&self) -> TorrentTx {
        self.torrent_tx.clone()
    }

    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());
        self.announce(Some(Event::Started));
        self.run().await?;
        Ok(())
    }

    fn announce_params(&self, event: Option<Event>) -> AnnounceParams {
        let num_peers = self.peers.len() + self.swarm.len().saturating_sub(self.swarm.connected_count());
        let num_want = if num_peers >= self.min_max_peers.0 as usize || event == Some(Event::Stopped) {
            None
        } else {
            Some((self.min_max_peers.1 as usize - num_peers).max(self.min_max_peers.0 as usize))
        };

        AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port: self.listen_address.port(),
            uploaded: 0,
            downloaded: 0,
            left: self.ctx.info.total_len,
            event,
            num_want,
        }
    }

    /// Queues an announce across every tracker; the actual network I/O
    /// happens on each tracker's own task (see `tracker::TrackerManager`).
    /// Start/stop events bypass the op queue — they must fire immediately
    /// regardless of the daemon's current rate-limit budget.
    #[tracing::instrument(skip(self), fields(num_peers = self.peers.len()))]
    fn announce(&self, event: Option<Event>) {
        if event.is_some() {
            self.tracker_mgr.announce_one(self.announce_params(event));
            return;
        }

        match &self.ctx.op_queue {
            Some(queue) => {
                queue.lock().unwrap().request(self.ctx.info_hash, OpKind::UdpAnnounce, 1);
            }
            None => self.tracker_mgr.queue_announces(self.announce_params(None)),
        }
    }

    fn connect_to_peers(&mut self) {
        let now = Instant::now();
        let slots = (self.min_max_peers.1 as usize)
            .saturating_sub(self.peers.len() + self.swarm.connecting_count());
        if slots == 0 {
            return;
        }

        let candidates = self.swarm.get_connectable_peers(slots, now);
        if candidates.is_empty() {
            return;
        }

        tracing::info!("connecting to {} peers", candidates.len());
        for address in candidates {
            self.swarm.mark_connecting(address, now);
            self.peers
                .insert(address, PeerHandle::start_session(address, self.ctx.clone(), None));
        }
    }

    #[tracing::instrument(skip_all, name = "torrent")]
    async fn run(&mut self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.listen_address).await?;
        self.listen_address = listener.local_addr()?;
        tracing::info!("listening on {}", self.listen_address);

        self.connect_to_peers();
        let mut announce_tick = tokio::time::interval(self.announce_interval);
        let mut choke_tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                new_peer_conn = listener.accept() => {
                    let (stream, address) = match new_peer_conn {
                        Ok((stream, address)) => (stream, address),
                        Err(e) => {
                            tracing::warn!("inbound peer connection error: {}", e);
                            continue;
                        },
                    };
                    self.swarm.add_incoming(address, Instant::now());
                    self.peers.insert(address, PeerHandle::start_session(address, self.ctx.clone(), Some(stream)));
                }

                _ = announce_tick.tick() => {
                    self.announce(None);
                    self.connect_to_peers();
                }

                _ = choke_tick.tick() => {
                    self.evaluate_choking().await;
                }

                Some(cmd) = self.torrent_rx.recv() => {
                    match cmd {
                        TorrentCommand::PeerConnected { address, id } => {
                            self.swarm.mark_connected(address, Instant::now());
                            if let Some(peer) = self.peers.get_mut(&address) {
                                peer.id = Some(id);
                            }
                        },

                        TorrentCommand::PeerState { address, state } => {
                            if let Some(peer) = self.peers.get_mut(&address) {
                                peer.state = state;
                            }
                        },

                        TorrentCommand::PieceWritten { idx, valid } => {
                            self.handle_piece_write(idx, valid).await?;
                        },

                        TorrentCommand::PeersDiscovered(peers) => {
                            let now = Instant::now();
                            for addr in peers {
                                self.swarm.add_peer(addr, DiscoverySource::Tracker, now).ok();
                            }
                            self.connect_to_peers();
                        },

                        TorrentCommand::PeerDisconnected { address, error } => {
                            self.peers.remove(&address);
                            match error {
                                Some(reason) => self.swarm.mark_failed(address, reason, Instant::now()),
                                None => self.swarm.mark_disconnected(address),
                            }
                            self.connect_to_peers();
                        },

                        TorrentCommand::OpGranted(kind) => {
                            match kind {
                                OpKind::UdpAnnounce | OpKind::HttpAnnounce => {
                                    self.tracker_mgr.queue_announces(self.announce_params(None));
                                }
                                OpKind::TcpConnect | OpKind::UtpConnect => {
                                    // Peer dialing stays gated by `connect_to_peers`'s own
                                    // swarm backoff; the grant is bookkeeping only.
                                }
                            }
                        },

                        TorrentCommand::SetFilePriority { file_idx, priority, reply } => {
                            let result = self.set_file_priority(file_idx, priority).await;
                            reply.send(result).ok();
                        },

                        TorrentCommand::Shutdown => {
                            break;
                        },
                    }
                }
            }
        }

        Ok(())
    }

    /// Runs the choking algorithm's 10s rotation / 30s optimistic unchoke
    /// (both internally timed) plus an every-tick snub check, then tells
    /// each peer session whether its choke state needs to change.
    async fn evaluate_choking(&mut self) {
        let now = Instant::now();
        let seeding = {
            let picker = self.ctx.picker.piece_picker.read().await;
            (0..picker.own_bitfield().len())
                .all(|i| picker.own_bitfield()[i] || picker.priority()[i] == 0)
        };

        let snapshots: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .map(|(address, handle)| PeerSnapshot { address: *address, state: handle.state.clone() })
            .collect();

        let snubbed: HashSet<SocketAddr> = self.choke.snubbed(&snapshots, now).into_iter().collect();
        let unchoked = self.choke.evaluate(&snapshots, seeding, now);

        for (address, handle) in self.peers.iter() {
            let want_unchoked = unchoked.contains(address) && !snubbed.contains(address);
            if want_unchoked == !handle.state.choked {
                continue;
            }
            if let Some(tx) = &handle.peer_tx {
                tx.send(PeerCommand::SetChoked(!want_unchoked)).ok();
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            if let Some(tx) = &peer.peer_tx {
                let _ = tx.send(PeerCommand::Shutdown);
            }
        }

        for peer in self.peers.values_mut() {
            if let Some(handle) = peer.session_handle.take() {
                if let Err(e) = handle.await {
                    tracing::warn!("session task panicked: {}", e);
                }
            }
        }

        self.announce(Some(Event::Stopped));
        self.tracker_mgr.shutdown().await;

        self.torrent_tx.send(TorrentCommand::Shutdown)?;
        Ok(())
    }

    async fn handle_piece_write(&mut self, idx: usize, valid: bool) -> Result<()> {
        if valid {
            self.ctx.picker.piece_picker.write().await.received_piece(idx);

            let picker = self.ctx.picker.piece_picker.read().await;
            let num_missing = (0..picker.own_bitfield().len())
                .filter(|&i| !picker.own_bitfield()[i] && picker.priority()[i] > 0)
                .count();
            drop(picker);
            tracing::info!("piece {} downloaded, {} wanted pieces remain", idx, num_missing);

            // A boundary piece (spanning a skipped file) is only ever parked
            // in `.parts`: HAVE must not be sent for it, or a peer could
            // request bytes we have no file to serve from.
            if !self.ctx.storage.is_parked_in_parts(idx) {
                for peer in self.peers.values() {
                    if let Some(tx) = &peer.peer_tx {
                        tx.send(PeerCommand::PieceWritten(idx)).ok();
                    }
                }
            }

            if num_missing == 0 {
                tracing::info!("torrent download complete");
                self.shutdown().await?;
            }
        } else {
            tracing::warn!("piece {} failed verification, discarding", idx);
        }

        Ok(())
    }

    /// Changes a file's download priority at runtime. Recomputes every
    /// touching piece's priority in the picker, and — if un-skipping just
    /// turned an already-downloaded `Boundary` piece back into `Wanted` —
    /// materializes it out of `.parts` and announces it with HAVE.
    pub async fn set_file_priority(&mut self, file_idx: usize, priority: FilePriority) -> Result<()> {
        let was_boundary_and_had = {
            let picker = self.ctx.picker.piece_picker.read().await;
            (0..self.ctx.info.num_pieces as usize)
                .filter(|&idx| picker.own_bitfield()[idx])
                .filter(|&idx| self.ctx.storage.piece_classification(idx) == PieceClass::Boundary)
                .collect::<Vec<_>>()
        };

        self.ctx.storage.set_file_priority(file_idx, priority);
        let priorities = self.ctx.storage.file_priorities();

        let mut picker = self.ctx.picker.piece_picker.write().await;
        for idx in 0..self.ctx.info.num_pieces as usize {
            picker.set_priority(idx, self.ctx.info.piece_priority(idx, &priorities));
        }
        drop(picker);

        for idx in was_boundary_and_had {
            if self.ctx.storage.piece_classification(idx) == PieceClass::Wanted {
                self.ctx.storage.materialize_parked_piece(idx)?;
                tracing::info!("piece {} un-skipped, materialized out of .parts", idx);
                for peer in self.peers.values() {
                    if let Some(tx) = &peer.peer_tx {
                        tx.send(PeerCommand::PieceWritten(idx)).ok();
                    }
                }
            }
        }

        Ok(())
    }
}
