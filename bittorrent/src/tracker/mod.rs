use std::{net::SocketAddr, time::Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use url::Url;

use crate::{torrent::TorrentCommand, ID};

mod http;
mod udp;
pub use http::HttpTracker;
pub use udp::UdpTracker;

type Result<T> = std::result::Result<T, TrackerError>;
pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60; // seconds

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("response error: {0}")]
    ResponseError(String),
}

/// Owns one announce loop per tracker URL and exposes the
/// `queue_announces` / `announce_one` contract used by `Torrent`: queuing a
/// set of tiered trackers to announce to, and asking a specific tracker to
/// announce immediately (used for the `started` / `stopped` / `completed`
/// events).
#[derive(Debug)]
pub struct TrackerManager {
    tiers: Vec<Vec<Url>>,
    handles: Vec<JoinHandle<()>>,
    tracker_txs: Vec<watch::Sender<Option<AnnounceParams>>>,
}

use tokio::sync::watch;

impl TrackerManager {
    pub fn new(tiers: Vec<Vec<Url>>) -> Self {
        Self {
            tiers,
            handles: Vec::new(),
            tracker_txs: Vec::new(),
        }
    }

    /// Spawns one background announce loop per tracker across all tiers,
    /// each driven by changes pushed through its own watch channel.
    pub async fn start(&mut self, torrent_tx: TorrentTx) {
        let mut handles = Vec::new();
        let mut txs = Vec::new();

        for url in self.tiers.iter().flatten() {
            let (tx, rx) = watch::channel(None);

            let mut tracker: Box<dyn Tracker> = match url.scheme() {
                "http" | "https" => Box::new(HttpTracker::new(url.clone())),
                "udp" => Box::new(UdpTracker::new(url.clone()).await),
                _ => {
                    tracing::warn!("unsupported tracker scheme: {}", url.scheme());
                    continue;
                }
            };

            let tx_clone = torrent_tx.clone();
            let url_clone = url.clone();
            let handle = tokio::spawn(
                async move {
                    if let Err(e) = tracker.run(tx_clone, rx).await {
                        tracing::error!("tracker error: {}", e);
                    }
                }
                .instrument(tracing::info_span!("tracker", url = %url_clone)),
            );

            handles.push(handle);
            txs.push(tx);
        }

        self.handles = handles;
        self.tracker_txs = txs;
    }

    /// Pushes a fresh announce request to every tracker; each tracker's
    /// `run` loop decides whether `can_announce`/`should_announce` actually
    /// fires a request at this moment, per BEP 3's interval rules.
    pub fn queue_announces(&self, params: AnnounceParams) {
        for tx in &self.tracker_txs {
            let _ = tx.send(Some(params));
        }
    }

    /// Forces an immediate announce to every tracker, used for `started`,
    /// `stopped`, and `completed` events which bypass interval throttling.
    pub fn announce_one(&self, params: AnnounceParams) {
        self.queue_announces(params);
    }

    pub async fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("tracker join error: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
pub trait Tracker: Send + Sync {
    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>>;

    fn can_announce(&self, time: Instant) -> bool;

    fn should_announce(&self, time: Instant) -> bool;

    async fn run(
        &mut self,
        torrent_tx: TorrentTx,
        mut tracker_rx: watch::Receiver<Option<AnnounceParams>>,
    ) -> Result<()> {
        loop {
            tracker_rx.changed().await.ok();
            let params = *tracker_rx.borrow();
            let time = Instant::now();

            if let Some(params) = params {
                if params.event.is_some()
                    || (params.num_want > Some(0) && self.can_announce(time))
                    || self.should_announce(time)
                {
                    let peers = self.announce(params).await?;
                    if torrent_tx.send(TorrentCommand::PeersDiscovered(peers)).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnnounceParams {
    pub info_hash: ID,

    pub client_id: ID,

    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    pub left: u64,

    pub event: Option<Event>,

    pub num_want: Option<usize>,
}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum Event {
    Completed,

    #[default]
    Started,

    Stopped,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}
