use thiserror::Error;

use crate::fs::DiskError;
use crate::metainfo::MetaInfoError;
use crate::p2p::PeerError;
use crate::torrent::TorrentError;
use crate::tracker::TrackerError;

/// Aggregated error type surfaced by `BtEngine`'s public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("disk error: {0}")]
    Disk(#[from] DiskError),

    #[error("metainfo error: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("persistence error: {0}")]
    Persist(#[from] crate::persist::PersistError),

    #[error("unknown torrent: {0}")]
    UnknownTorrent(String),

    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
