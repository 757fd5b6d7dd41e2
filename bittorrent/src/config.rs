use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: [u8; 20],
}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0133-73b3b0b0b0b0";

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
        }
    }
}

/// Top-level configuration for a `BtEngine`, covering everything that is
/// process-wide rather than per-torrent: listening sockets, the operation
/// rate limiter, disk concurrency, buffering, and session persistence.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub client: ClientConfig,

    pub listen_address: SocketAddr,

    /// Directory downloads are written to when a torrent doesn't override it.
    pub default_output_dir: PathBuf,

    /// Directory `.parts` sidecar files and the session store live in.
    pub state_dir: PathBuf,

    /// Operation queue: sustained operations/sec across the whole engine.
    pub op_rate_per_sec: u32,

    /// Operation queue: burst allowance on top of the sustained rate.
    pub op_burst: u32,

    /// Operation queue tick interval.
    pub op_tick: Duration,

    /// Concurrent disk worker count.
    pub disk_workers: usize,

    /// Max in-memory bytes buffered across all active pieces.
    pub max_buffered_bytes: usize,

    /// Max duplicate in-flight requests per block once in endgame.
    pub max_duplicate_requests: usize,

    pub min_max_peers: (u32, u32),

    pub announce_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            default_output_dir: PathBuf::from("downloads"),
            state_dir: PathBuf::from("state"),
            op_rate_per_sec: 20,
            op_burst: 40,
            op_tick: Duration::from_millis(50),
            disk_workers: 4,
            max_buffered_bytes: crate::picker::active_piece::DEFAULT_MAX_BUFFERED_BYTES,
            max_duplicate_requests: crate::endgame::DEFAULT_MAX_DUPLICATE_REQUESTS,
            min_max_peers: (5, 100),
            announce_interval: Duration::from_secs(1800),
        }
    }
}
