//! JSON shapes stored under the keys in `kv.rs`. Kept separate from the
//! read/write logic in `mod.rs` so the on-disk schema is visible at a
//! glance, the same split the teacher uses between `metainfo::Info` (shape)
//! and `metainfo::MetaInfo::new` (I/O).

use serde_derive::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentSource {
    File,
    Magnet,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TorrentIndexEntry {
    pub info_hash: String,
    pub source: TorrentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnet_uri: Option<String>,
    pub added_at: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TorrentIndex {
    pub version: u32,
    pub torrents: Vec<TorrentIndexEntry>,
}

impl Default for TorrentIndex {
    fn default() -> Self {
        Self { version: SCHEMA_VERSION, torrents: Vec::new() }
    }
}

/// Mirrors the activity-state transitions `Torrent` goes through: normal
/// download/seed, a user-requested pause, and the terminal `error` state a
/// torrent enters on `MissingStorageRoot` or similar unrecoverable faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    Active,
    Paused,
    Seeding,
    Error,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TorrentState {
    pub user_state: UserState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
    /// Hex-encoded own bitfield, present once a torrent has started
    /// verifying pieces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitfield: Option<String>,
    pub uploaded: u64,
    pub downloaded: u64,
    /// One priority byte per file, in file order, only written once a user
    /// has changed a default priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_priorities: Option<Vec<u8>>,
    pub updated_at: i64,
}
