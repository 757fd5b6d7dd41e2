pub mod kv;
pub mod schema;

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::interfaces::SessionStore;
use schema::{TorrentIndex, TorrentIndexEntry, TorrentSource, TorrentState};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, PersistError>;

/// What a restore walk needs to hand back to `BtEngine` for one torrent:
/// everything required to reconstruct it without re-fetching metadata.
#[derive(Debug, Clone)]
pub struct RestoreEntry {
    pub info_hash: String,
    pub source: TorrentSource,
    pub magnet_uri: Option<String>,
    pub torrentfile: Option<Vec<u8>>,
    pub infodict: Option<Vec<u8>>,
    pub state: Option<TorrentState>,
}

/// Thin layer over `SessionStore` implementing the multi-key schema:
/// one index plus three per-torrent keys. Every read tolerates a missing
/// key (fresh install, or a torrent with no metadata-specific key yet);
/// every write is a plain `set`, relying on the store's own durability.
pub struct SessionPersistence {
    store: Arc<dyn SessionStore>,
}

impl SessionPersistence {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub async fn load_index(&self) -> Result<TorrentIndex> {
        match self.store.get(&kv::torrents_index()).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(TorrentIndex::default()),
        }
    }

    async fn save_index(&self, index: &TorrentIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)?;
        self.store.set(&kv::torrents_index(), bytes).await?;
        Ok(())
    }

    /// No-op if the hash is already indexed — `BtEngine::add_torrent` calls
    /// this unconditionally on every add, including restores.
    pub async fn add_torrent(
        &self,
        info_hash_hex: &str,
        source: TorrentSource,
        magnet_uri: Option<String>,
        added_at: i64,
    ) -> Result<()> {
        let mut index = self.load_index().await?;
        if index.torrents.iter().any(|t| t.info_hash == info_hash_hex) {
            return Ok(());
        }
        index.torrents.push(TorrentIndexEntry {
            info_hash: info_hash_hex.to_string(),
            source,
            magnet_uri,
            added_at,
        });
        self.save_index(&index).await
    }

    /// Drops the index entry and every per-torrent key.
    pub async fn remove_torrent(&self, info_hash_hex: &str) -> Result<()> {
        let mut index = self.load_index().await?;
        index.torrents.retain(|t| t.info_hash != info_hash_hex);
        self.save_index(&index).await?;

        self.store.delete(&kv::torrent_state(info_hash_hex)).await?;
        self.store.delete(&kv::torrent_file(info_hash_hex)).await?;
        self.store.delete(&kv::torrent_infodict(info_hash_hex)).await?;
        Ok(())
    }

    pub async fn save_state(&self, info_hash_hex: &str, state: &TorrentState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        self.store.set(&kv::torrent_state(info_hash_hex), bytes).await?;
        Ok(())
    }

    pub async fn load_state(&self, info_hash_hex: &str) -> Result<Option<TorrentState>> {
        match self.store.get(&kv::torrent_state(info_hash_hex)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn save_torrentfile(&self, info_hash_hex: &str, raw: &[u8]) -> Result<()> {
        self.store
            .set(&kv::torrent_file(info_hash_hex), STANDARD.encode(raw).into_bytes())
            .await?;
        Ok(())
    }

    pub async fn load_torrentfile(&self, info_hash_hex: &str) -> Result<Option<Vec<u8>>> {
        match self.store.get(&kv::torrent_file(info_hash_hex)).await? {
            Some(b64) => Ok(Some(STANDARD.decode(b64)?)),
            None => Ok(None),
        }
    }

    pub async fn save_infodict(&self, info_hash_hex: &str, raw: &[u8]) -> Result<()> {
        self.store
            .set(&kv::torrent_infodict(info_hash_hex), STANDARD.encode(raw).into_bytes())
            .await?;
        Ok(())
    }

    pub async fn load_infodict(&self, info_hash_hex: &str) -> Result<Option<Vec<u8>>> {
        match self.store.get(&kv::torrent_infodict(info_hash_hex)).await? {
            Some(b64) => Ok(Some(STANDARD.decode(b64)?)),
            None => Ok(None),
        }
    }

    /// Walks `session:torrents` and loads every other key for each entry.
    /// A torrent with neither `.torrent` bytes nor an info dict still comes
    /// back (its `state` may still be useful for re-adding by magnet), per
    /// the "bitfield restored only if metadata is available" rule — that
    /// decision is `BtEngine`'s, not this layer's.
    pub async fn restore(&self) -> Result<Vec<RestoreEntry>> {
        let index = self.load_index().await?;
        let mut entries = Vec::with_capacity(index.torrents.len());
        for entry in index.torrents {
            let torrentfile = self.load_torrentfile(&entry.info_hash).await?;
            let infodict = self.load_infodict(&entry.info_hash).await?;
            let state = self.load_state(&entry.info_hash).await?;
            entries.push(RestoreEntry {
                info_hash: entry.info_hash,
                source: entry.source,
                magnet_uri: entry.magnet_uri,
                torrentfile,
                infodict,
                state,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::FileSessionStore;
    use schema::UserState;

    fn persistence() -> (SessionPersistence, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSessionStore::new(dir.path().to_path_buf()));
        (SessionPersistence::new(store), dir)
    }

    #[tokio::test]
    async fn add_torrent_is_idempotent_and_appears_in_index() {
        let (persist, _dir) = persistence();
        persist.add_torrent("aabb", TorrentSource::File, None, 1000).await.unwrap();
        persist.add_torrent("aabb", TorrentSource::File, None, 2000).await.unwrap();

        let index = persist.load_index().await.unwrap();
        assert_eq!(index.version, schema::SCHEMA_VERSION);
        assert_eq!(index.torrents.len(), 1);
        assert_eq!(index.torrents[0].added_at, 1000);
    }

    #[tokio::test]
    async fn save_restore_save_state_round_trips_byte_identical() {
        let (persist, _dir) = persistence();
        let state = TorrentState {
            user_state: UserState::Active,
            storage_key: Some("default".into()),
            queue_position: Some(0),
            bitfield: Some("ff00".into()),
            uploaded: 10,
            downloaded: 20,
            file_priorities: Some(vec![1, 1, 0]),
            updated_at: 42,
        };
        persist.save_state("aabb", &state).await.unwrap();
        let first = persist.store.get(&kv::torrent_state("aabb")).await.unwrap().unwrap();

        let loaded = persist.load_state("aabb").await.unwrap().unwrap();
        persist.save_state("aabb", &loaded).await.unwrap();
        let second = persist.store.get(&kv::torrent_state("aabb")).await.unwrap().unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn torrentfile_round_trips_through_base64() {
        let (persist, _dir) = persistence();
        let raw = b"d8:announce...e".to_vec();
        persist.save_torrentfile("aabb", &raw).await.unwrap();
        let loaded = persist.load_torrentfile("aabb").await.unwrap().unwrap();
        assert_eq!(loaded, raw);
    }

    #[tokio::test]
    async fn restore_walks_index_and_collects_every_key() {
        let (persist, _dir) = persistence();
        persist
            .add_torrent("aabb", TorrentSource::Magnet, Some("magnet:?xt=urn:btih:aabb".into()), 1)
            .await
            .unwrap();
        persist.save_infodict("aabb", b"infodict-bytes").await.unwrap();
        persist
            .save_state(
                "aabb",
                &TorrentState {
                    user_state: UserState::Active,
                    storage_key: None,
                    queue_position: None,
                    bitfield: None,
                    uploaded: 0,
                    downloaded: 0,
                    file_priorities: None,
                    updated_at: 1,
                },
            )
            .await
            .unwrap();

        let restored = persist.restore().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].info_hash, "aabb");
        assert_eq!(restored[0].infodict.as_deref(), Some(&b"infodict-bytes"[..]));
        assert!(restored[0].torrentfile.is_none());
        assert!(restored[0].state.is_some());
    }

    #[tokio::test]
    async fn remove_torrent_drops_index_entry_and_all_keys() {
        let (persist, _dir) = persistence();
        persist.add_torrent("aabb", TorrentSource::File, None, 1).await.unwrap();
        persist.save_torrentfile("aabb", b"raw").await.unwrap();

        persist.remove_torrent("aabb").await.unwrap();

        assert!(persist.load_index().await.unwrap().torrents.is_empty());
        assert!(persist.load_torrentfile("aabb").await.unwrap().is_none());
    }
}
