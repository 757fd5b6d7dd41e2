use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_bytes::ByteBuf;

use super::Result;

/// Bencoded sidecar holding the bytes of pieces that straddle a skipped
/// file (`boundary` pieces) — we still download them (the non-skipped
/// portion is wanted) but can't write the skipped portion anywhere, so the
/// whole piece is parked here until the file is un-skipped or the piece is
/// rechecked.
type PartsDict = BTreeMap<String, ByteBuf>;

#[derive(Debug)]
pub struct PartsFile {
    path: PathBuf,
    pieces: BTreeMap<usize, Vec<u8>>,
}

impl PartsFile {
    pub fn open(torrent_root: &Path) -> Result<Self> {
        let path = torrent_root.join(".parts");
        let pieces = if path.exists() {
            let raw = std::fs::read(&path)?;
            let dict: PartsDict = bencode::decode_bytes(&raw)?;
            dict.into_iter()
                .filter_map(|(k, v)| k.parse::<usize>().ok().map(|idx| (idx, v.into_vec())))
                .collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, pieces })
    }

    pub fn get(&self, piece_idx: usize) -> Option<&[u8]> {
        self.pieces.get(&piece_idx).map(|v| v.as_slice())
    }

    pub fn contains(&self, piece_idx: usize) -> bool {
        self.pieces.contains_key(&piece_idx)
    }

    pub fn piece_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.pieces.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn insert(&mut self, piece_idx: usize, data: Vec<u8>) -> Result<()> {
        self.pieces.insert(piece_idx, data);
        self.persist()
    }

    pub fn remove(&mut self, piece_idx: usize) -> Result<()> {
        self.pieces.remove(&piece_idx);
        self.persist()
    }

    /// Atomic update protocol: write to `.parts.tmp`, fsync, rename over
    /// `.parts`. An empty dict removes the file entirely.
    fn persist(&self) -> Result<()> {
        if self.pieces.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }

        let dict: PartsDict = self
            .pieces
            .iter()
            .map(|(idx, data)| (idx.to_string(), ByteBuf::from(data.clone())))
            .collect();
        let encoded = bencode::encode_to_raw(&dict)?;

        let tmp_path = self.path.with_extension("parts.tmp");
        let mut tmp = std::fs::File::create(&tmp_path)?;
        tmp.write_all(&encoded)?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_reopen_yields_same_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut parts = PartsFile::open(dir.path()).unwrap();
        parts.insert(3, vec![1, 2, 3]).unwrap();
        parts.insert(9, vec![4, 5, 6, 7]).unwrap();

        let reopened = PartsFile::open(dir.path()).unwrap();
        assert_eq!(reopened.get(3), Some(&[1, 2, 3][..]));
        assert_eq!(reopened.get(9), Some(&[4, 5, 6, 7][..]));
        assert_eq!(reopened.piece_indices().count(), 2);
    }

    #[test]
    fn removing_last_piece_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut parts = PartsFile::open(dir.path()).unwrap();
        parts.insert(0, vec![9]).unwrap();
        parts.remove(0).unwrap();
        assert!(!dir.path().join(".parts").exists());
        assert!(parts.is_empty());
    }
}
