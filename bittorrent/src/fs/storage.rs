use std::sync::{Arc, Mutex, RwLock};

use sha1::{Digest, Sha1};

use crate::bitfield::BitfieldExt;
use crate::store::{FilePriority, PieceClass, StoreInfo};
use crate::{Bitfield, ID};

use super::file::TorrentFile;
use super::parts::PartsFile;
use super::{DiskError, Result};

/// Maps the torrent's logical byte stream to the files on disk and performs
/// the actual reads and writes. Holds no knowledge of peers, pieces-in-flight
/// or the wire protocol — it only knows how to get bytes in and out of files
/// at the right offsets.
///
/// `set_expected_hash_for_next_write` mirrors the optional daemon capability
/// described for `IFileSystem`: a backend that can verify a SHA-1 atomically
/// on write would use it here. The local filesystem backend has no such
/// capability, so the hash is recorded but never consulted — callers must
/// verify before calling `write_piece` (see `has_hash_verification_capability`).
///
/// File priorities are the one piece of mutable state not folded into
/// `StoreInfo` (which is otherwise plain owned geometry): they change at
/// runtime when a user skips or un-skips a file, so they live here behind a
/// `Mutex` alongside the `.parts` sidecar they control.
#[derive(Debug)]
pub struct ContentStorage {
    info: StoreInfo,
    files: Vec<RwLock<TorrentFile>>,
    read_cache: Mutex<lru::LruCache<usize, Arc<Vec<u8>>>>,
    expected_hash: Mutex<Option<ID>>,
    priorities: Mutex<Vec<FilePriority>>,
    parts: Mutex<PartsFile>,
}

const READ_CACHE_SIZE: usize = 64;

impl ContentStorage {
    pub fn new(info: StoreInfo) -> Result<Self> {
        if !info.output_dir.is_dir() {
            std::fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        debug_assert!(!info.files.is_empty());
        let mut files = Vec::with_capacity(info.files.len());
        for file in info.files.iter() {
            let path = info.output_dir.join(&file.path);
            if let Some(subdir) = path.parent() {
                if !subdir.exists() && subdir != info.output_dir {
                    tracing::info!("creating sub-directory: {:?}", subdir);
                    std::fs::create_dir_all(subdir)?;
                }
            }
            files.push(RwLock::new(TorrentFile::new(&info.output_dir, file.clone())?));
        }

        let priorities = info.files.iter().map(|f| f.priority).collect();
        let parts = PartsFile::open(&info.output_dir)?;

        Ok(Self {
            info,
            files,
            read_cache: Mutex::new(lru::LruCache::new(
                std::num::NonZeroUsize::new(READ_CACHE_SIZE).unwrap(),
            )),
            expected_hash: Mutex::new(None),
            priorities: Mutex::new(priorities),
            parts: Mutex::new(parts),
        })
    }

    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    /// Local filesystem backend never verifies hashes on-wire; the engine
    /// must hash before calling `write_piece`.
    pub fn has_hash_verification_capability(&self) -> bool {
        false
    }

    pub fn set_expected_hash_for_next_write(&self, hash: Option<ID>) {
        *self.expected_hash.lock().unwrap() = hash;
    }

    pub fn set_file_priority(&self, file_idx: usize, priority: FilePriority) {
        self.priorities.lock().unwrap()[file_idx] = priority;
    }

    pub fn file_priorities(&self) -> Vec<FilePriority> {
        self.priorities.lock().unwrap().clone()
    }

    pub fn piece_classification(&self, piece_idx: usize) -> PieceClass {
        self.info.piece_classification(piece_idx, &self.priorities.lock().unwrap())
    }

    pub fn piece_priority(&self, piece_idx: usize) -> u8 {
        self.info.piece_priority(piece_idx, &self.priorities.lock().unwrap())
    }

    /// `advertised[i] = bitfield[i] AND NOT partsFilePieces.contains(i)` — a
    /// piece only held as a whole blob in `.parts` (because it's `Boundary`
    /// and the skipped portion has nowhere else to live) must never be
    /// advertised with HAVE, or a peer could request bytes we can't serve.
    pub fn advertised_bitfield(&self, bitfield: &Bitfield) -> Bitfield {
        let mut parts_bitfield = Bitfield::new_zeroed(bitfield.len());
        for idx in self.parts.lock().unwrap().piece_indices() {
            if idx < parts_bitfield.len() {
                parts_bitfield.set(idx, true);
            }
        }
        bitfield.and_not(&parts_bitfield)
    }

    pub fn is_parked_in_parts(&self, piece_idx: usize) -> bool {
        self.parts.lock().unwrap().contains(piece_idx)
    }

    /// Writes the whole piece, splitting across file boundaries as needed.
    /// `Blacklisted` pieces are a picker bug if they ever reach here — no
    /// bytes are wanted, so nothing is written. `Boundary` pieces are
    /// written to their wanted files only, with the full piece additionally
    /// parked in `.parts` since the skipped portion has no file to live in.
    pub fn write_piece(&self, piece_idx: usize, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.info.piece_length(piece_idx));

        if let Some(expected) = self.expected_hash.lock().unwrap().take() {
            let mut hasher = Sha1::new();
            hasher.update(data);
            if hasher.finalize().as_slice() != expected {
                return Err(DiskError::HashMismatch { piece_idx });
            }
        }

        match self.piece_classification(piece_idx) {
            PieceClass::Blacklisted => {
                tracing::warn!("write_piece called for blacklisted piece {}", piece_idx);
                return Ok(());
            }
            PieceClass::Wanted => {
                self.write_piece_files(piece_idx, data, false)?;
                self.parts.lock().unwrap().remove(piece_idx)?;
            }
            PieceClass::Boundary => {
                self.write_piece_files(piece_idx, data, true)?;
                self.parts.lock().unwrap().insert(piece_idx, data.to_vec())?;
            }
        }

        self.read_cache.lock().unwrap().pop(&piece_idx);
        Ok(())
    }

    /// Re-writes a piece currently parked in `.parts` after one of its
    /// skipped files has been un-skipped: writes the full piece (now every
    /// touching file is wanted) and drops the sidecar copy.
    pub fn materialize_parked_piece(&self, piece_idx: usize) -> Result<()> {
        let data = {
            let parts = self.parts.lock().unwrap();
            parts
                .get(piece_idx)
                .map(|d| d.to_vec())
                .ok_or(DiskError::NotParked { piece_idx })?
        };
        self.write_piece_files(piece_idx, &data, false)?;
        self.parts.lock().unwrap().remove(piece_idx)?;
        self.read_cache.lock().unwrap().pop(&piece_idx);
        Ok(())
    }

    /// Shared write loop behind `write_piece`/`materialize_parked_piece`.
    /// When `skip_skipped_files` is set, bytes belonging to a currently
    /// skipped file are not written at all (used for `Boundary` pieces,
    /// whose skipped portion only ever lives in `.parts`).
    fn write_piece_files(&self, piece_idx: usize, data: &[u8], skip_skipped_files: bool) -> Result<()> {
        let file_range = self.info.piece_file_intersections(piece_idx);
        let piece_offset = self.info.piece_byte_offset(piece_idx);
        let priorities = self.priorities.lock().unwrap().clone();
        let mut written = 0;
        let mut offset = piece_offset;

        for (file, priority) in self.files[file_range.clone()].iter().zip(&priorities[file_range]) {
            let mut f = file.write()?;
            let byte_range = f.info.byte_range();
            let file_offset = offset - byte_range.start;
            let remaining_in_piece = data.len() - written;
            let remaining_in_file = byte_range.end - offset;
            let n = remaining_in_piece.min(remaining_in_file);

            if !(skip_skipped_files && *priority == FilePriority::Skip) {
                let wrote = f.write_at(file_offset, &data[written..written + n])?;
                if wrote != n {
                    return Err(DiskError::IoSizeError { expected: n, actual: wrote });
                }
            }
            written += n;
            offset += n;
        }

        if written != data.len() {
            return Err(DiskError::IoSizeError { expected: data.len(), actual: written });
        }
        Ok(())
    }

    /// Reads `length` bytes starting at `begin` within `piece_idx`, possibly
    /// spanning multiple files. Whole pieces are cached so that repeated
    /// block reads from the same piece (common — peers request 16 KiB at a
    /// time) don't re-hit disk.
    pub fn read_block(&self, piece_idx: usize, begin: usize, length: usize) -> Result<Arc<Vec<u8>>> {
        if let Some(piece) = self.read_cache.lock().unwrap().get(&piece_idx) {
            if begin + length <= piece.len() {
                return Ok(Arc::new(piece[begin..begin + length].to_vec()));
            }
        }

        let piece = Arc::new(self.read_piece(piece_idx)?);
        self.read_cache.lock().unwrap().put(piece_idx, Arc::clone(&piece));

        if begin + length > piece.len() {
            return Err(DiskError::IoSizeError { expected: begin + length, actual: piece.len() });
        }
        Ok(Arc::new(piece[begin..begin + length].to_vec()))
    }

    /// Reads a whole piece. `Boundary` pieces' wanted portion is on disk but
    /// their skipped portion never is, so those are read back from `.parts`
    /// (which always holds the complete piece) instead of the files.
    fn read_piece(&self, piece_idx: usize) -> Result<Vec<u8>> {
        if let Some(data) = self.parts.lock().unwrap().get(piece_idx) {
            return Ok(data.to_vec());
        }

        let piece_len = self.info.piece_length(piece_idx);
        let file_range = self.info.piece_file_intersections(piece_idx);
        let piece_offset = self.info.piece_byte_offset(piece_idx);

        let mut buf = vec![0u8; piece_len];
        let mut read = 0;
        let mut offset = piece_offset;

        for file in &self.files[file_range] {
            let mut f = file.write()?;
            let byte_range = f.info.byte_range();
            let file_offset = offset - byte_range.start;
            let remaining_in_piece = piece_len - read;
            let remaining_in_file = byte_range.end - offset;
            let n = remaining_in_piece.min(remaining_in_file);

            let got = f.read_at(file_offset, &mut buf[read..read + n])?;
            if got != n {
                return Err(DiskError::IoSizeError { expected: n, actual: got });
            }
            read += got;
            offset += got;
        }

        if read != piece_len {
            return Err(DiskError::IoSizeError { expected: piece_len, actual: read });
        }
        Ok(buf)
    }

    /// Hashes every piece currently on disk and returns a bitfield of the
    /// ones that verify, used both at startup (resuming a torrent) and
    /// during an explicit recheck.
    pub fn verify_all(&self, piece_hashes: &[ID]) -> crate::Bitfield {
        let mut bitfield = Bitfield::new_zeroed(self.info.num_pieces as usize);
        for piece_idx in 0..self.info.num_pieces as usize {
            match self.read_piece(piece_idx) {
                Ok(data) => {
                    let mut hasher = Sha1::new();
                    hasher.update(&data);
                    if hasher.finalize().as_slice() == piece_hashes[piece_idx] {
                        bitfield.set(piece_idx, true);
                    }
                }
                Err(_) => continue,
            }
        }
        bitfield
    }
}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::SyncError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::MetaInfo;

    fn test_store(dir: &std::path::Path) -> ContentStorage {
        let metainfo = MetaInfo::new(std::path::Path::new("tests/test_torrents/test_multi.torrent")).unwrap();
        let info = StoreInfo::new(&metainfo, dir.to_path_buf());
        ContentStorage::new(info).unwrap()
    }

    #[test]
    fn write_then_read_block_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_store(dir.path());
        let len = storage.info().piece_length(0);
        let data = vec![7u8; len];
        storage.write_piece(0, &data).unwrap();
        let block = storage.read_block(0, 0, 16).unwrap();
        assert_eq!(&block[..], &data[0..16]);
    }

    #[test]
    fn hash_mismatch_is_rejected_when_expected_set() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_store(dir.path());
        let len = storage.info().piece_length(0);
        storage.set_expected_hash_for_next_write(Some([0xAB; 20]));
        let err = storage.write_piece(0, &vec![0u8; len]).unwrap_err();
        assert!(matches!(err, DiskError::HashMismatch { .. }));
    }

    fn two_file_store(dir: &std::path::Path) -> ContentStorage {
        let files = vec![
            crate::store::FileInfo {
                path: "a.bin".into(),
                length: 10,
                offset: 0,
                md5sum: None,
                priority: FilePriority::Normal,
            },
            crate::store::FileInfo {
                path: "b.bin".into(),
                length: 10,
                offset: 10,
                md5sum: None,
                priority: FilePriority::Normal,
            },
        ];
        let info = StoreInfo {
            total_len: 20,
            piece_len: 20,
            last_piece_len: 20,
            num_pieces: 1,
            files,
            output_dir: dir.to_path_buf(),
        };
        ContentStorage::new(info).unwrap()
    }

    #[test]
    fn boundary_piece_is_parked_in_parts_and_not_advertised() {
        let dir = tempfile::tempdir().unwrap();
        let storage = two_file_store(dir.path());
        storage.set_file_priority(1, FilePriority::Skip);
        assert_eq!(storage.piece_classification(0), PieceClass::Boundary);

        let data: Vec<u8> = (0..20).collect();
        storage.write_piece(0, &data).unwrap();
        assert!(storage.is_parked_in_parts(0));

        let read_back = storage.read_block(0, 0, 20).unwrap();
        assert_eq!(&read_back[..], &data[..]);

        let mut bitfield = Bitfield::new_zeroed(1);
        bitfield.set(0, true);
        let advertised = storage.advertised_bitfield(&bitfield);
        assert!(!advertised[0]);
    }

    #[test]
    fn un_skipping_materializes_a_parked_piece() {
        let dir = tempfile::tempdir().unwrap();
        let storage = two_file_store(dir.path());
        storage.set_file_priority(1, FilePriority::Skip);
        let data: Vec<u8> = (0..20).collect();
        storage.write_piece(0, &data).unwrap();
        assert!(storage.is_parked_in_parts(0));

        storage.set_file_priority(1, FilePriority::Normal);
        storage.materialize_parked_piece(0).unwrap();
        assert!(!storage.is_parked_in_parts(0));

        let mut bitfield = Bitfield::new_zeroed(1);
        bitfield.set(0, true);
        let advertised = storage.advertised_bitfield(&bitfield);
        assert!(advertised[0]);
    }

    #[test]
    fn blacklisted_piece_write_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let storage = two_file_store(dir.path());
        storage.set_file_priority(0, FilePriority::Skip);
        storage.set_file_priority(1, FilePriority::Skip);
        assert_eq!(storage.piece_classification(0), PieceClass::Blacklisted);

        let data = vec![0xFFu8; 20];
        storage.write_piece(0, &data).unwrap();
        assert!(!storage.is_parked_in_parts(0));
    }
}
