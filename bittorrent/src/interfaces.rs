//! Boundary traits between the engine and the outside world: sockets, the
//! filesystem, hashing, and key-value session storage. Concrete engine code
//! is built against these rather than `tokio::net`/`std::fs` directly so a
//! daemon transport (HTTP-tunneled sockets/files, as described for the
//! external interface surface) can stand in without touching engine logic.
//! `persist.rs` is the current real consumer of `SessionStore`; everything
//! else here has exactly one implementation (the local/tokio one) for now.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::ID;

/// A single established TCP connection to a peer or tracker.
#[async_trait]
pub trait TcpSocket: Send + Sync {
    async fn send(&mut self, data: &[u8]) -> io::Result<()>;
    /// Reads whatever is currently available, up to `buf`'s length. Returns
    /// `Ok(0)` exactly once, on clean close.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait TcpServer: Send + Sync {
    async fn accept(&self) -> io::Result<(Box<dyn TcpSocket>, std::net::SocketAddr)>;
    fn local_addr(&self) -> io::Result<std::net::SocketAddr>;
}

#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn create_tcp_socket(&self, host: &str, port: u16) -> io::Result<Box<dyn TcpSocket>>;
    async fn create_tcp_server(&self, port: u16) -> io::Result<Box<dyn TcpServer>>;
}

pub struct TokioTcpSocket(TcpStream);

#[async_trait]
impl TcpSocket for TokioTcpSocket {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write_all(data).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

pub struct TokioTcpServer(TcpListener);

#[async_trait]
impl TcpServer for TokioTcpServer {
    async fn accept(&self) -> io::Result<(Box<dyn TcpSocket>, std::net::SocketAddr)> {
        let (stream, addr) = self.0.accept().await?;
        Ok((Box::new(TokioTcpSocket(stream)), addr))
    }

    fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.0.local_addr()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSocketFactory;

#[async_trait]
impl SocketFactory for TokioSocketFactory {
    async fn create_tcp_socket(&self, host: &str, port: u16) -> io::Result<Box<dyn TcpSocket>> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(TokioTcpSocket(stream)))
    }

    async fn create_tcp_server(&self, port: u16) -> io::Result<Box<dyn TcpServer>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Box::new(TokioTcpServer(listener)))
    }
}

/// File open mode, mirrored from the daemon transport's header-encoded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

#[async_trait]
pub trait FileHandle: Send + Sync {
    async fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    async fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<usize>;
    async fn truncate(&mut self, len: u64) -> io::Result<()>;
    async fn sync(&mut self) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;

    /// Backends that can verify a hash atomically as part of the next write
    /// override this; a mismatch should surface as `DiskError::HashMismatch`
    /// (HTTP 409 over the daemon transport). The local filesystem backend
    /// has no such capability and leaves this a no-op.
    async fn set_expected_hash_for_next_write(&mut self, _sha1: Option<ID>) {}
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn open(&self, root_key: &Path, rel_path: &Path, mode: OpenMode) -> io::Result<Box<dyn FileHandle>>;
}

pub struct StdFileHandle {
    file: tokio::fs::File,
}

#[async_trait]
impl FileHandle for StdFileHandle {
    async fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        self.file.seek(io::SeekFrom::Start(offset)).await?;
        self.file.read(buf).await
    }

    async fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        use tokio::io::AsyncSeekExt;
        self.file.seek(io::SeekFrom::Start(offset)).await?;
        self.file.write(data).await
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len).await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.file.flush().await
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

#[async_trait]
impl FileSystem for StdFileSystem {
    async fn open(&self, root_key: &Path, rel_path: &Path, mode: OpenMode) -> io::Result<Box<dyn FileHandle>> {
        let path = root_key.join(rel_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut opts = tokio::fs::OpenOptions::new();
        opts.create(true);
        match mode {
            OpenMode::Read => {
                opts.read(true);
            }
            OpenMode::Write => {
                opts.write(true);
            }
            OpenMode::ReadWrite => {
                opts.read(true).write(true);
            }
        }
        let file = opts.open(path).await?;
        Ok(Box::new(StdFileHandle { file }))
    }
}

/// Key-value session store. Keys are the schema's flat strings
/// (`session:torrents`, `session:torrent:{hash}:state`, ...); values are raw
/// bytes, base64-encoded internally when the transport needs text.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> io::Result<()>;
    async fn delete(&self, key: &str) -> io::Result<()>;
    async fn keys(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Default implementation loops over `get`; backends with a native
    /// batch-get should override it.
    async fn get_multi(&self, keys: &[String]) -> io::Result<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }
}

/// One file per key under `root`, with `/` and `:` escaped so keys like
/// `session:torrent:{hash}:state` don't collide with directory separators.
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized: String = key.chars().map(|c| if c == '/' { '_' } else { c }).collect();
        self.root.join(sanitized)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &value).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                let key = name.replace('_', "/");
                if key.starts_with(prefix) {
                    out.push(key);
                }
            }
        }
        Ok(out)
    }
}

/// Used wherever a backend reports `has_hash_verification_capability() ==
/// false` and the engine must hash a piece itself before writing.
pub trait Hasher: Send + Sync {
    fn sha1(&self, bytes: &[u8]) -> ID;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Hasher;

impl Hasher for Sha1Hasher {
    fn sha1(&self, bytes: &[u8]) -> ID {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_hasher_matches_known_digest() {
        let hasher = Sha1Hasher;
        let digest = hasher.sha1(b"abc");
        assert_eq!(hex::encode(digest), "a9993e364706816aba3e25717850c26c9cd0d89");
    }

    #[tokio::test]
    async fn file_session_store_round_trips_and_lists_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().to_path_buf());

        store.set("session:torrents", b"{}".to_vec()).await.unwrap();
        store
            .set("session:torrent:aabb:state", b"{\"userState\":\"active\"}".to_vec())
            .await
            .unwrap();

        assert_eq!(store.get("session:torrents").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.get("missing").await.unwrap(), None);

        let keys = store.keys("session:torrent:").await.unwrap();
        assert_eq!(keys, vec!["session:torrent:aabb:state".to_string()]);

        store.delete("session:torrents").await.unwrap();
        assert_eq!(store.get("session:torrents").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_multi_default_impl_skips_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().to_path_buf());
        store.set("a", vec![1]).await.unwrap();

        let result = store
            .get_multi(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(result.get("a"), Some(&vec![1]));
        assert_eq!(result.get("b"), None);
    }
}
