pub mod file;
pub mod parts;
pub mod storage;

pub use file::TorrentFile;
pub use parts::PartsFile;
pub use storage::ContentStorage;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("io error: expected {expected} bytes, got {actual}")]
    IoSizeError { expected: usize, actual: usize },

    #[error("piece {piece_idx} failed hash verification on write")]
    HashMismatch { piece_idx: usize },

    #[error("piece {piece_idx} is not parked in .parts")]
    NotParked { piece_idx: usize },

    #[error("sync error: {0}")]
    SyncError(String),

    #[error("channel error: {0}")]
    ChannelError(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DiskError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DiskError::ChannelError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
