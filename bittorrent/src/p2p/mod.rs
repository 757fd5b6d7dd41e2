use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{block::BlockData, torrent::TorrentContext};

mod session;
mod message;
mod handshake;
pub mod state;
pub mod extended;
pub mod client_id;

pub use session::PeerSession;
pub use message::{Message, MessageCodec};
pub use handshake::{Handshake, HandshakeCodec, PROTOCOL};
use state::SessionState;

type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake recieved")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent before handshake")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("connection timeout")]
    Timeout,

    #[error("channel error: {0}")]
    Channel(String),
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands that can be sent to a peer session from elsewhere.
pub enum PeerCommand {
    // Tell the peer we got a piece (piece idx).
    PieceWritten(usize),

    // Block read from disk, to be sent to the peer.
    BlockRead(BlockData),

    // Choking decision made by `Torrent`'s choking algorithm: `true` chokes
    // the peer, `false` unchokes it. A no-op if it matches current state.
    SetChoked(bool),

    Shutdown,
}

#[derive(Debug)]
pub struct PeerHandle {
    // Sends commands to the peer session.
    pub peer_tx: Option<PeerTx>,

    // Peer id, filled in once the handshake completes.
    pub id: Option<[u8; 20]>,

    // Handle to the peer session task.
    pub session_handle: Option<JoinHandle<()>>,

    // Tracks the state of the peer session.
    pub state: SessionState,
}

impl PeerHandle {
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        socket: Option<tokio::net::TcpStream>,
    ) -> Self {
        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(
            async move {
                let result = session.start_session(socket).await;
                if let Err(e) = &result {
                    tracing::error!("session error: {}", e);
                }
                session.disconnect(result.err().map(|e| e.to_string())).await;
            }
            .instrument(tracing::info_span!("peer", addr = %address)),
        );

        PeerHandle {
            peer_tx: Some(peer_tx),
            id: None,
            session_handle: Some(session_handle),
            state: SessionState::default(),
        }
    }
}
