use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{sync::mpsc, net::TcpStream, time};
use tokio_util::codec::Framed;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use sha1::{Digest, Sha1};
use crate::{
    block::{BlockData, BlockInfo, BlockPayload, BlockRequest},
    disk::JobKind,
    picker::active_piece::ActivePiece,
    torrent::{TorrentCommand, TorrentContext},
    Bitfield,
};
use super::{*, extended::ExtendedHandshake, message::*, handshake::*, state::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

#[derive(Debug)]
pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Context is a read only state accessible by all peers.
    torrent_ctx: Arc<TorrentContext>,

    // Commands to the peer.
    peer_rx: PeerRx,

    // Internal send channel for disk reads.
    peer_tx: PeerTx,

    // Pending block requests from peer to the client.
    requests_in: HashSet<BlockRequest>,

    // Pending block requests from client to peer.
    requests_out: HashSet<BlockRequest>,

    // Bitfield of pieces the peer currently has.
    bitfield: Bitfield,

    state: SessionState,

    // Whether both sides advertised BEP 10 support in their handshake.
    extended_enabled: bool,

    // The peer's extended handshake, once received.
    peer_extended: Option<ExtendedHandshake>,

}

impl PeerSession {

    pub fn new(address: SocketAddr, torrent_ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, torrent_ctx.info.num_pieces as usize);

        (
            PeerSession {
                address,
                torrent_ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                bitfield,
                state: SessionState::default(),
                requests_in: HashSet::new(),
                requests_out: HashSet::new(),
                extended_enabled: false,
                peer_extended: None,
            },
            peer_tx,
        )
    }

    #[tracing::instrument(name = "peer", skip(self, inbound_stream), fields(address = %self.address))]
    pub async fn start_session(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let inbound = inbound_stream.is_some();
        let mut socket = if let Some(stream) = inbound_stream {
            Framed::new(stream, HandshakeCodec)
        } else {
            let timeout = time::Duration::from_secs(10);
            let stream = time::timeout(timeout, TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::Timeout)??;
            tracing::trace!("outbound connection successful");
            Framed::new(stream, HandshakeCodec)
        };

        self.exchange_handshake(&mut socket, inbound).await?;

        let socket = Framed::new(socket.into_inner(), MessageCodec);
        self.run(socket).await
    }

    pub async fn disconnect(&mut self, error: Option<String>) {
        self.state.update(|state| *state = SessionState::default());
        self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerDisconnected {
            address: self.address,
            error,
        }).ok();
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>, inbound: bool) -> Result<Handshake> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let handshake = Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.client_id);
        let we_support_extended = handshake.supports_extended();

        if !inbound {
            tracing::info!("send handshake");
            socket.send(handshake).await?;
        }

        tracing::trace!("waiting for handshake");
        // Receive handshake.
        if let Some(Ok(peer_handshake)) = socket.next().await {
            tracing::info!("read: handshake");

            // Validate handshake.
            if peer_handshake.protocol != PROTOCOL {
                return Err(PeerError::IncorrectProtocol);
            }
            if peer_handshake.info_hash != self.torrent_ctx.info_hash {
                return Err(PeerError::IncorrectInfoHash);
            }

            // Respond with handshake if connection is inbound.
            if inbound {
                tracing::info!("send handshake");
                socket.send(Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.client_id)).await?;
            }

            tracing::info!("handshake successful, peer connected");
            self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerConnected {
                address: self.address,
                id: peer_handshake.peer_id,
            })?;

            self.extended_enabled = we_support_extended && peer_handshake.supports_extended();
            Ok(peer_handshake)

        } else {
            Err(PeerError::NoHandshake)
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.connect_time = Some(Instant::now());
        self.state.update(|state| state.conn_state = ConnState::Introducing);
        let (mut sink, mut stream) = socket.split();

        if self.extended_enabled {
            let handshake = ExtendedHandshake::new(self.torrent_ctx.listen_port, None);
            match handshake.encode() {
                Ok(payload) => self.send_message(&mut sink, Message::Extended { id: 0, payload }).await?,
                Err(e) => tracing::warn!("failed to encode extended handshake: {}", e),
            }
        }

        let advertised = {
            let picker = self.torrent_ctx.picker.piece_picker.read().await;
            self.torrent_ctx.storage.advertised_bitfield(picker.own_bitfield())
        };
        if advertised.count_ones() > 0 {
            self.send_message(&mut sink, Message::Bitfield(advertised)).await?;
        }

        let mut ticker = time::interval(time::Duration::from_secs(1));

        loop { tokio::select! {

            // Message from peer.
            Some(Ok(msg)) = stream.next() => self.handle_msg(&mut sink, msg).await?,

            // Command from elsewhere in application.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {

                    // From disk.
                    PeerCommand::BlockRead(block) => self.send_block(&mut sink, block).await?,

                    PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await?,

                    // From the choking algorithm.
                    PeerCommand::SetChoked(choked) => self.set_choked(&mut sink, choked).await?,

                    // From torrent.
                    PeerCommand::Shutdown => {
                        tracing::info!("session shutdown");
                        break;
                    },

                }
            }

            t = ticker.tick() => self.tick(t.into_std()).await?,

        }}

        Ok(())
    }

    // TODO: send multiple messages in one go, rather than flushing after each one?, particularly for requests.
    // Logs a message and sends to peer.
    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("send: {}", msg);
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("read: {}", msg);

        match msg {

            // Bitfield can only be sent directly after handshake.
            Message::Bitfield(bitfiled) => {
                if self.state.conn_state == ConnState::Introducing {
                    self.handle_bitfield(sink, bitfiled).await?;
                } else {
                    tracing::error!("unexpected bitfield");
                    return Err(PeerError::UnexpectedBitfield);
                }
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    // Free pending requests for other peers.
                    self.free_requests_out().await;
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    // Start to make requests if interested.
                    if self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            },

            Message::Interested => {
                // Whether to unchoke is decided by the torrent's choking
                // algorithm on its own tick, not here.
                self.state.update(|state| state.peer_interested = true);
            },

            Message::NotInterested => self.state.peer_interested = false,

            Message::Block(block) => {
                self.handle_block(block).await?;
                self.make_requests(sink).await?;
            },

            // TODO: do we need to stop whole task if request is invalid?
            // Will need to match error.
            Message::Request(request) => self.handle_request(request).await?,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Port { port } => {
                // DHT isn't implemented; the peer is just telling us its
                // node's port so we could bootstrap off it if we had a table.
                tracing::trace!("peer dht port: {}", port);
            },

            Message::Extended { id, payload } => self.handle_extended(id, payload).await?,

            Message::Cancel(block_info) => self.handle_cancel(block_info).await?,

        }

        // After bitfiled
        if self.state.conn_state == ConnState::Introducing {

            // Check if either us or peer has any pieces.
            if self.torrent_ctx.picker.piece_picker.read().await.own_bitfield().not_any()
            && self.bitfield.not_any()
            {
                tracing::warn!("no pieces in connection");
                self.peer_tx.send(PeerCommand::Shutdown)?;
                return Ok(())
            }

            self.state.update(|state| state.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), self.torrent_ctx.info.num_pieces);
        // Remove trailing bits.
        bitfield.resize(self.torrent_ctx.info.num_pieces as usize, false);
        // Interested if peer has pieces we don't.
        let interested = self.torrent_ctx.picker.piece_picker.write().await.bitfield_update(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones() as usize);
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        // If idx is not valid, disconnect.
        if idx >= self.torrent_ctx.info.num_pieces {
            tracing::error!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        // Peer already has piece.
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = self
            .torrent_ctx
            .picker
            .piece_picker
            .write()
            .await
            .increment_piece(idx as usize);

        self.update_interest(sink, interested).await
    }

    async fn handle_extended(&mut self, id: u8, payload: Vec<u8>) -> Result<()> {
        if id == 0 {
            match ExtendedHandshake::decode(&payload) {
                Ok(handshake) => {
                    tracing::info!("peer extended handshake: {:?}", handshake);
                    self.peer_extended = Some(handshake);
                }
                Err(e) => tracing::warn!("invalid extended handshake: {}", e),
            }
        } else {
            // ut_metadata and other BEP 10 extensions aren't served yet.
            tracing::trace!("unhandled extended message id {}: {} byte payload", id, payload.len());
        }
        Ok(())
    }

    async fn handle_block(&mut self, block: BlockData) -> Result<()> {

        let request = BlockInfo::from_block(&block);
        if !self.requests_out.remove(&request) {
            // TODO: penalise peer.
            // TODO: add defence against random block spamming.
            tracing::warn!("unexpected block: {:?}", &request);
            return Ok(());
        }

        self.state.update(|state| {
            state.throughput.down += block.data.len() as u64;
            state.last_useful_exchange = Some(Instant::now());
        });

        let piece_idx = request.piece_idx;
        let peer = self.address;

        let completed = {
            let mut active = self.torrent_ctx.picker.active.write().await;
            let Some(piece) = active.get_mut(piece_idx) else {
                // Block is being checked for in requests_out, so it should
                // normally be in active; endgame duplicates that landed
                // after the piece already finished are the one exception.
                tracing::warn!("received block for non-active piece: {:?}", &request);
                return Ok(());
            };
            let is_duplicate = piece.add_block(block, peer);
            if is_duplicate {
                tracing::warn!("duplicate block: {:?}", &request);
                return Ok(());
            }
            if piece.is_complete() {
                active.remove(piece_idx)
            } else {
                None
            }
        };

        if let Some(piece) = completed {
            let ctx = self.torrent_ctx.clone();
            tokio::spawn(async move { finalize_piece(ctx, piece_idx, piece).await });
        }

        Ok(())
    }

    async fn handle_request(&mut self, request: BlockRequest) -> Result<()> {

        if self.state.choked {
            // TODO: maybe send peer a choke message rather than disconnect.
            tracing::error!("sending requests whilst choked");
            return Err(PeerError::InvalidMessage);
        }
        if !request.is_valid(&self.torrent_ctx.info) {
            tracing::error!("invalid request: {:?}", request);
            return Err(PeerError::InvalidMessage);
        }
        if self.requests_in.contains(&request) {
            tracing::warn!("duplicate request: {:?}", request);
            return Ok(());
        }

        self.requests_in.insert(request);

        let ctx = self.torrent_ctx.clone();
        let peer_tx = self.peer_tx.clone();
        tokio::spawn(async move {
            let storage = Arc::clone(&ctx.storage);
            let file_count = ctx.info.piece_file_intersections(request.piece_idx).len();
            let result = ctx
                .disk_queue
                .enqueue(JobKind::Read, request.piece_idx, file_count, request.len, move || {
                    let storage = Arc::clone(&storage);
                    async move {
                        tokio::task::spawn_blocking(move || {
                            storage.read_block(request.piece_idx, request.offset, request.len)
                        })
                        .await
                    }
                })
                .await;

            match result {
                Ok(Ok(data)) => {
                    let block = BlockData {
                        piece_idx: request.piece_idx,
                        offset: request.offset,
                        data: BlockPayload::Cached(data),
                    };
                    peer_tx.send(PeerCommand::BlockRead(block)).ok();
                }
                Ok(Err(e)) => tracing::error!("failed to read block {:?}: {}", request, e),
                Err(e) => tracing::error!("read task for block {:?} panicked: {}", request, e),
            }
        });

        Ok(())
    }

    async fn handle_cancel(&mut self, block_info: BlockRequest) -> Result<()> {
        if !block_info.is_valid(&self.torrent_ctx.info) {
            tracing::warn!("invalid cancel: {:?}", block_info);
            return Err(PeerError::InvalidMessage);
        }
        self.requests_in.remove(&block_info);
        Ok(())
    }

    // When a piece is written to disk:
    // - Send a have message if the peer doesn't have it.
    // - Cancel any requests for the piece.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        if !self.bitfield[idx] {
            sink.send(Message::Have { idx: idx as u32 }).await?;
        } else {
            for block in self.requests_out.iter() {
                if block.piece_idx == idx {
                    sink.send(Message::Cancel(*block)).await?;
                }
            }
        }

        Ok(())
    }

    // Applies a choking decision from the torrent's choking algorithm.
    async fn set_choked(&mut self, sink: &mut MessageSink, choked: bool) -> Result<()> {
        if self.state.choked == choked {
            return Ok(());
        }
        self.state.update(|state| state.choked = choked);
        if choked {
            self.send_message(sink, Message::Choke).await?;
        } else {
            self.send_message(sink, Message::Unchoke).await?;
        }
        Ok(())
    }

    // Queue requests up to a certain target queue length.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking || !self.state.interested {
            tracing::warn!("attempted to make requests whilst not interested or choked by peer");
            return Ok(())
        }

        let requests = self
            .torrent_ctx.picker
            .pick_blocks(self.address, &self.requests_out, 20, &self.bitfield, Instant::now())
            .await;

        for block in requests {
            tracing::info!("send request: {:?}", block);
            self.requests_out.insert(block);
            sink.send(Message::Request(block)).await?;
        }

        Ok(())
    }

    // Remove the request and send peer block.
    async fn send_block(&mut self, sink: &mut MessageSink, block: BlockData) -> Result<()> {
        let request: BlockRequest = BlockInfo::from_block(&block);
        if !self.requests_in.remove(&request) {
            // TODO: think about under what circumstances this would occur.
            tracing::warn!("block read but no request: {:?}", request);
            return Ok(());
        }
        sink.send(Message::Block(block)).await?;
        self.state.update(|state| state.throughput.up += request.len as u64);
        Ok(())
    }

    // Free all requested blocks, making them available for other peers.
    async fn free_requests_out(&mut self) {
        tracing::info!("freeing requested blocks");
        let mut active = self.torrent_ctx.picker.active.write().await;
        for request in self.requests_out.drain() {
            if let Some(piece) = active.get_mut(request.piece_idx) {
                piece.free_request(&request);
                tracing::trace!("freed block request: {:?}", request);
            }
        }
    }

    // If we have BECOME interested, send a message to indicate this.
    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if !self.state.interested && interested {
            self.state.interested = true;
            self.send_message(sink, Message::Interested).await?;
        } else if self.state.interested && !interested {
            self.state.interested = false;
        }
        Ok(())
    }

    async fn tick(&mut self, time: Instant) -> Result<()> {

        if !self.state.interested
        && !self.state.peer_interested
        && time.saturating_duration_since(self.state.connect_time.unwrap())
            >= time::Duration::from_secs(30)
        {
            tracing::warn!("disconnecting peer due to inactivity");
            return Err(PeerError::Timeout)
        }

        // Send stats if there is a state change.
        if self.state.changed {
            self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerState {
                address: self.address,
                state: self.state.clone(),
            })?;
        }
        self.state.tick();

        Ok(())
    }
}

/// Hashes a completed piece and, if it verifies, enqueues the write and
/// reports the result back to the owning `Torrent`. Runs detached from any
/// single peer session since the piece may have been completed from blocks
/// contributed by several peers.
async fn finalize_piece(ctx: Arc<TorrentContext>, piece_idx: usize, piece: ActivePiece) {
    let expected_hash = ctx.piece_hashes[piece_idx];
    let data = piece.assemble();

    let (data, hash_ok) = match tokio::task::spawn_blocking(move || {
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let ok = hasher.finalize().as_slice() == expected_hash;
        (data, ok)
    })
    .await
    {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("hash task for piece {} panicked: {}", piece_idx, e);
            return;
        }
    };

    if !hash_ok {
        tracing::warn!("piece {} failed hash verification, discarding", piece_idx);
        ctx.torrent_tx.send(TorrentCommand::PieceWritten { idx: piece_idx, valid: false }).ok();
        return;
    }

    let storage = Arc::clone(&ctx.storage);
    let file_count = ctx.info.piece_file_intersections(piece_idx).len();
    let size = data.len();
    let write_result = ctx
        .disk_queue
        .enqueue(JobKind::Write, piece_idx, file_count, size, move || {
            let storage = Arc::clone(&storage);
            async move { tokio::task::spawn_blocking(move || storage.write_piece(piece_idx, &data)).await }
        })
        .await;

    let valid = matches!(write_result, Ok(Ok(())));
    match &write_result {
        Ok(Err(e)) => tracing::error!("failed to write piece {}: {}", piece_idx, e),
        Err(e) => tracing::error!("write task for piece {} panicked: {}", piece_idx, e),
        _ => {}
    }

    ctx.torrent_tx.send(TorrentCommand::PieceWritten { idx: piece_idx, valid }).ok();
}
