use std::time::Instant;

use crate::stats::ThroughputStats;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
    Handshaking,
    Introducing, // Where peers tell each other what pieces they have.
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub conn_state: ConnState,

    // Whether we are answering the peer's requests.
    pub choked: bool,

    // Whether we are interested in the peer's pieces.
    pub interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    pub throughput: ThroughputStats,

    pub num_pieces: usize,

    pub changed: bool,

    pub connect_time: Option<Instant>,

    // Last instant the peer sent us a block or we sent the peer a block,
    // used by the anti-snub check in the choking algorithm.
    pub last_useful_exchange: Option<Instant>,
}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            throughput: ThroughputStats::default(),
            changed: false,
            num_pieces: 0,
            connect_time: None,
            last_useful_exchange: None,
        }
    }
}

impl SessionState {
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.throughput.record(now);
        self.changed = false;
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }
}
