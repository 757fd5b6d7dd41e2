#![allow(dead_code)]

mod metainfo;
mod store;
mod torrent;
mod tracker;
mod p2p;
mod fs;
mod disk;
mod block;
mod picker;
mod de;
mod bitfield;
mod endgame;
mod stats;
mod config;
mod swarm;
mod choke;
mod magnet;
mod interfaces;
mod error;
mod persist;
mod opqueue;
mod engine;

const BLOCK_SIZE: usize = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// A raw 20-byte SHA-1 identifier: an info hash or a peer id.
pub type ID = [u8; 20];

pub use metainfo::MetaInfo;
pub use torrent::{Torrent, TorrentConfig};
pub use engine::{BtEngine, EngineHandle, RestoredTorrent};
pub use config::EngineConfig;
pub use error::EngineError;
pub use magnet::MagnetLink;
pub use store::FilePriority;