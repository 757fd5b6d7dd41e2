use std::collections::HashMap;
use serde_derive::{Deserialize, Serialize};

use super::PeerError;

/// Extension message id we advertise for `ut_metadata` (BEP 9).
pub const UT_METADATA_ID: u8 = 1;

/// BEP 10 extended handshake payload, sent as `Message::Extended { id: 0, .. }`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtendedHandshake {
    /// Extension name -> local extension message id.
    pub m: HashMap<String, u8>,

    /// Our listening port, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,

    /// Client version string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,

    /// Total size of the info dict, required to drive ut_metadata requests.
    #[serde(rename = "metadata_size", skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u64>,

    /// Max outstanding request queue length the peer is willing to accept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,
}

impl ExtendedHandshake {
    pub fn new(listen_port: u16, metadata_size: Option<u64>) -> Self {
        let mut m = HashMap::new();
        m.insert("ut_metadata".to_string(), UT_METADATA_ID);
        Self {
            m,
            p: Some(listen_port),
            v: Some(format!("rust-bittorrent/{}", env!("CARGO_PKG_VERSION"))),
            metadata_size,
            reqq: Some(500),
        }
    }

    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.get("ut_metadata").copied()
    }

    pub fn encode(&self) -> Result<Vec<u8>, PeerError> {
        bencode::encode_to_raw(self).map_err(|_| PeerError::InvalidMessage)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        bencode::decode_bytes(payload).map_err(|_| PeerError::InvalidMessage)
    }
}

/// BEP 9 ut_metadata message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMsgType {
    Request,
    Data,
    Reject,
}

impl MetadataMsgType {
    fn as_i64(self) -> i64 {
        match self {
            MetadataMsgType::Request => 0,
            MetadataMsgType::Data => 1,
            MetadataMsgType::Reject => 2,
        }
    }

    fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(MetadataMsgType::Request),
            1 => Some(MetadataMsgType::Data),
            2 => Some(MetadataMsgType::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataMsgHeader {
    msg_type: i64,
    piece: u32,
    #[serde(rename = "total_size", skip_serializing_if = "Option::is_none")]
    total_size: Option<u64>,
}

pub const METADATA_PIECE_SIZE: u64 = 16 * 1024;

/// ut_metadata wire message: a bencoded header, with `Data` messages
/// appending the raw metadata-piece bytes directly after the bencoded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u64, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn encode(&self) -> Result<Vec<u8>, PeerError> {
        let (header, data) = match self {
            MetadataMessage::Request { piece } => (
                MetadataMsgHeader { msg_type: MetadataMsgType::Request.as_i64(), piece: *piece, total_size: None },
                None,
            ),
            MetadataMessage::Data { piece, total_size, data } => (
                MetadataMsgHeader { msg_type: MetadataMsgType::Data.as_i64(), piece: *piece, total_size: Some(*total_size) },
                Some(data),
            ),
            MetadataMessage::Reject { piece } => (
                MetadataMsgHeader { msg_type: MetadataMsgType::Reject.as_i64(), piece: *piece, total_size: None },
                None,
            ),
        };
        let mut out = bencode::encode_to_raw(&header).map_err(|_| PeerError::InvalidMessage)?;
        if let Some(data) = data {
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        // The bencoded header is a prefix; the remainder (if any) is raw
        // piece data for `Data` messages. We don't know the header's exact
        // byte length ahead of time, so decode greedily by trying
        // successively shorter prefixes is wasteful; instead rely on the
        // bencode decoder consuming exactly the dict and report any trailing
        // bytes as the block payload via a best-effort dict-end scan.
        let dict_end = find_bencoded_dict_end(payload).ok_or(PeerError::InvalidMessage)?;
        let header: MetadataMsgHeader =
            bencode::decode_bytes(&payload[..dict_end]).map_err(|_| PeerError::InvalidMessage)?;
        let msg_type = MetadataMsgType::from_i64(header.msg_type).ok_or(PeerError::InvalidMessage)?;
        match msg_type {
            MetadataMsgType::Request => Ok(MetadataMessage::Request { piece: header.piece }),
            MetadataMsgType::Reject => Ok(MetadataMessage::Reject { piece: header.piece }),
            MetadataMsgType::Data => {
                let total_size = header.total_size.ok_or(PeerError::InvalidMessage)?;
                Ok(MetadataMessage::Data {
                    piece: header.piece,
                    total_size,
                    data: payload[dict_end..].to_vec(),
                })
            }
        }
    }
}

/// Finds the end offset of a single top-level bencoded dictionary at the
/// start of `buf`, by tracking bencode nesting depth.
fn find_bencoded_dict_end(buf: &[u8]) -> Option<usize> {
    if buf.first() != Some(&b'd') {
        return None;
    }
    let mut depth = 0i32;
    let mut i = 0usize;
    while i < buf.len() {
        match buf[i] {
            b'd' | b'l' => {
                depth += 1;
                i += 1;
            }
            b'e' => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            b'i' => {
                let end = buf[i..].iter().position(|&b| b == b'e')? + i;
                i = end + 1;
            }
            b'0'..=b'9' => {
                let colon = buf[i..].iter().position(|&b| b == b':')? + i;
                let len: usize = std::str::from_utf8(&buf[i..colon]).ok()?.parse().ok()?;
                i = colon + 1 + len;
            }
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trip() {
        let hs = ExtendedHandshake::new(6881, Some(12345));
        let encoded = hs.encode().unwrap();
        let decoded = ExtendedHandshake::decode(&encoded).unwrap();
        assert_eq!(decoded.ut_metadata_id(), Some(UT_METADATA_ID));
        assert_eq!(decoded.metadata_size, Some(12345));
        assert_eq!(decoded.p, Some(6881));
    }

    #[test]
    fn metadata_request_round_trip() {
        let msg = MetadataMessage::Request { piece: 3 };
        let encoded = msg.encode().unwrap();
        let decoded = MetadataMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn metadata_data_round_trip_with_trailing_payload() {
        let msg = MetadataMessage::Data { piece: 2, total_size: 40_000, data: vec![1, 2, 3, 4, 5] };
        let encoded = msg.encode().unwrap();
        let decoded = MetadataMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }
}
