/// Resolves a 20-byte peer id into a human-readable client name, for
/// logging and peer stats. Covers the common Azureus-style `-XX####-`
/// prefix convention; anything else is reported as unknown rather than
/// guessed at.
pub fn client_name(peer_id: &[u8; 20]) -> String {
    if peer_id[0] == b'-' && peer_id.len() >= 8 && peer_id[7] == b'-' {
        let tag = &peer_id[1..3];
        let version = &peer_id[3..7];
        let name = match tag {
            b"qB" => "qBittorrent",
            b"UT" => "uTorrent",
            b"TR" => "Transmission",
            b"lt" | b"LT" => "libtorrent",
            b"DE" => "Deluge",
            b"AZ" => "Azureus/Vuze",
            b"rq" => "rqbit",
            b"RS" => "rust-bittorrent",
            b"BT" => "BitTorrent",
            b"wW" => "WebTorrent",
            _ => return format!("unknown ({})", String::from_utf8_lossy(tag)),
        };
        format!("{} {}", name, String::from_utf8_lossy(version))
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_common_clients() {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-qB4450-");
        assert!(client_name(&id).starts_with("qBittorrent"));
    }

    #[test]
    fn unknown_for_non_azureus_style() {
        let id = [b'M'; 20];
        assert_eq!(client_name(&id), "unknown");
    }
}
