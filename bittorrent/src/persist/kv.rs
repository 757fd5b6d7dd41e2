//! Key names for the session store, kept in one place so nothing else in
//! the crate hand-formats a `session:torrent:{h}:...` string.

pub fn torrents_index() -> String {
    "session:torrents".to_string()
}

pub fn torrent_state(info_hash_hex: &str) -> String {
    format!("session:torrent:{}:state", info_hash_hex)
}

pub fn torrent_file(info_hash_hex: &str) -> String {
    format!("session:torrent:{}:torrentfile", info_hash_hex)
}

pub fn torrent_infodict(info_hash_hex: &str) -> String {
    format!("session:torrent:{}:infodict", info_hash_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_the_documented_format() {
        assert_eq!(torrents_index(), "session:torrents");
        assert_eq!(torrent_state("aabb"), "session:torrent:aabb:state");
        assert_eq!(torrent_file("aabb"), "session:torrent:aabb:torrentfile");
        assert_eq!(torrent_infodict("aabb"), "session:torrent:aabb:infodict");
    }
}
