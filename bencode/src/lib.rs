#![allow(unused)]

// Convention from https://serde.rs/conventions.html
mod encode;
mod decode;
mod error;
mod token;

pub use decode::{decode_bytes, decode_str, DecodedType};
pub use encode::{encode_to_raw, encode_to_string};
pub use error::{Error, Result};
pub use token::Token;

#[cfg(test)]
mod tests {
    use std::path::Path;

    #[test]
    fn load() {
        let b = std::fs::read(Path::new("../debian.torrent"));
        if let Ok(b) = b {
            println!("{:?}", String::from_utf8_lossy(&b));
        }
    }
}
