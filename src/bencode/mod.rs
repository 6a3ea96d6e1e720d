//! Bencode codec
//!
//! Decoder and encoder for the format used by torrent files and HTTP
//! tracker responses.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::{decode, parse, raw_dict_entry};
pub use encode::encode;
pub use value::BencodeValue;
