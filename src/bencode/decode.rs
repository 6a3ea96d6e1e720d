//! Bencode decoder
//!
//! Consumes exactly one value from the front of a buffer and hands back
//! whatever follows it.

use anyhow::Result;
use tracing::{trace, warn};

use super::BencodeValue;
use crate::error::TorrentError;

/// Nesting limit for lists and dictionaries
const MAX_DEPTH: usize = 256;

/// Decode one bencoded value from the front of `data`.
///
/// Returns the unconsumed remainder together with the value.
pub fn decode(data: &[u8]) -> Result<(&[u8], BencodeValue)> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    Ok((&data[decoder.pos..], value))
}

/// Decode a whole document whose root must be a dictionary
pub fn parse(data: &[u8]) -> Result<BencodeValue> {
    let (rest, value) = decode(data)?;
    if !rest.is_empty() {
        warn!("Ignoring {} trailing bytes after bencoded document", rest.len());
    }
    if !value.is_dict() {
        return Err(TorrentError::invalid_torrent(format!(
            "Root value must be a dictionary, got {}",
            value.kind()
        ))
        .into());
    }
    Ok(value)
}

/// Byte span of the value stored under `key` in the top-level dictionary.
///
/// The slice is exactly as it appears in `data`, which is what the
/// info-hash is computed over.
pub fn raw_dict_entry<'a>(data: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>> {
    if data.first() != Some(&b'd') {
        return Err(TorrentError::invalid_torrent("Root value must be a dictionary").into());
    }
    let mut decoder = Decoder { data, pos: 1 };
    loop {
        match decoder.peek() {
            Some(b'e') => return Ok(None),
            Some(_) => {}
            None => return Err(TorrentError::decode_error_at("Unterminated dictionary", decoder.pos).into()),
        }
        let entry_key = decoder.key()?;
        let start = decoder.pos;
        decoder.value(1)?;
        if entry_key == key {
            trace!("Found raw entry for key {:?} at {}..{}", String::from_utf8_lossy(key), start, decoder.pos);
            return Ok(Some(&data[start..decoder.pos]));
        }
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn value(&mut self, depth: usize) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(TorrentError::decode_error_at("Nesting too deep", self.pos).into());
        }
        match self.peek() {
            None => Err(TorrentError::decode_error_at("Unexpected end of input", self.pos).into()),
            Some(b'i') => self.integer(),
            Some(b'l') => self.list(depth),
            Some(b'd') => self.dict(depth),
            Some(b'0'..=b'9') => Ok(BencodeValue::Bytes(self.bytes()?.to_vec())),
            Some(other) => Err(TorrentError::decode_error_at(
                format!("Unknown value tag 0x{:02x}", other),
                self.pos,
            )
            .into()),
        }
    }

    fn integer(&mut self) -> Result<BencodeValue> {
        let start = self.pos;
        self.pos += 1;
        let end = self.data[self.pos..]
            .iter()
            .position(|&b| b == b'e')
            .map(|i| self.pos + i)
            .ok_or_else(|| TorrentError::decode_error_at("Unterminated integer", start))?;

        let digits = &self.data[self.pos..end];
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
            return Err(TorrentError::decode_error_at(
                format!("Invalid integer {:?}", String::from_utf8_lossy(digits)),
                start,
            )
            .into());
        }
        // all bytes are ASCII at this point
        let text = std::str::from_utf8(digits).map_err(|e| TorrentError::decode_error_at(e.to_string(), start))?;
        let value: i64 = text
            .parse()
            .map_err(|e| TorrentError::decode_error_at(format!("Integer out of range: {}", e), start))?;

        self.pos = end + 1;
        Ok(BencodeValue::Integer(value))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let colon = self.data[self.pos..]
            .iter()
            .position(|&b| b == b':')
            .map(|i| self.pos + i)
            .ok_or_else(|| TorrentError::decode_error_at("Missing ':' after string length", start))?;

        let prefix = &self.data[self.pos..colon];
        if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
            return Err(TorrentError::decode_error_at(
                format!("Non-numeric string length {:?}", String::from_utf8_lossy(prefix)),
                start,
            )
            .into());
        }
        let length: usize = std::str::from_utf8(prefix)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TorrentError::decode_error_at("String length out of range", start))?;

        let body_start = colon + 1;
        let remaining = self.data.len() - body_start;
        if length > remaining {
            return Err(TorrentError::decode_error_at(
                format!("String length {} exceeds remaining {} bytes", length, remaining),
                start,
            )
            .into());
        }

        self.pos = body_start + length;
        Ok(&self.data[body_start..self.pos])
    }

    fn list(&mut self, depth: usize) -> Result<BencodeValue> {
        let start = self.pos;
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::List(items));
                }
                Some(_) => items.push(self.value(depth + 1)?),
                None => return Err(TorrentError::decode_error_at("Unterminated list", start).into()),
            }
        }
    }

    fn dict(&mut self, depth: usize) -> Result<BencodeValue> {
        let start = self.pos;
        self.pos += 1;
        let mut entries = Vec::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::Dict(entries));
                }
                Some(_) => {
                    let key = self.key()?.to_vec();
                    if self.peek().is_none() {
                        return Err(TorrentError::decode_error_at("Dictionary key without value", start).into());
                    }
                    let value = self.value(depth + 1)?;
                    entries.push((key, value));
                }
                None => return Err(TorrentError::decode_error_at("Unterminated dictionary", start).into()),
            }
        }
    }

    fn key(&mut self) -> Result<&'a [u8]> {
        match self.peek() {
            Some(b'0'..=b'9') => self.bytes(),
            _ => Err(TorrentError::decode_error_at("Dictionary key must be a byte string", self.pos).into()),
        }
    }
}
