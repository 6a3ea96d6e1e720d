//! Torrent file parser
//!
//! Turns the bytes of a .torrent file into a validated [`TorrentDescriptor`].

use std::path::Path;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, trace, warn};

use crate::bencode::{self, BencodeValue};
use crate::error::TorrentError;
use crate::torrent::descriptor::{generate_peer_id, FileEntry, TorrentDescriptor};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentDescriptor> {
        info!("Parsing torrent file from {} bytes", data.len());

        let root = bencode::parse(data)?;

        let info = root
            .get(b"info")
            .ok_or_else(|| TorrentError::invalid_torrent_field("Missing info dictionary", "info"))?;
        if !info.is_dict() {
            return Err(TorrentError::invalid_torrent_field(
                format!("Expected dictionary, got {}", info.kind()),
                "info",
            )
            .into());
        }

        let raw_info = bencode::raw_dict_entry(data, b"info")?
            .ok_or_else(|| TorrentError::invalid_torrent_field("Missing info dictionary", "info"))?;
        let info_hash = Self::info_hash(raw_info);
        debug!("Info hash: {}", hex::encode(info_hash));

        let name = Self::path_component(info.get(b"name"), "name")?;

        let piece_length = Self::required_int(info, b"piece length", "piece length")?;
        if piece_length <= 0 || piece_length > u32::MAX as i64 {
            error!("Invalid piece length: {}", piece_length);
            return Err(TorrentError::invalid_torrent_field(
                format!("Piece length out of range: {}", piece_length),
                "piece length",
            )
            .into());
        }
        let piece_length = piece_length as u32;

        let pieces_bytes = info
            .get(b"pieces")
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| TorrentError::invalid_torrent_field("Missing pieces field", "pieces"))?;
        let pieces = Self::piece_hashes(pieces_bytes)?;

        let (multi_file, files) = Self::files(info, &name)?;

        let descriptor = TorrentDescriptor {
            name,
            info_hash,
            piece_length,
            pieces,
            multi_file,
            files,
            announce_list: Self::announce_list(&root),
            peer_id: generate_peer_id(),
        };

        let total = descriptor.total_length();
        if total == 0 {
            return Err(TorrentError::invalid_torrent("Torrent has no content").into());
        }
        let expected = total.div_ceil(piece_length as u64);
        if expected != descriptor.piece_count() as u64 {
            error!(
                "Piece count mismatch: {} hashes for {} bytes at piece length {}",
                descriptor.piece_count(),
                total,
                piece_length
            );
            return Err(TorrentError::invalid_torrent_field(
                format!("Expected {} piece hashes, found {}", expected, descriptor.piece_count()),
                "pieces",
            )
            .into());
        }

        if descriptor.announce_list.is_empty() {
            warn!("Torrent '{}' lists no trackers", descriptor.name);
        }

        info!(
            "Parsed torrent '{}': {} files, {} bytes, {} pieces",
            descriptor.name,
            descriptor.files.len(),
            total,
            descriptor.piece_count()
        );
        Ok(descriptor)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentDescriptor> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data).map_err(|e| match e.downcast::<TorrentError>() {
            Ok(err) => err.with_context(path.display().to_string()).into(),
            Err(e) => e,
        })
    }

    /// SHA-1 over the info dictionary exactly as stored
    pub fn info_hash(raw_info: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(raw_info);
        hasher.finalize().into()
    }

    fn piece_hashes(bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if bytes.len() % 20 != 0 {
            return Err(TorrentError::invalid_torrent_field(
                format!("Length must be a multiple of 20, got {}", bytes.len()),
                "pieces",
            )
            .into());
        }
        Ok(bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    fn files(info: &BencodeValue, name: &str) -> Result<(bool, Vec<FileEntry>)> {
        match (info.get(b"length"), info.get(b"files")) {
            (Some(_), Some(_)) => Err(TorrentError::invalid_torrent(
                "Info dictionary has both 'length' and 'files'",
            )
            .into()),
            (Some(length), None) => {
                let length = Self::length_value(length, "length")?;
                Ok((false, vec![FileEntry { path: vec![name.to_string()], length }]))
            }
            (None, Some(files)) => {
                let list = files
                    .as_list()
                    .ok_or_else(|| TorrentError::invalid_torrent_field("Expected list", "files"))?;
                if list.is_empty() {
                    return Err(TorrentError::invalid_torrent_field("Empty file list", "files").into());
                }
                let mut entries = Vec::with_capacity(list.len());
                let mut total: u64 = 0;
                for entry in list {
                    let length = entry
                        .get(b"length")
                        .ok_or_else(|| TorrentError::invalid_torrent_field("Missing file length", "files.length"))?;
                    let length = Self::length_value(length, "files.length")?;
                    total = total.checked_add(length).ok_or_else(|| {
                        TorrentError::invalid_torrent_field("Total length overflows", "files.length")
                    })?;
                    let components = entry
                        .get(b"path")
                        .and_then(BencodeValue::as_list)
                        .ok_or_else(|| TorrentError::invalid_torrent_field("Missing file path", "files.path"))?;
                    if components.is_empty() {
                        return Err(TorrentError::invalid_torrent_field("Empty file path", "files.path").into());
                    }
                    let path = components
                        .iter()
                        .map(|c| Self::path_component(Some(c), "files.path"))
                        .collect::<Result<Vec<_>>>()?;
                    trace!("File entry: {} ({} bytes)", path.join("/"), length);
                    entries.push(FileEntry { path, length });
                }
                Ok((true, entries))
            }
            (None, None) => Err(TorrentError::invalid_torrent(
                "Info dictionary has neither 'length' nor 'files'",
            )
            .into()),
        }
    }

    /// `announce` first, then every tier of `announce-list`, without duplicates
    fn announce_list(root: &BencodeValue) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let mut push = |value: &BencodeValue| {
            if let Some(url) = value.as_str().map(str::trim) {
                if !url.is_empty() && !urls.iter().any(|u| u == url) {
                    urls.push(url.to_string());
                }
            }
        };

        if let Some(announce) = root.get(b"announce") {
            push(announce);
        }
        if let Some(tiers) = root.get(b"announce-list").and_then(BencodeValue::as_list) {
            for tier in tiers {
                match tier.as_list() {
                    Some(list) => list.iter().for_each(&mut push),
                    None => warn!("Skipping malformed announce-list tier"),
                }
            }
        }
        urls
    }

    fn required_int(dict: &BencodeValue, key: &[u8], field: &str) -> Result<i64> {
        dict.get(key)
            .and_then(BencodeValue::as_int)
            .ok_or_else(|| TorrentError::invalid_torrent_field("Missing or non-integer value", field).into())
    }

    fn length_value(value: &BencodeValue, field: &str) -> Result<u64> {
        match value.as_int() {
            Some(n) if n >= 0 => Ok(n as u64),
            Some(n) => Err(TorrentError::invalid_torrent_field(format!("Negative length {}", n), field).into()),
            None => Err(TorrentError::invalid_torrent_field("Length must be an integer", field).into()),
        }
    }

    /// A single path component that cannot escape the output directory
    fn path_component(value: Option<&BencodeValue>, field: &str) -> Result<String> {
        let bytes = value
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| TorrentError::invalid_torrent_field("Missing or non-string path", field))?;
        let component = String::from_utf8_lossy(bytes).into_owned();
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('/')
            || component.contains('\\')
            || component.contains('\0')
        {
            error!("Rejecting unsafe path component {:?}", component);
            return Err(TorrentError::invalid_torrent_field(
                format!("Unsafe path component {:?}", component),
                field,
            )
            .into());
        }
        Ok(component)
    }
}
