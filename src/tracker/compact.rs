//! Compact peer format
//!
//! Six bytes per peer: IPv4 address then port, both big-endian.

use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::Result;
use tracing::trace;

use super::PeerAddress;
use crate::error::TorrentError;

/// Size of one compact peer record
pub const COMPACT_PEER_LEN: usize = 6;

/// Unpack a compact peer string. Records with port 0 are dropped.
pub fn parse_compact_peers(data: &[u8], tracker: &str) -> Result<Vec<PeerAddress>> {
    if data.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::tracker_protocol(
            format!("Compact peer list length {} is not a multiple of {}", data.len(), COMPACT_PEER_LEN),
            tracker,
        )
        .into());
    }

    let peers = data
        .chunks_exact(COMPACT_PEER_LEN)
        .filter_map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            if port == 0 {
                trace!("Skipping peer {} with port 0", ip);
                return None;
            }
            Some(PeerAddress::new(SocketAddrV4::new(ip, port)))
        })
        .collect();
    Ok(peers)
}

/// Pack peers into the compact format
pub fn encode_compact_peers<'a>(peers: impl IntoIterator<Item = &'a PeerAddress>) -> Vec<u8> {
    let mut out = Vec::new();
    for peer in peers {
        out.extend_from_slice(&peer.addr().ip().octets());
        out.extend_from_slice(&peer.addr().port().to_be_bytes());
    }
    out
}
