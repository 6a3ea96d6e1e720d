//! Error types for the download engine
//!
//! Every failure the engine can raise is one of these variants. Decode,
//! invalid-torrent and config errors stop the whole run; tracker errors stay
//! inside the tracker task that raised them and peer errors inside the
//! connection task.

use std::fmt;

/// Error taxonomy for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Malformed bencode
    DecodeError {
        message: String,
        position: Option<usize>,
    },

    /// Well-formed bencode with the wrong shape for a torrent
    InvalidTorrent {
        message: String,
        field: Option<String>,
    },

    /// Tracker did not answer within the deadline
    TrackerTimeout {
        message: String,
        tracker: String,
    },

    /// Tracker answered with something we cannot use
    TrackerProtocol {
        message: String,
        tracker: String,
        status: Option<u16>,
    },

    /// Peer handshake failed
    Handshake {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Peer sent a malformed or out-of-range message
    PeerProtocol {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Assembled piece does not match its SHA-1
    PieceHashMismatch {
        piece_index: u32,
    },

    /// File I/O errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Socket level errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new DecodeError
    pub fn decode_error(message: impl Into<String>) -> Self {
        TorrentError::DecodeError {
            message: message.into(),
            position: None,
        }
    }

    /// Create a new DecodeError at a byte position
    pub fn decode_error_at(message: impl Into<String>, position: usize) -> Self {
        TorrentError::DecodeError {
            message: message.into(),
            position: Some(position),
        }
    }

    /// Create a new InvalidTorrent error
    pub fn invalid_torrent(message: impl Into<String>) -> Self {
        TorrentError::InvalidTorrent {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new InvalidTorrent error naming the offending field
    pub fn invalid_torrent_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::InvalidTorrent {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new TrackerTimeout
    pub fn tracker_timeout(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        TorrentError::TrackerTimeout {
            message: message.into(),
            tracker: tracker.into(),
        }
    }

    /// Create a new TrackerProtocol error
    pub fn tracker_protocol(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        TorrentError::TrackerProtocol {
            message: message.into(),
            tracker: tracker.into(),
            status: None,
        }
    }

    /// Create a new TrackerProtocol error carrying an HTTP status
    pub fn tracker_protocol_with_status(
        message: impl Into<String>,
        tracker: impl Into<String>,
        status: u16,
    ) -> Self {
        TorrentError::TrackerProtocol {
            message: message.into(),
            tracker: tracker.into(),
            status: Some(status),
        }
    }

    /// Create a new Handshake error
    pub fn handshake_error(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::Handshake {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new Handshake error without a peer address
    pub fn handshake_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::Handshake {
            message: message.into(),
            peer: None,
            source: Some(source.into()),
        }
    }

    pub fn handshake_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::Handshake {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerProtocol error
    pub fn peer_protocol(message: impl Into<String>) -> Self {
        TorrentError::PeerProtocol {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerProtocol error with source
    pub fn peer_protocol_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerProtocol {
            message: message.into(),
            peer: None,
            source: Some(source.into()),
        }
    }

    pub fn peer_protocol_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerProtocol {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    pub fn piece_hash_mismatch(piece_index: u32) -> Self {
        TorrentError::PieceHashMismatch { piece_index }
    }

    /// Disk failure without a specific file
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Socket failure talking to `address`
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Rejected setting, naming the offending option
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Errors that make the whole run untrustworthy
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorrentError::DecodeError { .. }
                | TorrentError::InvalidTorrent { .. }
                | TorrentError::ConfigError { .. }
        )
    }

    /// Errors contained at a single tracker task
    pub fn is_tracker_scoped(&self) -> bool {
        matches!(self, TorrentError::TrackerTimeout { .. } | TorrentError::TrackerProtocol { .. })
    }

    /// Errors contained at a single peer connection task
    pub fn is_peer_scoped(&self) -> bool {
        matches!(
            self,
            TorrentError::Handshake { .. }
                | TorrentError::PeerProtocol { .. }
                | TorrentError::NetworkError { .. }
                | TorrentError::PieceHashMismatch { .. }
        )
    }

    /// HTTP status carried by a tracker error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            TorrentError::TrackerProtocol { status, .. } => *status,
            _ => None,
        }
    }

    /// Attach where the failure happened, e.g. a file name
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::Handshake { source, .. }
            | TorrentError::PeerProtocol { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            TorrentError::DecodeError { message, .. }
            | TorrentError::InvalidTorrent { message, .. }
            | TorrentError::TrackerTimeout { message, .. }
            | TorrentError::TrackerProtocol { message, .. }
            | TorrentError::ConfigError { message, .. } => {
                *message = format!("{} ({})", message, ctx);
            }
            TorrentError::PieceHashMismatch { .. } => {}
        }
        self
    }
}

/// Write `message` followed by whichever labelled details are present
fn write_details(f: &mut fmt::Formatter<'_>, message: &str, details: &[(&str, Option<&str>)]) -> fmt::Result {
    f.write_str(message)?;
    let mut present = details.iter().filter_map(|(label, value)| value.map(|v| (label, v)));
    if let Some((label, value)) = present.next() {
        write!(f, " ({}: {}", label, value)?;
        for (label, value) in present {
            write!(f, ", {}: {}", label, value)?;
        }
        f.write_str(")")?;
    }
    Ok(())
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::DecodeError { message, position } => {
                write!(f, "Decode error: {}", message)?;
                match position {
                    Some(pos) => write!(f, " (at byte {})", pos),
                    None => Ok(()),
                }
            }
            TorrentError::InvalidTorrent { message, field } => {
                f.write_str("Invalid torrent: ")?;
                write_details(f, message, &[("field", field.as_deref())])
            }
            TorrentError::TrackerTimeout { message, tracker } => {
                f.write_str("Tracker timeout: ")?;
                write_details(f, message, &[("tracker", Some(tracker.as_str()))])
            }
            TorrentError::TrackerProtocol { message, tracker, status } => {
                let status = status.map(|code| code.to_string());
                f.write_str("Tracker protocol error: ")?;
                write_details(f, message, &[("tracker", Some(tracker.as_str())), ("status", status.as_deref())])
            }
            TorrentError::Handshake { message, peer, source } => {
                f.write_str("Handshake error: ")?;
                write_details(f, message, &[("peer", peer.as_deref()), ("source", source.as_deref())])
            }
            TorrentError::PeerProtocol { message, peer, source } => {
                f.write_str("Peer protocol error: ")?;
                write_details(f, message, &[("peer", peer.as_deref()), ("source", source.as_deref())])
            }
            TorrentError::PieceHashMismatch { piece_index } => {
                write!(f, "Piece {} failed hash verification", piece_index)
            }
            TorrentError::StorageError { message, path, source } => {
                f.write_str("Storage error: ")?;
                write_details(f, message, &[("path", path.as_deref()), ("source", source.as_deref())])
            }
            TorrentError::NetworkError { message, address, source } => {
                f.write_str("Network error: ")?;
                write_details(f, message, &[("address", address.as_deref()), ("source", source.as_deref())])
            }
            TorrentError::ConfigError { message, field } => {
                f.write_str("Config error: ")?;
                write_details(f, message, &[("field", field.as_deref())])
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::StorageError {
            message: err.to_string(),
            path: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::NetworkError {
            message: "Invalid socket address".to_string(),
            address: None,
            source: Some(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Deadline elapsed")
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::config_error_with_field(format!("Invalid URL: {}", err), "url")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_at() {
        let err = TorrentError::decode_error_at("Unterminated integer", 7);
        assert_eq!(err.to_string(), "Decode error: Unterminated integer (at byte 7)");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_torrent_field() {
        let err = TorrentError::invalid_torrent_field("Missing field", "piece length");
        assert!(err.to_string().contains("Invalid torrent"));
        assert!(err.to_string().contains("piece length"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_tracker_protocol_with_status() {
        let err = TorrentError::tracker_protocol_with_status("Bad response", "http://t/announce", 404);
        assert_eq!(err.status(), Some(404));
        assert!(err.to_string().contains("status: 404"));
        assert!(err.is_tracker_scoped());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_tracker_timeout_is_tracker_scoped() {
        let err = TorrentError::tracker_timeout("No reply", "udp://t:80");
        assert!(err.is_tracker_scoped());
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_peer_scoped_errors() {
        assert!(TorrentError::handshake_error("Info hash mismatch", "127.0.0.1:6881").is_peer_scoped());
        assert!(TorrentError::peer_protocol("Bad length").is_peer_scoped());
        assert!(TorrentError::piece_hash_mismatch(3).is_peer_scoped());
        assert!(!TorrentError::storage_error("Disk full").is_peer_scoped());
    }

    #[test]
    fn test_piece_hash_mismatch_display() {
        let err = TorrentError::piece_hash_mismatch(12);
        assert_eq!(err.to_string(), "Piece 12 failed hash verification");
    }

    #[test]
    fn test_with_context() {
        let err = TorrentError::peer_protocol("Invalid data").with_context("while reading bitfield");
        assert!(err.to_string().contains("while reading bitfield"));

        let err = TorrentError::invalid_torrent("Bad shape").with_context("info dictionary");
        assert!(err.to_string().contains("info dictionary"));
    }

    #[test]
    fn test_details_are_listed_in_order() {
        let err = TorrentError::network_error_full("Connection reset", "10.0.0.2:6881", "os error 104");
        assert_eq!(
            err.to_string(),
            "Network error: Connection reset (address: 10.0.0.2:6881, source: os error 104)"
        );
        let err = TorrentError::handshake_error("Handshake reply timed out", "10.0.0.3:51413");
        assert_eq!(err.to_string(), "Handshake error: Handshake reply timed out (peer: 10.0.0.3:51413)");
        assert_eq!(TorrentError::storage_error("Disk full").to_string(), "Storage error: Disk full");
    }

    #[test]
    fn test_io_and_address_conversions() {
        let err: TorrentError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, TorrentError::StorageError { .. }));

        let err: TorrentError = "not-an-address".parse::<std::net::SocketAddr>().unwrap_err().into();
        assert!(matches!(err, TorrentError::NetworkError { .. }));
        assert!(err.is_peer_scoped());
    }

    #[test]
    fn test_config_error_names_option() {
        let err = TorrentError::config_error_with_field("Must be at least 1", "max_connections");
        assert_eq!(err.to_string(), "Config error: Must be at least 1 (field: max_connections)");
        assert!(err.is_fatal());
    }
}
