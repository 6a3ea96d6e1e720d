//! Peer management module
//!
//! Per-peer connection state machines and the task pool that runs them.

pub mod connection;
pub mod manager;
pub mod state;

pub use connection::{ConnectionSettings, PeerConnection};
pub use manager::{ConnectionOutcome, PeerManager};
pub use state::{ConnectionState, Peer};
