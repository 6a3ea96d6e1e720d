//! Piece scheduling module
//!
//! Decides which block each connection requests next and assembles
//! received blocks into verified pieces.

pub mod picker;
pub mod piece;

pub use picker::{BlockRequest, PieceScheduler, SchedulerStats};
pub use piece::{BlockState, ConnectionId, PieceState, PieceStatus};
