//! Storage module
//!
//! Maps pieces onto destination files and persists verified data.

pub mod file;
pub mod layout;
pub mod writer;

pub use file::prepare_files;
pub use layout::{FileLayout, LayoutFile, WriteSegment};
pub use writer::{DiskWriter, PieceMessage, WriterEvent, WriterReport};
