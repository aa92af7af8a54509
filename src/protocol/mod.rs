//! Streaming wire protocol: frame format, session preamble, and byte
//! stream synchronization.
//!
//! # Key Types
//! - [`frame::Frame`] - One header + payload unit of the wire protocol
//! - [`preamble::StreamParams`] - Parameters from the optional ASCII preamble
//! - [`sync::FrameSynchronizer`] - Extracts frames from an unaligned byte stream

pub mod frame;
pub mod preamble;
pub mod sync;

pub use frame::{Frame, FrameHeader, HEADER_SIZE, MAGIC_CURRENT, MAGIC_LEGACY, MAX_PAYLOAD_LEN};
pub use preamble::{PreambleStatus, StreamParams};
pub use sync::FrameSynchronizer;
