//! Audio data types, buffering, concealment, and playback.
//!
//! # Data Types
//! - [`frame::PcmFrame`] - One frame of decoded s16le mono PCM
//!
//! # Pipeline
//! - [`jitter::JitterProducer`] / [`jitter::JitterConsumer`] - Bounded
//!   SPSC queue with watermark-driven pacing
//! - [`conceal::ConcealmentGenerator`] - Synthesizes audio for lost frames
//! - [`playback::PlaybackFeeder`] - Drains the buffer toward the sink on
//!   a fixed cadence
//! - [`segment::SegmentWriter`] - Rolling WAV capture of received audio

pub mod conceal;
pub mod frame;
pub mod jitter;
pub mod playback;
pub mod segment;

pub use conceal::{ConcealmentGenerator, MAX_CONCEAL_FRAMES};
pub use frame::PcmFrame;
pub use jitter::{
    BufferState, JitterConfig, JitterConsumer, JitterProducer, Pop, Push, jitter_buffer,
};
pub use playback::{CpalSink, PlaybackFeeder, PlaybackSink};
pub use segment::SegmentWriter;
