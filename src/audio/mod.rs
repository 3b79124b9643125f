//! # Audio Module
//!
//! Everything that touches raw audio before it reaches the speech engine.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz), configurable
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;   // Adaptive accumulate-and-flush buffer
pub mod chunk;    // Flushed chunks and PCM conversion

pub use buffer::{AddOutcome, AudioBuffer, BufferPolicy};
pub use chunk::{validate_frame, AudioChunk};
