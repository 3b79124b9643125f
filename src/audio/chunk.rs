//! # Audio Chunks and PCM Conversion
//!
//! An `AudioChunk` is the unit handed from the buffer to the work queue and
//! then to the transcription worker. It is moved, never cloned, so a chunk is
//! consumed exactly once.
//!
//! ## Wire format:
//! Binary frames carry signed 16-bit little-endian mono samples. The engine
//! wants `f32` in [-1.0, 1.0), so each sample is divided by 32768.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::time::Instant;

/// Reasons an incoming binary frame cannot be accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    Empty,
    /// 16-bit samples need an even number of bytes
    OddLength(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Empty => write!(f, "Audio frame is empty"),
            FrameError::OddLength(len) => {
                write!(f, "Audio frame length {} is not a whole number of 16-bit samples", len)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Check a binary frame before it reaches the buffer.
pub fn validate_frame(data: &[u8]) -> Result<(), FrameError> {
    if data.is_empty() {
        return Err(FrameError::Empty);
    }
    if data.len() % 2 != 0 {
        return Err(FrameError::OddLength(data.len()));
    }
    Ok(())
}

/// Convert PCM16LE bytes into normalized samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn pcm16le_to_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|pair| LittleEndian::read_i16(pair) as f32 / 32768.0)
        .collect()
}

/// An immutable span of buffered audio plus the time its first byte arrived.
#[derive(Debug, PartialEq)]
pub struct AudioChunk {
    sequence: u64,
    bytes: Vec<u8>,
    captured_at: Instant,
}

impl AudioChunk {
    pub fn new(sequence: u64, bytes: Vec<u8>, captured_at: Instant) -> Self {
        Self {
            sequence,
            bytes,
            captured_at,
        }
    }

    /// Position of this chunk in the session's flush order, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Consume the chunk and produce the engine's sample representation.
    pub fn into_samples(self) -> Vec<f32> {
        pcm16le_to_f32(&self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_conversion() {
        // 0, 16384, -32768, 32767
        let data = [0x00, 0x00, 0x00, 0x40, 0x00, 0x80, 0xff, 0x7f];
        let samples = pcm16le_to_f32(&data);

        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[1], 0.5);
        assert_eq!(samples[2], -1.0);
        assert!(samples[3] < 1.0 && samples[3] > 0.999);
    }

    #[test]
    fn test_trailing_byte_ignored() {
        let samples = pcm16le_to_f32(&[0x00, 0x40, 0x12]);
        assert_eq!(samples, vec![0.5]);
    }

    #[test]
    fn test_validate_frame() {
        assert_eq!(validate_frame(&[]), Err(FrameError::Empty));
        assert_eq!(validate_frame(&[1, 2, 3]), Err(FrameError::OddLength(3)));
        assert!(validate_frame(&[1, 2]).is_ok());
    }

    #[test]
    fn test_chunk_into_samples() {
        let chunk = AudioChunk::new(0, vec![0u8; 32000], Instant::now());
        assert_eq!(chunk.len(), 32000);
        assert_eq!(chunk.into_samples().len(), 16000);
    }
}
