//! # Transcription Module
//!
//! The speech-to-text side of the service: the engine boundary traits, the
//! pool that shares engine instances between sessions, and the Whisper
//! implementation built on Candle-rs.
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, the default
//! - **large**: ~1550MB, best accuracy but slowest

pub mod engine;   // SpeechModel / ModelLoader traits
pub mod model;    // Whisper via candle
pub mod pool;     // Instance pool, reload gate, stall tracking

pub use model::{ModelSize, WhisperLoader};
pub use pool::EnginePool;
