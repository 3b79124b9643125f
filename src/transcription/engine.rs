//! # Speech Engine Boundary
//!
//! The session engine treats speech-to-text as a black box: normalized samples
//! go in, text and a language tag come out. Two traits describe that box:
//!
//! - **SpeechModel**: one loaded model instance; `transcribe` is blocking and
//!   CPU/GPU bound, so callers must run it on the blocking thread pool
//! - **ModelLoader**: knows how to (re)create model instances; loading is slow
//!   and fallible, and is kept separate from per-chunk inference

use crate::error::EngineError;
use futures_util::future::BoxFuture;
use serde::Serialize;

/// Result of one successful inference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineOutput {
    pub text: String,
    /// Detected or configured language; `None` when the model cannot tell
    pub language: Option<String>,
}

impl EngineOutput {
    pub fn new(text: impl Into<String>, language: Option<String>) -> Self {
        Self {
            text: text.into(),
            language,
        }
    }

    /// Language tag for the wire, "unknown" when absent.
    pub fn language_or_unknown(&self) -> String {
        self.language.clone().unwrap_or_else(|| "unknown".to_string())
    }
}

/// A loaded model instance.
///
/// Implementations may keep internal caches, hence `&mut self`. The pool wraps
/// each instance in a mutex, so one instance never runs two inferences at once.
pub trait SpeechModel: Send {
    fn name(&self) -> &str;

    fn transcribe(&mut self, samples: &[f32]) -> Result<EngineOutput, EngineError>;
}

/// Factory for model instances, used at startup and on every reload.
pub trait ModelLoader: Send + Sync {
    /// Short description for logs, e.g. "whisper-medium on CPU".
    fn describe(&self) -> String;

    fn load(&self) -> BoxFuture<'_, Result<Box<dyn SpeechModel>, EngineError>>;
}
