//! Test doubles shared by the unit tests of several modules.

use crate::error::{EngineError, TransportError};
use crate::session::events::TranscriptEvent;
use crate::session::sender::EventSink;
use crate::transcription::engine::{EngineOutput, ModelLoader, SpeechModel};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted inference outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Text(String),
    Fail(String),
    /// Block the calling thread, then return the text
    Slow(Duration, String),
}

impl Step {
    pub fn text(text: &str) -> Self {
        Step::Text(text.to_string())
    }

    pub fn fail(message: &str) -> Self {
        Step::Fail(message.to_string())
    }

    pub fn slow(ms: u64, text: &str) -> Self {
        Step::Slow(Duration::from_millis(ms), text.to_string())
    }
}

/// Script shared by every instance a loader creates. The last step repeats.
#[derive(Debug, Default)]
struct Script {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl Script {
    fn next(&self) -> Option<Step> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut steps = self.steps.lock();
        if steps.len() > 1 {
            steps.pop_front()
        } else {
            steps.front().cloned()
        }
    }
}

pub struct ScriptedModel {
    script: Arc<Script>,
}

impl SpeechModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn transcribe(&mut self, _samples: &[f32]) -> Result<EngineOutput, EngineError> {
        match self.script.next() {
            None => Ok(EngineOutput::new("", None)),
            Some(Step::Text(text)) => Ok(EngineOutput::new(text, Some("en".to_string()))),
            Some(Step::Fail(message)) => Err(EngineError::Inference(message)),
            Some(Step::Slow(delay, text)) => {
                std::thread::sleep(delay);
                Ok(EngineOutput::new(text, Some("en".to_string())))
            }
        }
    }
}

pub struct ScriptedLoader {
    script: Arc<Script>,
    loads: AtomicUsize,
    failing_loads: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Arc::new(Script {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            }),
            loads: AtomicUsize::new(0),
            failing_loads: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` calls to `load` fail.
    pub fn fail_next_loads(&self, count: usize) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Number of `load` calls, including failed ones.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of inferences across all instances.
    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }
}

impl ModelLoader for ScriptedLoader {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    fn load(&self) -> BoxFuture<'_, Result<Box<dyn SpeechModel>, EngineError>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let should_fail = self
                .failing_loads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(EngineError::Load("scripted load failure".to_string()));
            }
            Ok(Box::new(ScriptedModel {
                script: Arc::clone(&self.script),
            }) as Box<dyn SpeechModel>)
        })
    }
}

/// Captures delivered events; can be switched to fail every send.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TranscriptEvent>>,
    failing: AtomicBool,
    closed: AtomicUsize,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TranscriptEvent> {
        self.events.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn transcripts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TranscriptEvent::Transcription(t) => Some(t.text),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn send(&self, event: TranscriptEvent) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.events.lock().push(event);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.fetch_add(1, Ordering::SeqCst);
        })
    }
}
