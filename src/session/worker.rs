//! # Transcription Worker
//!
//! The single consumer of a session's work queue. Chunks are transcribed one
//! at a time, in queue order, so a session never has two inferences running
//! and its results come out in the order the audio went in.
//!
//! ## Per chunk:
//! 1. Convert PCM16LE to normalized samples
//! 2. Run the engine on the blocking pool (via `EnginePool::transcribe`)
//! 3. Suppress the result if it is empty or repeats the last sent text
//! 4. Push a `transcription` event, or an `error` event on failure
//!
//! A failed chunk never ends the session. When the queue is closed and empty
//! the worker signals completion and pushes one final `status` event.
//! Cancellation is a hard cutoff: an in-flight inference is abandoned.

use crate::session::events::{SessionMeta, TranscriptEvent};
use crate::session::queue::WorkQueue;
use crate::session::stats::SessionStats;
use crate::transcription::EnginePool;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Remembers the last text delivered so consecutive repeats are dropped.
#[derive(Debug, Default)]
pub struct Deduplicator {
    last_text_sent: Option<String>,
}

impl Deduplicator {
    /// Returns the trimmed text if it should be sent.
    pub fn admit(&mut self, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() || self.last_text_sent.as_deref() == Some(text) {
            return None;
        }
        self.last_text_sent = Some(text.to_string());
        Some(text.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Queue closed and fully processed
    Drained,
    Cancelled,
    /// Nobody is reading the output queue any more
    OutputClosed,
}

pub struct TranscriptionWorker {
    pub session_id: String,
    pub queue: Arc<WorkQueue>,
    pub engine: Arc<EnginePool>,
    pub output: UnboundedSender<TranscriptEvent>,
    pub meta: Arc<RwLock<SessionMeta>>,
    pub stats: Arc<SessionStats>,
    /// Cancelled by the worker right before it pushes its final event
    pub done: CancellationToken,
    pub cancel: CancellationToken,
}

impl TranscriptionWorker {
    pub async fn run(self) -> WorkerExit {
        let mut dedupe = Deduplicator::default();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(),
                chunk = self.queue.dequeue() => chunk,
            };
            let Some(chunk) = chunk else { break };

            let sequence = chunk.sequence();
            let bytes = chunk.len();
            let samples = chunk.into_samples();

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(),
                result = self.engine.transcribe(samples) => result,
            };

            let event = match result {
                Ok(output) => match dedupe.admit(&output.text) {
                    Some(text) => {
                        self.stats.mark_transcribed(Instant::now());
                        debug!(session_id = %self.session_id, sequence, bytes, "Transcribed chunk");
                        let meta = self.meta.read().clone();
                        Some(TranscriptEvent::transcription(&meta, text, output.language_or_unknown()))
                    }
                    None => {
                        if !output.text.trim().is_empty() {
                            self.stats.duplicate_suppressed();
                            debug!(session_id = %self.session_id, sequence, "Suppressed duplicate transcript");
                        }
                        None
                    }
                },
                Err(e) => {
                    self.stats.engine_error();
                    warn!(session_id = %self.session_id, sequence, "Chunk transcription failed: {}", e);
                    let meta = self.meta.read().clone();
                    Some(TranscriptEvent::error(&meta, e.to_string()))
                }
            };

            if let Some(event) = event {
                if self.output.send(event).is_err() {
                    debug!(session_id = %self.session_id, "Output queue closed, stopping worker");
                    self.done.cancel();
                    return WorkerExit::OutputClosed;
                }
            }
        }

        self.done.cancel();
        let meta = self.meta.read().clone();
        // A closed output queue here means the sender already gave up
        let _ = self
            .output
            .send(TranscriptEvent::final_status(&meta, "transcription complete"));
        info!(session_id = %self.session_id, "Transcription worker drained");
        WorkerExit::Drained
    }

    fn cancelled(&self) -> WorkerExit {
        warn!(session_id = %self.session_id, "Transcription worker cancelled");
        self.done.cancel();
        WorkerExit::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioChunk;
    use crate::testing::{ScriptedLoader, Step};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_dedupe_law() {
        let mut dedupe = Deduplicator::default();
        assert_eq!(dedupe.admit(" hello "), Some("hello".to_string()));
        assert_eq!(dedupe.admit("hello"), None);
        assert_eq!(dedupe.admit("   "), None);
        assert_eq!(dedupe.admit("world"), Some("world".to_string()));
        assert_eq!(dedupe.admit("hello"), Some("hello".to_string()));
    }

    async fn pool(steps: Vec<Step>) -> Arc<EnginePool> {
        let pool = EnginePool::new(Arc::new(ScriptedLoader::new(steps)), 1);
        pool.load().await.unwrap();
        Arc::new(pool)
    }

    fn worker(
        queue: Arc<WorkQueue>,
        engine: Arc<EnginePool>,
        output: UnboundedSender<TranscriptEvent>,
    ) -> (TranscriptionWorker, CancellationToken, CancellationToken) {
        let done = CancellationToken::new();
        let cancel = CancellationToken::new();
        let worker = TranscriptionWorker {
            session_id: "test".to_string(),
            queue,
            engine,
            output,
            meta: Arc::new(RwLock::new(SessionMeta::default())),
            stats: Arc::new(SessionStats::new(Instant::now())),
            done: done.clone(),
            cancel: cancel.clone(),
        };
        (worker, done, cancel)
    }

    fn chunk(sequence: u64) -> AudioChunk {
        AudioChunk::new(sequence, vec![0u8; 320], Instant::now())
    }

    #[tokio::test]
    async fn test_worker_dedupes_and_reports_errors() {
        let engine = pool(vec![
            Step::text("hello"),
            Step::text("hello"),
            Step::fail("gpu fell over"),
            Step::text("hello"),
            Step::text(""),
            Step::text("world"),
        ])
        .await;
        let queue = Arc::new(WorkQueue::new(10));
        for i in 0..6 {
            queue.enqueue(chunk(i));
        }
        queue.close();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (worker, done, _) = worker(queue, engine, tx);
        let stats = Arc::clone(&worker.stats);

        assert_eq!(worker.run().await, WorkerExit::Drained);
        assert!(done.is_cancelled());

        let mut kinds = Vec::new();
        let mut texts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
            if let TranscriptEvent::Transcription(t) = &event {
                texts.push(t.text.clone());
            }
        }
        // The failure sits between two identical texts, which are still deduped
        assert_eq!(kinds, vec!["transcription", "error", "transcription", "status"]);
        assert_eq!(texts, vec!["hello", "world"]);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.transcriptions, 2);
        assert_eq!(snapshot.duplicates_suppressed, 2);
        assert_eq!(snapshot.engine_errors, 1);
        assert!(stats.last_successful_transcription().is_some());
    }

    #[tokio::test]
    async fn test_error_events_are_not_final() {
        let engine = pool(vec![Step::fail("nope")]).await;
        let queue = Arc::new(WorkQueue::new(4));
        queue.enqueue(chunk(0));
        queue.close();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (worker, _, _) = worker(queue, engine, tx);
        worker.run().await;

        match rx.try_recv().unwrap() {
            TranscriptEvent::Error(notice) => {
                assert!(!notice.is_final);
                assert!(notice.message.contains("nope"));
            }
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(rx.try_recv().unwrap().is_final());
    }

    #[tokio::test]
    async fn test_cancel_abandons_inflight_inference() {
        let engine = pool(vec![Step::slow(500, "late")]).await;
        let queue = Arc::new(WorkQueue::new(4));
        queue.enqueue(chunk(0));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (worker, done, cancel) = worker(queue, engine, tx);
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let exit = tokio::time::timeout(Duration::from_millis(300), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Cancelled);
        assert!(done.is_cancelled());
        assert!(rx.try_recv().is_err());
    }
}
