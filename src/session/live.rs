//! # Live Session
//!
//! One `Session` per client connection. It owns the audio buffer, the work
//! queue, the output queue and four background tasks:
//!
//! - **buffer loop**: periodic flush check (max-latency and stale rules), final
//!   flush on shutdown, then closes the work queue
//! - **worker**: `TranscriptionWorker`, the single consumer of the work queue
//! - **sender**: `ResultSender`, the single consumer of the output queue
//! - **watchdog**: `LivenessWatch`, keepalives and soft resets while idle
//!
//! ## Teardown order:
//! shutdown signal → wait for buffer loop and worker (bounded by
//! `drain_timeout`, then cancelled) → tell the sender the transport is closing
//! → wait for the sender (bounded by `sender_grace`, then aborted) → stop the
//! watchdog → remove from the registry → close the transport → `Closed`.
//!
//! Teardown runs exactly once, in its own task, no matter how many causes
//! (end message, disconnect, send failure) arrive.

use crate::audio::{validate_frame, AddOutcome, AudioBuffer, AudioChunk, BufferPolicy};
use crate::config::AppConfig;
use crate::session::events::{ControlMessage, SessionMeta, TranscriptEvent};
use crate::session::lifecycle::{transition, Effect, LifecycleEvent, SessionState};
use crate::session::queue::{EnqueueOutcome, WorkQueue};
use crate::session::registry::{RegistryError, SessionRegistry};
use crate::session::sender::{EventSink, ResultSender, SenderExit};
use crate::session::stats::{SessionStats, StatsSnapshot};
use crate::session::watchdog::{LivenessTracker, LivenessWatch};
use crate::session::worker::TranscriptionWorker;
use crate::transcription::EnginePool;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct SessionTasks {
    buffer_loop: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

/// Read-only view for the sessions endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SessionState,
    #[serde(rename = "meetingId")]
    pub meeting_id: String,
    pub speaker: String,
    pub connected_at: DateTime<Utc>,
    pub queue_depth: usize,
    pub buffered_bytes: usize,
    pub stats: StatsSnapshot,
}

pub struct Session {
    id: String,
    connected_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    meta: Arc<RwLock<SessionMeta>>,
    buffer: Arc<AudioBuffer>,
    queue: Arc<WorkQueue>,
    output: UnboundedSender<TranscriptEvent>,
    stats: Arc<SessionStats>,
    sink: Arc<dyn EventSink>,
    registry: Arc<SessionRegistry>,
    drain_timeout: Duration,
    sender_grace: Duration,
    /// Advisory: start draining
    shutdown: CancellationToken,
    /// Hard cutoff for the buffer loop and worker
    cancel: CancellationToken,
    /// The transport is about to close; the sender flushes and exits
    closing: CancellationToken,
    stop_watchdog: CancellationToken,
    closed: CancellationToken,
    tasks: Mutex<SessionTasks>,
    teardown_started: AtomicBool,
}

impl Session {
    /// Create the session, spawn its tasks, then make it visible in the registry.
    pub fn open(
        id: String,
        config: &AppConfig,
        engine: Arc<EnginePool>,
        registry: Arc<SessionRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<Session>, RegistryError> {
        registry.check_admission(&id)?;

        let now = Instant::now();
        let (output, events) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            id,
            connected_at: Utc::now(),
            state: Mutex::new(SessionState::Connecting),
            meta: Arc::new(RwLock::new(SessionMeta::default())),
            buffer: Arc::new(AudioBuffer::new(BufferPolicy::from(&config.audio), now)),
            queue: Arc::new(WorkQueue::new(config.queue.capacity)),
            output,
            stats: Arc::new(SessionStats::new(now)),
            sink,
            registry: Arc::clone(&registry),
            drain_timeout: config.session.drain_timeout(),
            sender_grace: config.session.sender_grace(),
            shutdown: CancellationToken::new(),
            cancel: CancellationToken::new(),
            closing: CancellationToken::new(),
            stop_watchdog: CancellationToken::new(),
            closed: CancellationToken::new(),
            tasks: Mutex::new(SessionTasks::default()),
            teardown_started: AtomicBool::new(false),
        });

        session.spawn_tasks(events, engine, config);
        session.apply(LifecycleEvent::TasksSpawned);

        if let Err(e) = registry.insert(Arc::clone(&session)) {
            session.abort_tasks();
            return Err(e);
        }

        info!(session_id = %session.id, "Session opened");
        Ok(session)
    }

    fn spawn_tasks(
        self: &Arc<Self>,
        events: UnboundedReceiver<TranscriptEvent>,
        engine: Arc<EnginePool>,
        config: &AppConfig,
    ) {
        let worker_done = CancellationToken::new();

        let buffer_loop = tokio::spawn(run_buffer_loop(
            self.id.clone(),
            Arc::clone(&self.buffer),
            Arc::clone(&self.queue),
            Arc::clone(&self.stats),
            config.audio.check_interval(),
            self.shutdown.clone(),
            self.cancel.clone(),
        ));

        let worker = TranscriptionWorker {
            session_id: self.id.clone(),
            queue: Arc::clone(&self.queue),
            engine,
            output: self.output.clone(),
            meta: Arc::clone(&self.meta),
            stats: Arc::clone(&self.stats),
            done: worker_done.clone(),
            cancel: self.cancel.clone(),
        };
        let worker = tokio::spawn(async move {
            worker.run().await;
        });

        let sender = ResultSender {
            session_id: self.id.clone(),
            events,
            sink: Arc::clone(&self.sink),
            stats: Arc::clone(&self.stats),
            closing: self.closing.clone(),
            worker_done,
        };
        let weak: Weak<Session> = Arc::downgrade(self);
        let sender = tokio::spawn(async move {
            let exit = sender.run().await;
            debug!(?exit, "Result sender finished");
            if let SenderExit::TransportFailed(_) = exit {
                if let Some(session) = weak.upgrade() {
                    session.apply(LifecycleEvent::SendFailed);
                }
            }
        });

        let watch = LivenessWatch {
            session_id: self.id.clone(),
            tracker: LivenessTracker::from_config(&config.watchdog),
            check_interval: config.watchdog.liveness_check_interval(),
            buffer: Arc::clone(&self.buffer),
            stats: Arc::clone(&self.stats),
            meta: Arc::clone(&self.meta),
            output: self.output.clone(),
            stop: self.stop_watchdog.clone(),
        };
        let watchdog = tokio::spawn(watch.run());

        *self.tasks.lock() = SessionTasks {
            buffer_loop: Some(buffer_loop),
            worker: Some(worker),
            sender: Some(sender),
            watchdog: Some(watchdog),
        };
    }

    fn abort_tasks(&self) {
        self.cancel.cancel();
        self.stop_watchdog.cancel();
        let mut tasks = self.tasks.lock();
        for handle in [
            tasks.buffer_loop.take(),
            tasks.worker.take(),
            tasks.sender.take(),
            tasks.watchdog.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }

    /// Run a lifecycle event through the state machine and carry out its effects.
    fn apply(self: &Arc<Self>, event: LifecycleEvent) {
        let effects = {
            let mut state = self.state.lock();
            let (next, effects) = transition(*state, event);
            if next != *state {
                debug!(session_id = %self.id, from = state.as_str(), to = next.as_str(), "Session state changed");
            }
            *state = next;
            effects
        };

        for effect in effects {
            match effect {
                Effect::UpdateMetadata(meta) => {
                    info!(
                        session_id = %self.id,
                        meeting_id = %meta.meeting_id,
                        speaker = %meta.speaker,
                        "Session started"
                    );
                    *self.meta.write() = meta.clone();
                    let _ = self.output.send(TranscriptEvent::status(&meta, "session started"));
                }
                Effect::SignalShutdown(reason) => {
                    info!(session_id = %self.id, ?reason, "Session draining");
                    self.shutdown.cancel();
                    let session = Arc::clone(self);
                    tokio::spawn(async move { session.teardown().await });
                }
            }
        }
    }

    /// Binary frame from the client.
    pub fn ingest_audio(&self, bytes: &[u8]) {
        if self.state() != SessionState::Active {
            debug!(session_id = %self.id, bytes = bytes.len(), "Ignoring audio outside active state");
            return;
        }
        if let Err(e) = validate_frame(bytes) {
            self.stats.frame_rejected();
            warn!(session_id = %self.id, "Ignoring malformed audio frame: {}", e);
            return;
        }

        let now = Instant::now();
        self.stats.touch(now);
        self.stats.add_bytes(bytes.len());

        if let AddOutcome::ResetThenAppended { discarded } = self.buffer.add_audio(bytes, now) {
            if discarded > 0 {
                info!(session_id = %self.id, discarded, "Discarded audio from before a silence gap");
            }
        }

        if let Some(chunk) = self.buffer.flush_if_ready(now, false) {
            enqueue_chunk(&self.id, &self.queue, &self.stats, chunk);
        }
    }

    /// Text frame from the client. Malformed messages are logged and ignored.
    pub fn handle_text(self: &Arc<Self>, text: &str) {
        self.stats.touch(Instant::now());

        match ControlMessage::parse(text) {
            Ok(ControlMessage::Start { meeting_id, speaker }) => {
                let current = self.meta();
                let meta = SessionMeta {
                    meeting_id: meeting_id
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or(current.meeting_id),
                    speaker: speaker
                        .filter(|s| !s.trim().is_empty())
                        .unwrap_or(current.speaker),
                };
                self.apply(LifecycleEvent::Start(meta));
            }
            Ok(ControlMessage::End) => self.apply(LifecycleEvent::End),
            Ok(ControlMessage::Ping) => debug!(session_id = %self.id, "Client ping"),
            Err(e) => warn!(session_id = %self.id, "Ignoring malformed control message: {}", e),
        }
    }

    pub fn peer_disconnected(self: &Arc<Self>) {
        self.apply(LifecycleEvent::PeerDisconnected);
    }

    pub fn transport_error(self: &Arc<Self>) {
        self.apply(LifecycleEvent::TransportError);
    }

    /// Queue an event behind everything already produced for this session.
    pub fn push_event(&self, event: TranscriptEvent) -> bool {
        self.output.send(event).is_ok()
    }

    async fn teardown(self: Arc<Self>) {
        if self.teardown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let (mut buffer_loop, mut worker, sender, watchdog) = {
            let mut tasks = self.tasks.lock();
            (
                tasks.buffer_loop.take(),
                tasks.worker.take(),
                tasks.sender.take(),
                tasks.watchdog.take(),
            )
        };

        let drained = tokio::time::timeout(self.drain_timeout, async {
            if let Some(handle) = buffer_loop.as_mut() {
                let _ = handle.await;
            }
            if let Some(handle) = worker.as_mut() {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                session_id = %self.id,
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Worker did not drain in time, cancelling"
            );
            self.cancel.cancel();
            for handle in [buffer_loop, worker].into_iter().flatten() {
                handle.abort();
            }
        }

        self.closing.cancel();
        if let Some(mut handle) = sender {
            if tokio::time::timeout(self.sender_grace, &mut handle).await.is_err() {
                warn!(session_id = %self.id, "Result sender still running after grace period, aborting");
                handle.abort();
            }
        }

        self.stop_watchdog.cancel();
        if let Some(mut handle) = watchdog {
            if tokio::time::timeout(self.sender_grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        self.registry.remove(&self.id);
        self.sink.close().await;
        self.apply(LifecycleEvent::DrainComplete);
        self.closed.cancel();

        let stats = self.stats.snapshot();
        info!(
            session_id = %self.id,
            transcriptions = stats.transcriptions,
            chunks_dropped = stats.chunks_dropped,
            "Session closed"
        );
    }

    /// Resolves once teardown has fully completed.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn meta(&self) -> SessionMeta {
        self.meta.read().clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let meta = self.meta();
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state(),
            meeting_id: meta.meeting_id,
            speaker: meta.speaker,
            connected_at: self.connected_at,
            queue_depth: self.queue.len(),
            buffered_bytes: self.buffer.len(),
            stats: self.stats.snapshot(),
        }
    }
}

fn enqueue_chunk(session_id: &str, queue: &WorkQueue, stats: &SessionStats, chunk: AudioChunk) {
    let sequence = chunk.sequence();
    let bytes = chunk.len();

    match queue.enqueue(chunk) {
        EnqueueOutcome::Accepted => {
            stats.chunk_enqueued();
            debug!(session_id, sequence, bytes, "Chunk queued for transcription");
        }
        EnqueueOutcome::DroppedOldest(old) => {
            stats.chunk_enqueued();
            stats.chunk_dropped();
            warn!(
                session_id,
                dropped_sequence = old.sequence(),
                dropped_bytes = old.len(),
                "Work queue full, dropped oldest chunk"
            );
        }
        EnqueueOutcome::Closed(_) => {
            stats.chunk_dropped();
            warn!(session_id, sequence, bytes, "Work queue closed, dropping chunk");
        }
    }
}

/// Periodic flush check; performs the final flush and closes the queue on shutdown.
async fn run_buffer_loop(
    session_id: String,
    buffer: Arc<AudioBuffer>,
    queue: Arc<WorkQueue>,
    stats: Arc<SessionStats>,
    check_interval: Duration,
    shutdown: CancellationToken,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shutdown.cancelled() => {
                if let Some(chunk) = buffer.flush_if_ready(Instant::now(), true) {
                    debug!(session_id = %session_id, bytes = chunk.len(), "Final flush");
                    enqueue_chunk(&session_id, &queue, &stats, chunk);
                }
                break;
            }
            _ = tokio::time::sleep(check_interval) => {
                let now = Instant::now();
                if buffer.mark_stale(now) {
                    debug!(session_id = %session_id, "Buffer marked stale");
                }
                if let Some(chunk) = buffer.flush_if_ready(now, false) {
                    enqueue_chunk(&session_id, &queue, &stats, chunk);
                }
            }
        }
    }
    queue.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, ScriptedLoader, Step};
    use serde_json::json;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        // 100ms of 16kHz PCM16 = 3200 bytes per flush
        config.audio.buffer_duration_ms = 100;
        config.audio.check_interval_ms = 10;
        config.session.drain_timeout_ms = 2000;
        config.session.sender_grace_ms = 500;
        config
    }

    async fn engine(steps: Vec<Step>) -> Arc<EnginePool> {
        let pool = EnginePool::new(Arc::new(ScriptedLoader::new(steps)), 1);
        pool.load().await.unwrap();
        Arc::new(pool)
    }

    async fn closed_within(session: &Session, ms: u64) {
        tokio::time::timeout(Duration::from_millis(ms), session.wait_closed())
            .await
            .expect("session did not close in time");
    }

    #[tokio::test]
    async fn test_end_flushes_every_result_before_close() {
        let config = test_config();
        let registry = Arc::new(SessionRegistry::new(4));
        let sink = Arc::new(RecordingSink::default());
        let session = Session::open(
            "s1".to_string(),
            &config,
            engine(vec![Step::slow(30, "one"), Step::slow(30, "two"), Step::slow(30, "three")]).await,
            Arc::clone(&registry),
            sink.clone(),
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(registry.len(), 1);

        session.handle_text(&json!({"type": "start", "meetingId": "m-9", "speaker": "jo"}).to_string());
        for _ in 0..3 {
            session.ingest_audio(&[0u8; 3200]);
        }
        session.handle_text(r#"{"type":"end"}"#);
        assert_eq!(session.state(), SessionState::Draining);

        closed_within(&session, 2000).await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(sink.transcripts(), vec!["one", "two", "three"]);

        let events = sink.events();
        assert_eq!(events.first().map(|e| e.kind()), Some("status"));
        assert!(events.last().unwrap().is_final());
        match &events[1] {
            TranscriptEvent::Transcription(t) => {
                assert_eq!(t.meeting_id, "m-9");
                assert_eq!(t.speaker, "jo");
            }
            other => panic!("expected transcription, got {:?}", other),
        }

        assert!(registry.is_empty());
        assert_eq!(sink.close_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_flushes_partial_buffer() {
        let config = test_config();
        let registry = Arc::new(SessionRegistry::new(4));
        let sink = Arc::new(RecordingSink::default());
        let session = Session::open(
            "s2".to_string(),
            &config,
            engine(vec![Step::text("tail end")]).await,
            Arc::clone(&registry),
            sink.clone(),
        )
        .unwrap();

        // Below the size threshold, so only the shutdown flush can send it
        session.ingest_audio(&[0u8; 640]);
        session.peer_disconnected();
        closed_within(&session, 2000).await;

        assert_eq!(sink.transcripts(), vec!["tail end"]);
        assert_eq!(session.stats().chunks_enqueued, 1);
    }

    #[tokio::test]
    async fn test_send_failure_tears_session_down() {
        let config = test_config();
        let registry = Arc::new(SessionRegistry::new(4));
        let sink = Arc::new(RecordingSink::default());
        sink.set_failing(true);
        let session = Session::open(
            "s3".to_string(),
            &config,
            engine(vec![Step::text("nobody hears this")]).await,
            Arc::clone(&registry),
            sink.clone(),
        )
        .unwrap();

        session.ingest_audio(&[0u8; 3200]);
        closed_within(&session, 2000).await;

        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty());
        assert_eq!(sink.close_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_timeout_cancels_worker() {
        let mut config = test_config();
        config.session.drain_timeout_ms = 50;
        let registry = Arc::new(SessionRegistry::new(4));
        let sink = Arc::new(RecordingSink::default());
        let session = Session::open(
            "s4".to_string(),
            &config,
            engine(vec![Step::slow(600, "too slow")]).await,
            Arc::clone(&registry),
            sink.clone(),
        )
        .unwrap();

        session.ingest_audio(&[0u8; 3200]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.handle_text(r#"{"type":"end"}"#);

        closed_within(&session, 400).await;
        assert!(sink.transcripts().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_input_is_ignored() {
        let config = test_config();
        let registry = Arc::new(SessionRegistry::new(4));
        let sink = Arc::new(RecordingSink::default());
        let session = Session::open(
            "s5".to_string(),
            &config,
            engine(vec![Step::text("x")]).await,
            Arc::clone(&registry),
            sink.clone(),
        )
        .unwrap();

        session.handle_text("{not json");
        session.handle_text(r#"{"type":"rewind"}"#);
        session.ingest_audio(&[1, 2, 3]);
        session.ingest_audio(&[]);

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.stats().frames_rejected, 2);
        assert_eq!(session.meta(), SessionMeta::default());

        session.handle_text(r#"{"type":"end"}"#);
        closed_within(&session, 2000).await;
    }

    #[tokio::test]
    async fn test_registry_limit_rejects_new_sessions() {
        let config = test_config();
        let registry = Arc::new(SessionRegistry::new(1));
        let pool = engine(vec![Step::text("x")]).await;

        let first = Session::open(
            "a".to_string(),
            &config,
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::new(RecordingSink::default()),
        )
        .unwrap();

        let second = Session::open(
            "b".to_string(),
            &config,
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::new(RecordingSink::default()),
        );
        assert!(matches!(second, Err(RegistryError::Full { limit: 1 })));

        first.peer_disconnected();
        closed_within(&first, 2000).await;
        assert!(registry.is_empty());
    }
}
