//! # Adaptive Audio Buffer
//!
//! Accumulates raw PCM bytes for one session and decides when the accumulated
//! audio should be handed to the work queue.
//!
//! ## Policy (in order of precedence):
//! 1. **Stale reset**: if no audio arrived for `stale_reset` (default 10s) the
//!    buffer is marked `needs_reset`; the next write discards the old partial
//!    audio before appending.
//! 2. **Silence reset**: a write that follows a gap longer than `silence_reset`
//!    (default 5s) discards what was buffered before the gap, so unrelated
//!    speech is never spliced into one request.
//! 3. **Flush**: the buffer is ready when it holds at least `target_bytes`, or
//!    when the oldest un-flushed audio is older than `max_latency` (default 3s),
//!    or when the session is shutting down and anything is buffered.
//!
//! ## Clocks:
//! Every method takes `now: Instant` instead of reading the clock itself. The
//! session loops pass `Instant::now()`, tests pass synthetic instants.
//!
//! ## Thread Safety:
//! State lives behind a `parking_lot::Mutex`, so writers (the connection actor)
//! and readers (the buffer-check loop, the liveness watchdog) can share one
//! `Arc<AudioBuffer>`. Flushing takes the bytes under the same lock as the
//! readiness check, so a concurrent writer sees either the old buffer or an
//! empty one, never half of each.

use crate::audio::chunk::AudioChunk;
use crate::config::AudioConfig;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Thresholds that drive the buffering policy.
#[derive(Debug, Clone)]
pub struct BufferPolicy {
    pub target_bytes: usize,
    pub max_latency: Duration,
    pub silence_reset: Duration,
    pub stale_reset: Duration,
}

impl From<&AudioConfig> for BufferPolicy {
    fn from(config: &AudioConfig) -> Self {
        Self {
            target_bytes: config.target_bytes(),
            max_latency: config.max_latency(),
            silence_reset: config.silence_reset(),
            stale_reset: config.stale_reset(),
        }
    }
}

/// What happened to previously buffered audio when new audio was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Appended,
    /// Older audio was discarded before the append
    ResetThenAppended { discarded: usize },
}

#[derive(Debug)]
struct BufferState {
    data: Vec<u8>,
    last_audio_received: Option<Instant>,
    last_processing: Instant,
    /// Arrival time of the oldest byte currently in `data`
    first_pending: Option<Instant>,
    needs_reset: bool,
    next_sequence: u64,
}

impl BufferState {
    fn clear(&mut self) -> usize {
        let discarded = self.data.len();
        self.data.clear();
        self.first_pending = None;
        self.needs_reset = false;
        discarded
    }
}

/// Per-session audio accumulator.
#[derive(Debug)]
pub struct AudioBuffer {
    policy: BufferPolicy,
    state: Mutex<BufferState>,
}

impl AudioBuffer {
    pub fn new(policy: BufferPolicy, now: Instant) -> Self {
        Self {
            state: Mutex::new(BufferState {
                data: Vec::with_capacity(policy.target_bytes),
                last_audio_received: None,
                last_processing: now,
                first_pending: None,
                needs_reset: false,
                next_sequence: 0,
            }),
            policy,
        }
    }

    /// Append bytes, applying the reset rules first.
    pub fn add_audio(&self, bytes: &[u8], now: Instant) -> AddOutcome {
        let mut state = self.state.lock();

        let gap_exceeded = state
            .last_audio_received
            .map(|last| now.saturating_duration_since(last) > self.policy.silence_reset)
            .unwrap_or(false);

        let outcome = if state.needs_reset || (gap_exceeded && !state.data.is_empty()) {
            let discarded = state.clear();
            AddOutcome::ResetThenAppended { discarded }
        } else {
            AddOutcome::Appended
        };

        if state.data.is_empty() {
            state.first_pending = Some(now);
        }
        state.data.extend_from_slice(bytes);
        state.last_audio_received = Some(now);

        outcome
    }

    /// Pure read: would a flush happen right now?
    pub fn should_flush(&self, now: Instant, shutting_down: bool) -> bool {
        let state = self.state.lock();
        self.ready(&state, now, shutting_down)
    }

    fn ready(&self, state: &BufferState, now: Instant, shutting_down: bool) -> bool {
        if state.data.is_empty() || state.needs_reset {
            return false;
        }
        if shutting_down || state.data.len() >= self.policy.target_bytes {
            return true;
        }

        let oldest = state
            .first_pending
            .map_or(state.last_processing, |first| first.max(state.last_processing));
        now.saturating_duration_since(oldest) > self.policy.max_latency
    }

    /// Take every buffered byte and leave the buffer empty.
    ///
    /// Returns `None` when there is nothing to take.
    pub fn take_and_clear(&self, now: Instant) -> Option<AudioChunk> {
        let mut state = self.state.lock();
        Self::take(&mut state, now)
    }

    /// Check-and-take under one lock, so one ready observation yields one chunk.
    pub fn flush_if_ready(&self, now: Instant, shutting_down: bool) -> Option<AudioChunk> {
        let mut state = self.state.lock();
        if !self.ready(&state, now, shutting_down) {
            return None;
        }
        Self::take(&mut state, now)
    }

    fn take(state: &mut BufferState, now: Instant) -> Option<AudioChunk> {
        if state.data.is_empty() {
            return None;
        }

        let bytes = std::mem::take(&mut state.data);
        let captured_at = state.first_pending.take().unwrap_or(now);
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.last_processing = now;

        Some(AudioChunk::new(sequence, bytes, captured_at))
    }

    /// Mark the buffer for reset if audio has been silent past the stale threshold.
    ///
    /// Returns true only on the call that sets the flag.
    pub fn mark_stale(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.needs_reset || state.data.is_empty() {
            return false;
        }

        let stale = state
            .last_audio_received
            .map(|last| now.saturating_duration_since(last) > self.policy.stale_reset)
            .unwrap_or(false);
        if stale {
            state.needs_reset = true;
        }
        stale
    }

    /// Drop buffered audio immediately. Returns the number of bytes discarded.
    pub fn soft_reset(&self) -> usize {
        self.state.lock().clear()
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().data.is_empty()
    }

    pub fn needs_reset(&self) -> bool {
        self.state.lock().needs_reset
    }
}
