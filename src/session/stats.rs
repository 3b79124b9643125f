//! Per-session counters and activity clocks.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
struct Clocks {
    last_activity: Instant,
    last_successful_transcription: Option<Instant>,
}

/// Shared by the connection, the worker, the sender and the watchdog.
#[derive(Debug)]
pub struct SessionStats {
    bytes_received: AtomicU64,
    frames_rejected: AtomicU64,
    chunks_enqueued: AtomicU64,
    chunks_dropped: AtomicU64,
    transcriptions: AtomicU64,
    duplicates_suppressed: AtomicU64,
    engine_errors: AtomicU64,
    events_sent: AtomicU64,
    clocks: Mutex<Clocks>,
}

/// Plain copy of the counters, used by the sessions and metrics endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_received: u64,
    pub frames_rejected: u64,
    pub chunks_enqueued: u64,
    pub chunks_dropped: u64,
    pub transcriptions: u64,
    pub duplicates_suppressed: u64,
    pub engine_errors: u64,
    pub events_sent: u64,
}

impl StatsSnapshot {
    pub fn accumulate(&mut self, other: &StatsSnapshot) {
        self.bytes_received += other.bytes_received;
        self.frames_rejected += other.frames_rejected;
        self.chunks_enqueued += other.chunks_enqueued;
        self.chunks_dropped += other.chunks_dropped;
        self.transcriptions += other.transcriptions;
        self.duplicates_suppressed += other.duplicates_suppressed;
        self.engine_errors += other.engine_errors;
        self.events_sent += other.events_sent;
    }
}

impl SessionStats {
    pub fn new(now: Instant) -> Self {
        Self {
            bytes_received: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            chunks_enqueued: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            transcriptions: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            engine_errors: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            clocks: Mutex::new(Clocks {
                last_activity: now,
                last_successful_transcription: None,
            }),
        }
    }

    /// Any ingress from the client: audio, control message or pong.
    pub fn touch(&self, now: Instant) {
        self.clocks.lock().last_activity = now;
    }

    pub fn last_activity(&self) -> Instant {
        self.clocks.lock().last_activity
    }

    pub fn mark_transcribed(&self, now: Instant) {
        self.clocks.lock().last_successful_transcription = Some(now);
        self.transcriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_successful_transcription(&self) -> Option<Instant> {
        self.clocks.lock().last_successful_transcription
    }

    pub fn add_bytes(&self, count: usize) {
        self.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_enqueued(&self) {
        self.chunks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn engine_error(&self) {
        self.engine_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            chunks_enqueued: self.chunks_enqueued.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            transcriptions: self.transcriptions.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            engine_errors: self.engine_errors.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
        }
    }
}
