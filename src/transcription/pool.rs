//! # Engine Pool
//!
//! Owns every loaded `SpeechModel` instance and is the only way sessions reach
//! the speech engine.
//!
//! ## Sharing model:
//! - `instances = 1`: a single mutex-guarded engine shared by every session
//! - `instances = N`: N independent engines; a checkout picks the least busy
//!   one, breaking ties round-robin
//!
//! ## Reload gate:
//! The slot list sits behind a `tokio::sync::RwLock`. Checkouts take the read
//! side just long enough to clone a slot `Arc`; `reload()` holds the write side
//! for the whole unload + load, so submissions that arrive during a reload
//! wait instead of failing.
//!
//! ## Health:
//! `EngineHealth` records submissions and successes so the model watchdog can
//! tell a stalled engine from an idle one.

use crate::error::EngineError;
use crate::transcription::engine::{EngineOutput, ModelLoader, SpeechModel};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

struct EngineSlot {
    id: usize,
    model: Mutex<Box<dyn SpeechModel>>,
    in_flight: AtomicUsize,
}

#[derive(Debug, Default)]
struct HealthState {
    last_submission: Option<Instant>,
    /// Start of the current run of submissions without a success
    pending_since: Option<Instant>,
    in_flight: usize,
    stall_flagged: bool,
}

/// Shared progress tracker for every session using the pool.
#[derive(Debug, Default)]
pub struct EngineHealth {
    state: Mutex<HealthState>,
}

impl EngineHealth {
    pub fn record_submission(&self, now: Instant) {
        let mut state = self.state.lock();
        state.in_flight += 1;
        state.last_submission = Some(now);
        if state.pending_since.is_none() {
            state.pending_since = Some(now);
        }
    }

    /// A success ends the current stall episode.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.pending_since = None;
        state.stall_flagged = false;
    }

    /// Called once per submission when it finishes, whatever the outcome.
    fn record_finished(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Returns true exactly once per stall episode.
    ///
    /// A stall is a run of submissions with no success for longer than
    /// `threshold` while work is still in flight or was submitted within the
    /// last `threshold`.
    pub fn check_stall(&self, now: Instant, threshold: Duration) -> bool {
        let mut state = self.state.lock();
        if state.stall_flagged {
            return false;
        }

        let Some(pending_since) = state.pending_since else {
            return false;
        };
        let still_submitting = state.in_flight > 0
            || state
                .last_submission
                .map(|last| now.saturating_duration_since(last) <= threshold)
                .unwrap_or(false);

        if still_submitting && now.saturating_duration_since(pending_since) > threshold {
            state.stall_flagged = true;
            return true;
        }
        false
    }

    /// Close the current episode after a reload.
    ///
    /// Work still in flight on the old instances does not count; only a
    /// submission made after the reload can open a new episode.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.stall_flagged = false;
        state.pending_since = None;
        state.last_submission = None;
    }
}

/// Decrements the in-flight counters even when the awaiting task is aborted.
struct InFlight<'a> {
    health: &'a EngineHealth,
    slot: Option<Arc<EngineSlot>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(slot) = &self.slot {
            slot.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.health.record_finished();
    }
}

/// Counters reported by the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub engine: String,
    pub configured_instances: usize,
    pub loaded_instances: usize,
    pub reloading: bool,
    pub inferences: u64,
    pub failures: u64,
    pub reloads: u64,
    pub failed_reloads: u64,
}

pub struct EnginePool {
    loader: Arc<dyn ModelLoader>,
    instances: usize,
    slots: RwLock<Vec<Arc<EngineSlot>>>,
    loaded: AtomicUsize,
    next: AtomicUsize,
    reloading: AtomicBool,
    health: EngineHealth,
    inferences: AtomicU64,
    failures: AtomicU64,
    reloads: AtomicU64,
    failed_reloads: AtomicU64,
}

impl EnginePool {
    /// Create an empty pool. Nothing is loaded until `load()` or `reload()`.
    pub fn new(loader: Arc<dyn ModelLoader>, instances: usize) -> Self {
        Self {
            loader,
            instances: instances.max(1),
            slots: RwLock::new(Vec::new()),
            loaded: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            reloading: AtomicBool::new(false),
            health: EngineHealth::default(),
            inferences: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            failed_reloads: AtomicU64::new(0),
        }
    }

    /// Initial load at startup. A failure here is fatal to the caller.
    pub async fn load(&self) -> Result<(), EngineError> {
        self.replace_slots().await
    }

    /// Unload every instance and load fresh ones.
    ///
    /// On failure the pool stays empty and reports unavailable until a later
    /// reload succeeds.
    pub async fn reload(&self) -> Result<(), EngineError> {
        self.reloads.fetch_add(1, Ordering::Relaxed);
        let result = self.replace_slots().await;
        if result.is_err() {
            self.failed_reloads.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn replace_slots(&self) -> Result<(), EngineError> {
        let mut slots = self.slots.write().await;
        self.reloading.store(true, Ordering::SeqCst);

        let unloaded = slots.len();
        slots.clear();
        self.loaded.store(0, Ordering::SeqCst);
        if unloaded > 0 {
            info!(instances = unloaded, "Unloaded speech engine instances");
        }

        let started = Instant::now();
        let mut fresh = Vec::with_capacity(self.instances);
        for id in 0..self.instances {
            match self.loader.load().await {
                Ok(model) => {
                    debug!(instance = id, model = model.name(), "Speech engine instance loaded");
                    fresh.push(Arc::new(EngineSlot {
                        id,
                        model: Mutex::new(model),
                        in_flight: AtomicUsize::new(0),
                    }))
                }
                Err(e) => {
                    error!(instance = id, "Speech engine load failed: {}", e);
                    self.reloading.store(false, Ordering::SeqCst);
                    self.health.reset();
                    return Err(e);
                }
            }
        }

        *slots = fresh;
        self.loaded.store(slots.len(), Ordering::SeqCst);
        self.reloading.store(false, Ordering::SeqCst);
        self.health.reset();

        info!(
            engine = %self.loader.describe(),
            instances = slots.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Speech engine ready"
        );
        Ok(())
    }

    /// Pick an instance: least in-flight work first, round-robin among equals.
    async fn checkout(&self) -> Result<Arc<EngineSlot>, EngineError> {
        let slots = self.slots.read().await;
        if slots.is_empty() {
            return Err(EngineError::Unavailable);
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed) % slots.len();
        let mut best = &slots[start];
        for offset in 1..slots.len() {
            let candidate = &slots[(start + offset) % slots.len()];
            if candidate.in_flight.load(Ordering::SeqCst) < best.in_flight.load(Ordering::SeqCst) {
                best = candidate;
            }
        }

        best.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(best))
    }

    /// Run one inference on the blocking thread pool.
    ///
    /// Dropping the returned future abandons the result; the blocking call
    /// itself runs to completion and still holds its instance until then.
    pub async fn transcribe(&self, samples: Vec<f32>) -> Result<EngineOutput, EngineError> {
        self.health.record_submission(Instant::now());
        let mut guard = InFlight {
            health: &self.health,
            slot: None,
        };

        let slot = self.checkout().await?;
        guard.slot = Some(Arc::clone(&slot));
        let slot_id = slot.id;

        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let mut model = slot.model.lock();
            model.transcribe(&samples)
        })
        .await
        .unwrap_or_else(|join_error| {
            if join_error.is_panic() {
                Err(EngineError::Inference("speech engine panicked".to_string()))
            } else {
                Err(EngineError::Cancelled)
            }
        });

        self.inferences.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(output) => {
                self.health.record_success();
                debug!(
                    instance = slot_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    chars = output.text.len(),
                    "Inference finished"
                );
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(instance = slot_id, "Inference failed: {}", e);
            }
        }
        result
    }

    pub fn is_available(&self) -> bool {
        self.loaded.load(Ordering::SeqCst) > 0
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> &EngineHealth {
        &self.health
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            engine: self.loader.describe(),
            configured_instances: self.instances,
            loaded_instances: self.loaded.load(Ordering::SeqCst),
            reloading: self.reloading.load(Ordering::SeqCst),
            inferences: self.inferences.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            failed_reloads: self.failed_reloads.load(Ordering::Relaxed),
        }
    }
}
