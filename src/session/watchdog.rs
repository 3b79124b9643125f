//! # Watchdogs
//!
//! Two independent monitors:
//!
//! - **Model health** (one per process): if the shared engine produced no
//!   successful transcription for `model_stall` while chunks kept arriving, the
//!   engine pool is reloaded. At most one reload per stall episode. While the
//!   pool is empty after a failed load, the reload is retried every
//!   `model_stall`, with or without traffic.
//! - **Session liveness** (one per session): after `keepalive_after` without
//!   client activity a `keepalive` event goes out, repeated at the same period
//!   while the silence lasts. Once the silence reaches `keepalive_after +
//!   soft_reset_after` the audio buffer is soft-reset and a `status` event
//!   reports it, once per idle episode.
//!
//! Decisions are pure functions of the clocks so they can be tested without
//! waiting for real timeouts; the spawned loops only supply `Instant::now()`.

use crate::audio::AudioBuffer;
use crate::config::WatchdogConfig;
use crate::session::events::{SessionMeta, TranscriptEvent};
use crate::session::stats::SessionStats;
use crate::transcription::EnginePool;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    Idle,
    Keepalive,
    SoftReset,
}

#[derive(Debug)]
pub struct LivenessTracker {
    keepalive_after: Duration,
    soft_reset_after: Duration,
    /// `last_activity` value the current idle episode belongs to
    episode: Option<Instant>,
    last_keepalive: Option<Instant>,
    reset_done: bool,
}

impl LivenessTracker {
    pub fn new(keepalive_after: Duration, soft_reset_after: Duration) -> Self {
        Self {
            keepalive_after,
            soft_reset_after,
            episode: None,
            last_keepalive: None,
            reset_done: false,
        }
    }

    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self::new(config.keepalive_after(), config.soft_reset_after())
    }

    pub fn evaluate(&mut self, last_activity: Instant, now: Instant) -> LivenessAction {
        if self.episode != Some(last_activity) {
            self.episode = Some(last_activity);
            self.last_keepalive = None;
            self.reset_done = false;
        }

        let idle = now.saturating_duration_since(last_activity);
        if idle < self.keepalive_after {
            return LivenessAction::Idle;
        }

        if !self.reset_done && idle >= self.keepalive_after + self.soft_reset_after {
            self.reset_done = true;
            return LivenessAction::SoftReset;
        }

        let keepalive_due = self
            .last_keepalive
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.keepalive_after);
        if keepalive_due {
            self.last_keepalive = Some(now);
            return LivenessAction::Keepalive;
        }

        LivenessAction::Idle
    }
}

/// Inputs for the per-session liveness loop.
pub struct LivenessWatch {
    pub session_id: String,
    pub tracker: LivenessTracker,
    pub check_interval: Duration,
    pub buffer: Arc<AudioBuffer>,
    pub stats: Arc<SessionStats>,
    pub meta: Arc<RwLock<SessionMeta>>,
    pub output: UnboundedSender<TranscriptEvent>,
    pub stop: CancellationToken,
}

impl LivenessWatch {
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let action = self
                .tracker
                .evaluate(self.stats.last_activity(), Instant::now());
            let event = match action {
                LivenessAction::Idle => continue,
                LivenessAction::Keepalive => {
                    let meta = self.meta.read().clone();
                    TranscriptEvent::keepalive(&meta)
                }
                LivenessAction::SoftReset => {
                    let discarded = self.buffer.soft_reset();
                    info!(session_id = %self.session_id, discarded, "Soft reset after inactivity");
                    let meta = self.meta.read().clone();
                    TranscriptEvent::status(&meta, "audio buffer reset after inactivity")
                }
            };

            if self.output.send(event).is_err() {
                break;
            }
        }
    }
}

/// Spawn the process-wide model health monitor.
pub fn spawn_model_watchdog(
    pool: Arc<EnginePool>,
    config: &WatchdogConfig,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let threshold = config.model_stall();
    let check_interval = config.model_check_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_attempt: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            if !pool.is_available() {
                if pool.is_reloading() || !retry_due(last_attempt, now, threshold) {
                    continue;
                }
                last_attempt = Some(now);
                warn!("Speech engine unavailable, retrying load");
                match pool.reload().await {
                    Ok(()) => info!("Speech engine recovered"),
                    Err(e) => error!("Speech engine reload failed: {}", e),
                }
                continue;
            }

            if !pool.health().check_stall(now, threshold) {
                continue;
            }
            last_attempt = Some(now);

            warn!(
                threshold_ms = threshold.as_millis() as u64,
                "No successful transcription while chunks are pending, reloading speech engine"
            );
            match pool.reload().await {
                Ok(()) => info!("Speech engine reloaded after stall"),
                Err(e) => error!("Speech engine reload failed: {}", e),
            }
        }
    })
}

fn retry_due(last_attempt: Option<Instant>, now: Instant, backoff: Duration) -> bool {
    last_attempt.map_or(true, |at| now.saturating_duration_since(at) >= backoff)
}
