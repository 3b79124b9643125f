//! # Configuration Management
//!
//! This module loads the tunable knobs of the live transcription service from
//! multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__PORT, APP_AUDIO__MAX_LATENCY_MS, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Why milliseconds everywhere:
//! Every threshold is stored as a plain `u64` of milliseconds so that the same
//! value can come from TOML, an environment variable or JSON without custom
//! deserializers. The `*_duration()` helpers turn them into `Duration`s for the
//! components that consume them.

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables
use std::time::Duration;

/// Whisper encodes one 30 second window per pass.
const MAX_BUFFER_DURATION_MS: u64 = 30_000;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each group maps to one part of the session engine (buffering, queueing,
/// watchdogs, teardown), so a reader can find every knob a component uses in
/// one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub performance: PerformanceConfig,
    pub audio: AudioConfig,
    pub queue: QueueConfig,
    pub watchdog: WatchdogConfig,
    pub session: SessionConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech model configuration settings.
///
/// ## Fields:
/// - `whisper_model`: Which Whisper checkpoint to load ("tiny", "base", "small", "medium", "large")
/// - `language`: Language hint passed to the decoder; empty string means auto-detect
/// - `device`: Compute device preference ("auto", "cpu", "cuda", "metal")
/// - `instances`: Number of independent model instances; 1 means a single shared,
///   mutex-guarded engine for every session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub whisper_model: String,
    pub language: String,
    pub device: String,
    pub instances: usize,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Upper bound on simultaneously registered sessions
    pub max_concurrent_sessions: usize,
}

/// Audio format and buffering policy.
///
/// ## Buffering thresholds:
/// - `buffer_duration_ms`: how much audio to accumulate before a size-based flush
/// - `max_latency_ms`: oldest buffered audio is flushed after this long, even if small
/// - `silence_reset_ms`: a gap this long before new audio discards the old partial buffer
/// - `stale_reset_ms`: a buffer idle this long is marked for reset on the next write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub bytes_per_sample: u32,
    pub buffer_duration_ms: u64,
    pub max_latency_ms: u64,
    pub silence_reset_ms: u64,
    pub stale_reset_ms: u64,
    /// How often the buffer-check loop wakes up on its own
    pub check_interval_ms: u64,
}

/// Work queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Chunks waiting for transcription; the oldest is evicted when full
    pub capacity: usize,
}

/// Watchdog thresholds for the model-health and session-liveness monitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub model_stall_ms: u64,
    pub model_check_interval_ms: u64,
    pub keepalive_after_ms: u64,
    /// Measured from the moment the keepalive threshold was crossed
    pub soft_reset_after_ms: u64,
    pub liveness_check_interval_ms: u64,
}

/// Per-connection lifecycle timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bounded wait for the transcription worker to drain during teardown
    pub drain_timeout_ms: u64,
    /// Bounded wait for the result sender to flush before it is cancelled
    pub sender_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub client_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8000,
            },
            models: ModelsConfig {
                whisper_model: "medium".to_string(),
                language: "en".to_string(),
                device: "auto".to_string(),
                instances: 1,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
            audio: AudioConfig {
                sample_rate: 16000,      // Whisper's native rate
                bytes_per_sample: 2,     // PCM16LE
                buffer_duration_ms: 2000,
                max_latency_ms: 3000,
                silence_reset_ms: 5000,
                stale_reset_ms: 10000,
                check_interval_ms: 50,
            },
            queue: QueueConfig { capacity: 20 },
            watchdog: WatchdogConfig {
                model_stall_ms: 10000,
                model_check_interval_ms: 1000,
                keepalive_after_ms: 30000,
                soft_reset_after_ms: 15000,
                liveness_check_interval_ms: 1000,
            },
            session: SessionConfig {
                drain_timeout_ms: 5000,
                sender_grace_ms: 5000,
                heartbeat_interval_ms: 15000,
                client_timeout_ms: 60000,
            },
        }
    }
}

impl AudioConfig {
    /// Byte threshold for a size-based flush: duration × sample rate × bytes per sample.
    ///
    /// ## Example:
    /// 2000ms at 16kHz, 16-bit: 2 * 16000 * 2 = 64,000 bytes
    pub fn target_bytes(&self) -> usize {
        (self.buffer_duration_ms as usize * self.sample_rate as usize * self.bytes_per_sample as usize)
            / 1000
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }

    pub fn silence_reset(&self) -> Duration {
        Duration::from_millis(self.silence_reset_ms)
    }

    pub fn stale_reset(&self) -> Duration {
        Duration::from_millis(self.stale_reset_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl WatchdogConfig {
    pub fn model_stall(&self) -> Duration {
        Duration::from_millis(self.model_stall_ms)
    }

    pub fn model_check_interval(&self) -> Duration {
        Duration::from_millis(self.model_check_interval_ms)
    }

    pub fn keepalive_after(&self) -> Duration {
        Duration::from_millis(self.keepalive_after_ms)
    }

    pub fn soft_reset_after(&self) -> Duration {
        Duration::from_millis(self.soft_reset_after_ms)
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }
}

impl SessionConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn sender_grace(&self) -> Duration {
        Duration::from_millis(self.sender_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_MODELS__WHISPER_MODEL=small`: Override whisper model
    /// - `APP_QUEUE__CAPACITY=40`: Override work queue capacity
    ///
    /// Nested keys use a double underscore so that field names which contain a
    /// single underscore (`max_latency_ms`) survive the mapping.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms set these without our prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Sizes and counts that are used as divisors or capacities are non-zero
    /// - The short silence threshold is below the stale threshold, otherwise the
    ///   two reset rules would collapse into one
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.models.instances == 0 {
            return Err(anyhow::anyhow!("At least one model instance is required"));
        }

        if self.audio.sample_rate == 0 || self.audio.bytes_per_sample == 0 {
            return Err(anyhow::anyhow!("Sample rate and bytes per sample must be greater than 0"));
        }

        if self.audio.target_bytes() == 0 {
            return Err(anyhow::anyhow!("Buffer duration is too short to hold a single sample"));
        }

        if self.audio.buffer_duration_ms > MAX_BUFFER_DURATION_MS {
            return Err(anyhow::anyhow!(
                "buffer_duration_ms ({}) must not exceed the {} ms model window",
                self.audio.buffer_duration_ms,
                MAX_BUFFER_DURATION_MS
            ));
        }

        if self.audio.silence_reset_ms >= self.audio.stale_reset_ms {
            return Err(anyhow::anyhow!(
                "silence_reset_ms ({}) must be lower than stale_reset_ms ({})",
                self.audio.silence_reset_ms,
                self.audio.stale_reset_ms
            ));
        }

        if self.queue.capacity == 0 {
            return Err(anyhow::anyhow!("Work queue capacity must be greater than 0"));
        }

        if self.audio.check_interval_ms == 0
            || self.watchdog.model_check_interval_ms == 0
            || self.watchdog.liveness_check_interval_ms == 0
            || self.session.heartbeat_interval_ms == 0
        {
            return Err(anyhow::anyhow!("Polling intervals must be greater than 0"));
        }

        Ok(())
    }

    /// The configured language hint, or `None` when the model should detect it.
    pub fn language_hint(&self) -> Option<String> {
        let language = self.models.language.trim();
        if language.is_empty() || language.eq_ignore_ascii_case("auto") {
            None
        } else {
            Some(language.to_lowercase())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.queue.capacity, 20);
        assert_eq!(config.audio.max_latency(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_target_bytes() {
        let mut config = AppConfig::default();
        assert_eq!(config.audio.target_bytes(), 64000);

        config.audio.buffer_duration_ms = 1000;
        assert_eq!(config.audio.target_bytes(), 32000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.silence_reset_ms = config.audio.stale_reset_ms;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.queue.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_longer_than_model_window_rejected() {
        let mut config = AppConfig::default();
        config.audio.buffer_duration_ms = 30_000;
        assert!(config.validate().is_ok());

        config.audio.buffer_duration_ms = 30_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_language_hint() {
        let mut config = AppConfig::default();
        assert_eq!(config.language_hint(), Some("en".to_string()));

        config.models.language = "auto".to_string();
        assert_eq!(config.language_hint(), None);

        config.models.language = "  ".to_string();
        assert_eq!(config.language_hint(), None);
    }
}
