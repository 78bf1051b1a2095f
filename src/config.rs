#![forbid(unsafe_code)]

// Run configuration: server target, load shape, pacing and timeout knobs

use crate::error::{StressError, StressResult};
use std::path::PathBuf;
use std::time::Duration;

/// Main run configuration, fixed before the run starts and shared read-only.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub server_url: String,
    pub connections: usize,
    pub audio_per_connection: usize,
    pub audio_dir: PathBuf,
    /// Lower bound on how long to wait for trailing results after the last chunk
    pub post_send_wait: Duration,
    /// Seed for corpus partitioning and inter-file pauses; random when unset
    pub seed: Option<u64>,
    pub streamer: StreamerConfig,
    pub worker: WorkerConfig,
    pub sampler: SamplerConfig,
    pub readiness: ReadinessConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws".to_string(),
            connections: 20,
            audio_per_connection: 3,
            audio_dir: PathBuf::from("test_wavs"),
            post_send_wait: Duration::from_secs(3),
            seed: None,
            streamer: StreamerConfig::default(),
            worker: WorkerConfig::default(),
            sampler: SamplerConfig::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

impl RunConfig {
    /// Rejects configurations the core cannot run with.
    pub fn validate(&self) -> StressResult<()> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(StressError::Config(format!(
                "server url must use ws:// or wss://, got '{}'",
                self.server_url
            )));
        }
        if self.connections == 0 {
            return Err(StressError::Config("connections must be at least 1".into()));
        }
        if self.audio_per_connection == 0 {
            return Err(StressError::Config(
                "audio files per connection must be at least 1".into(),
            ));
        }
        self.streamer.validate()?;
        self.worker.validate()?;
        if self.sampler.interval.is_zero() {
            return Err(StressError::Config("sampler interval must be non-zero".into()));
        }
        if self.readiness.poll_interval.is_zero() {
            return Err(StressError::Config("readiness poll interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Chunking and receive-timeout parameters for a single audio test
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub chunk_size: usize,
    pub timeout_multiplier: f64,
    pub timeout_margin: Duration,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            timeout_multiplier: 2.0,
            timeout_margin: Duration::from_secs(5),
            min_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(60),
        }
    }
}

impl StreamerConfig {
    fn validate(&self) -> StressResult<()> {
        if self.chunk_size == 0 {
            return Err(StressError::Config("chunk size must be non-zero".into()));
        }
        if self.min_timeout > self.max_timeout {
            return Err(StressError::Config(format!(
                "min timeout {:?} exceeds max timeout {:?}",
                self.min_timeout, self.max_timeout
            )));
        }
        if !self.timeout_multiplier.is_finite() || self.timeout_multiplier < 0.0 {
            return Err(StressError::Config("timeout multiplier must be a non-negative number".into()));
        }
        Ok(())
    }
}

/// Per-connection behavior
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub connect_timeout: Duration,
    pub min_pause: Duration,
    pub max_pause: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            min_pause: Duration::from_secs(1),
            max_pause: Duration::from_secs(3),
        }
    }
}

impl WorkerConfig {
    fn validate(&self) -> StressResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(StressError::Config("connect timeout must be non-zero".into()));
        }
        if self.min_pause > self.max_pause {
            return Err(StressError::Config(format!(
                "min pause {:?} exceeds max pause {:?}",
                self.min_pause, self.max_pause
            )));
        }
        Ok(())
    }
}

/// Host resource sampling
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub interval: Duration,
    /// Ring buffer capacity for recent CPU/memory/network samples
    pub history: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            history: 100,
        }
    }
}

/// Service readiness gate
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub request_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.streamer.chunk_size, 8192);
        assert_eq!(config.streamer.min_timeout, Duration::from_secs(10));
        assert_eq!(config.streamer.max_timeout, Duration::from_secs(60));
        assert_eq!(config.worker.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.sampler.interval, Duration::from_secs(2));
        assert_eq!(config.sampler.history, 100);
    }

    #[test]
    fn test_rejects_zero_connections() {
        let config = RunConfig {
            connections: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StressError::Config(_))));
    }

    #[test]
    fn test_rejects_http_url() {
        let config = RunConfig {
            server_url: "http://localhost:8080/ws".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StressError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_timeouts_and_pauses() {
        let mut config = RunConfig::default();
        config.streamer.min_timeout = Duration::from_secs(90);
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.worker.min_pause = Duration::from_secs(5);
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.streamer.chunk_size = 0;
        assert!(config.validate().is_err());
    }
}
