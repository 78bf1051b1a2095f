#![forbid(unsafe_code)]

// Command-line surface; every flag falls back to an ASR_STRESS_* variable

use crate::config::RunConfig;
use crate::error::{StressError, StressResult};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "asr-stress", version, about = "Concurrent load test for a streaming ASR WebSocket service")]
pub struct Args {
    /// Number of concurrent connections
    #[arg(short = 'c', long, env = "ASR_STRESS_CONNECTIONS", default_value_t = 20)]
    pub connections: usize,

    /// Audio files streamed per connection
    #[arg(short = 'a', long, env = "ASR_STRESS_AUDIO_PER_CONNECTION", default_value_t = 3)]
    pub audio_per_connection: usize,

    /// Directory of .wav files to draw from
    #[arg(short = 'd', long, env = "ASR_STRESS_AUDIO_DIR", default_value = "test_wavs")]
    pub audio_dir: PathBuf,

    /// Streaming endpoint
    #[arg(short = 'u', long, env = "ASR_STRESS_URL", default_value = "ws://localhost:8080/ws")]
    pub url: String,

    /// Seconds to keep waiting for results after the last chunk
    #[arg(short = 'w', long, env = "ASR_STRESS_WAIT", default_value_t = 3.0)]
    pub wait: f64,

    /// Bytes per binary frame
    #[arg(long, env = "ASR_STRESS_CHUNK_SIZE", default_value_t = 8192)]
    pub chunk_size: usize,

    /// Seconds allowed for the WebSocket handshake
    #[arg(long, env = "ASR_STRESS_CONNECT_TIMEOUT", default_value_t = 30)]
    pub connect_timeout: u64,

    /// Seconds between host resource samples
    #[arg(long, env = "ASR_STRESS_SAMPLE_INTERVAL", default_value_t = 2)]
    pub sample_interval: u64,

    /// Seconds to wait for the health endpoint before giving up
    #[arg(long, env = "ASR_STRESS_MAX_READY_WAIT", default_value_t = 60)]
    pub max_ready_wait: u64,

    /// Seed for file assignment and pauses
    #[arg(long, env = "ASR_STRESS_SEED")]
    pub seed: Option<u64>,

    /// Print the summary as JSON instead of text
    #[arg(long, env = "ASR_STRESS_JSON")]
    pub json: bool,
}

impl Args {
    /// Builds and validates the run configuration.
    pub fn into_run_config(self) -> StressResult<RunConfig> {
        let post_send_wait = Duration::try_from_secs_f64(self.wait)
            .map_err(|_| StressError::Config(format!("invalid wait of {} seconds", self.wait)))?;

        let mut config = RunConfig {
            server_url: self.url,
            connections: self.connections,
            audio_per_connection: self.audio_per_connection,
            audio_dir: self.audio_dir,
            post_send_wait,
            seed: self.seed,
            ..Default::default()
        };
        config.streamer.chunk_size = self.chunk_size;
        config.worker.connect_timeout = Duration::from_secs(self.connect_timeout);
        config.sampler.interval = Duration::from_secs(self.sample_interval);
        config.readiness.max_wait = Duration::from_secs(self.max_ready_wait);

        config.validate()?;
        Ok(config)
    }
}
