#![forbid(unsafe_code)]

// Single audio test: paced chunk sending raced against a listener task that
// waits for the recognition verdict on the same connection.

use crate::audio::AudioRecord;
use crate::config::StreamerConfig;
use crate::connection::{Connection, WsReader};
use crate::error::StressError;
use crate::protocol::ServerMessage;
use futures_util::StreamExt;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifies one audio test in logs and records
#[derive(Debug, Clone)]
pub struct TestLabel {
    pub connection_id: usize,
    /// 1-based position within the connection's file list
    pub audio_index: usize,
    pub audio_file: String,
}

impl fmt::Display for TestLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{} audio-{}", self.connection_id, self.audio_index)
    }
}

/// Result of streaming one audio file.
///
/// `timeout` implies `!success`; a timeout carries no error message.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub audio_file: String,
    pub success: bool,
    pub timeout: bool,
    pub error: Option<String>,
    pub text: Option<String>,
    /// From the first chunk until the verdict was observed
    pub latency: Duration,
}

impl TestOutcome {
    fn recognized(label: &TestLabel, text: String, latency: Duration) -> Self {
        Self {
            audio_file: label.audio_file.clone(),
            success: true,
            timeout: false,
            error: None,
            text: Some(text),
            latency,
        }
    }

    fn failed(label: &TestLabel, error: String, latency: Duration) -> Self {
        Self {
            audio_file: label.audio_file.clone(),
            success: false,
            timeout: false,
            error: Some(error),
            text: None,
            latency,
        }
    }

    fn timed_out(label: &TestLabel, latency: Duration) -> Self {
        Self {
            audio_file: label.audio_file.clone(),
            success: false,
            timeout: true,
            error: None,
            text: None,
            latency,
        }
    }
}

/// Terminal verdict delivered by the listener
#[derive(Debug)]
enum Resolution {
    Recognized(String),
    Failed(String),
}

pub struct AudioStreamer {
    config: StreamerConfig,
    post_send_wait: Duration,
}

impl AudioStreamer {
    pub fn new(config: StreamerConfig, post_send_wait: Duration) -> Self {
        Self {
            config,
            post_send_wait,
        }
    }

    /// `clamp(duration * multiplier + margin, min, max)`
    pub fn receive_timeout(&self, audio_duration: Duration) -> Duration {
        let scaled_nanos = (audio_duration.as_nanos() as f64 * self.config.timeout_multiplier).round();
        let scaled = Duration::from_nanos(scaled_nanos as u64).saturating_add(self.config.timeout_margin);
        scaled.clamp(self.config.min_timeout, self.config.max_timeout)
    }

    /// Real-time playback length of `chunk_len` bytes of `audio`
    pub fn chunk_interval(chunk_len: usize, audio: &AudioRecord) -> Duration {
        let bytes_per_second = audio.bytes_per_second() as u128;
        if bytes_per_second == 0 {
            return Duration::ZERO;
        }
        let nanos = chunk_len as u128 * 1_000_000_000 / bytes_per_second;
        Duration::from_nanos(nanos as u64)
    }

    /// Streams `audio` over `conn` and waits for the verdict. Never fails: every
    /// error becomes part of the returned outcome. The listener task is always
    /// stopped and joined before this returns.
    pub async fn stream(
        &self,
        conn: &mut Connection,
        audio: &AudioRecord,
        label: &TestLabel,
        cancel: &CancellationToken,
    ) -> TestOutcome {
        let started = Instant::now();
        let receive_timeout = self.receive_timeout(audio.duration);

        let Some(reader) = conn.take_reader() else {
            return TestOutcome::failed(
                label,
                StressError::Receive("connection has no active reader".into()).to_string(),
                started.elapsed(),
            );
        };

        let (resolve_tx, mut resolve_rx) = oneshot::channel();
        let listener_cancel = cancel.child_token();
        let listener = tokio::spawn(listen(
            reader,
            resolve_tx,
            receive_timeout,
            label.to_string(),
            listener_cancel.clone(),
        ));

        debug!(
            "{}: streaming {} ({} bytes, {:?}, receive timeout {:?})",
            label,
            label.audio_file,
            audio.samples.len(),
            audio.duration,
            receive_timeout
        );

        let mut send_error = None;
        let mut early = None;
        for chunk in audio.samples.chunks(self.config.chunk_size) {
            if cancel.is_cancelled() {
                break;
            }
            // A verdict already arrived; the rest of the file is not needed
            if let Ok(resolution) = resolve_rx.try_recv() {
                early = Some(resolution);
                break;
            }
            if let Err(e) = conn.send_binary(chunk).await {
                send_error = Some(e);
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Self::chunk_interval(chunk.len(), audio)) => {}
            }
        }

        let outcome = if let Some(resolution) = early {
            Self::resolve(label, resolution, started.elapsed())
        } else if let Some(e) = send_error {
            // A verdict that raced the broken write still wins
            match resolve_rx.try_recv() {
                Ok(resolution) => Self::resolve(label, resolution, started.elapsed()),
                Err(_) => TestOutcome::failed(label, e.to_string(), started.elapsed()),
            }
        } else if cancel.is_cancelled() {
            TestOutcome::failed(label, StressError::Cancelled.to_string(), started.elapsed())
        } else {
            let deadline = Instant::now() + receive_timeout.max(self.post_send_wait);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    TestOutcome::failed(label, StressError::Cancelled.to_string(), started.elapsed())
                }
                waited = tokio::time::timeout_at(deadline, &mut resolve_rx) => match waited {
                    Ok(Ok(resolution)) => Self::resolve(label, resolution, started.elapsed()),
                    // Listener went quiet without a verdict; the send path still owns the deadline
                    Ok(Err(_)) => tokio::select! {
                        _ = cancel.cancelled() => {
                            TestOutcome::failed(label, StressError::Cancelled.to_string(), started.elapsed())
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            TestOutcome::timed_out(label, started.elapsed())
                        }
                    },
                    Err(_) => TestOutcome::timed_out(label, started.elapsed()),
                },
            }
        };

        listener_cancel.cancel();
        match listener.await {
            Ok(reader) => conn.restore_reader(reader),
            Err(e) => warn!("{}: listener task failed: {}", label, e),
        }

        if outcome.success {
            info!(
                "{}: recognized in {:.2}s: {}",
                label,
                outcome.latency.as_secs_f64(),
                outcome.text.as_deref().unwrap_or_default()
            );
        } else if outcome.timeout {
            warn!("{}: {}", label, StressError::Timeout(receive_timeout));
        } else {
            warn!(
                "{}: failed: {}",
                label,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }

        outcome
    }

    fn resolve(label: &TestLabel, resolution: Resolution, latency: Duration) -> TestOutcome {
        match resolution {
            Resolution::Recognized(text) => TestOutcome::recognized(label, text, latency),
            Resolution::Failed(message) => TestOutcome::failed(label, message, latency),
        }
    }
}

/// Consumes inbound messages until a verdict, a silence timeout or cancellation.
/// Hands the reader back in every case.
async fn listen(
    mut reader: WsReader,
    resolve: oneshot::Sender<Resolution>,
    silence_timeout: Duration,
    label: String,
    cancel: CancellationToken,
) -> WsReader {
    let resolution = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return reader,
            next = tokio::time::timeout(silence_timeout, reader.next()) => next,
        };

        match next {
            Err(_) => {
                debug!("{}: nothing received for {:?}", label, silence_timeout);
                return reader;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                break Resolution::Failed("connection closed by server".to_string());
            }
            Ok(Some(Err(e))) => break Resolution::Failed(StressError::Receive(e.to_string()).to_string()),
            Ok(Some(Ok(Message::Text(payload)))) => {
                let Some(message) = ServerMessage::decode(&payload) else {
                    debug!("{}: ignoring undecodable payload", label);
                    continue;
                };
                if let Some(text) = message.recognized_text() {
                    break Resolution::Recognized(text.to_string());
                }
                match message {
                    ServerMessage::Error { message } => {
                        let message = if message.is_empty() {
                            "unknown server error".to_string()
                        } else {
                            message
                        };
                        break Resolution::Failed(message);
                    }
                    ServerMessage::Connection { message, session_id } => {
                        debug!("{}: server handshake: {} (session {:?})", label, message, session_id);
                    }
                    other => debug!("{}: ignoring {:?}", label, other),
                }
            }
            // Binary, ping and pong frames carry no verdict
            Ok(Some(Ok(_))) => {}
        }
    };

    // Receiver may already be gone if the send path gave up
    let _ = resolve.send(resolution);
    reader
}
