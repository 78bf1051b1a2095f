#![forbid(unsafe_code)]

// Service readiness gate: poll the ASR health endpoint before any load starts

use crate::config::ReadinessConfig;
use crate::error::{StressError, StressResult};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Carries the last observed status or failure
    NotReady(String),
}

/// A single readiness check against the service under test
pub trait ReadinessProbe {
    fn check(&self) -> impl Future<Output = Readiness> + Send;

    /// What is being probed, for error reporting
    fn target(&self) -> String;
}

/// Maps the streaming endpoint to its HTTP health endpoint.
///
/// `ws://host:port/ws` becomes `http://host:port/health`; a path with a
/// `/ws` suffix keeps its prefix, any other path is replaced.
pub fn health_url(ws_url: &str) -> StressResult<Url> {
    let mut url = Url::parse(ws_url).map_err(|e| StressError::Config(format!("invalid server url '{}': {}", ws_url, e)))?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => {
            return Err(StressError::Config(format!(
                "server url must use ws:// or wss://, got {}://",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| StressError::Config(format!("cannot derive health url from '{}'", ws_url)))?;

    let path = url.path().trim_end_matches('/');
    let health_path = match path.strip_suffix("/ws") {
        Some(prefix) => format!("{}/health", prefix),
        None => "/health".to_string(),
    };
    url.set_path(&health_path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: String,
}

/// Ready iff the health endpoint answers 200 with `{"status":"healthy"}`
pub struct HttpHealthProbe {
    url: Url,
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(ws_url: &str, request_timeout: Duration) -> StressResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StressError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            url: health_url(ws_url)?,
            client,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl ReadinessProbe for HttpHealthProbe {
    async fn check(&self) -> Readiness {
        let response = match self.client.get(self.url.clone()).send().await {
            Ok(response) => response,
            Err(e) => return Readiness::NotReady(e.to_string()),
        };
        if response.status() != reqwest::StatusCode::OK {
            return Readiness::NotReady(format!("HTTP {}", response.status()));
        }
        match response.json::<HealthResponse>().await {
            Ok(body) if body.status == "healthy" => Readiness::Ready,
            Ok(body) => Readiness::NotReady(format!("status '{}'", body.status)),
            Err(e) => Readiness::NotReady(format!("invalid health response: {}", e)),
        }
    }

    fn target(&self) -> String {
        self.url.to_string()
    }
}

/// Polls `probe` until it reports ready, the wait budget runs out, or the run
/// is cancelled.
pub async fn wait_until_ready(
    probe: &impl ReadinessProbe,
    config: &ReadinessConfig,
    cancel: &CancellationToken,
) -> StressResult<()> {
    let started = Instant::now();
    let mut last_status = "no response".to_string();
    info!("Waiting for service at {}", probe.target());

    loop {
        let readiness = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StressError::Cancelled),
            readiness = probe.check() => readiness,
        };

        match readiness {
            Readiness::Ready => {
                info!("Service ready after {:.1}s", started.elapsed().as_secs_f64());
                return Ok(());
            }
            Readiness::NotReady(status) => {
                debug!("Service not ready: {}", status);
                last_status = status;
            }
        }

        let waited = started.elapsed();
        if waited >= config.max_wait {
            return Err(StressError::ReadinessTimeout {
                url: probe.target(),
                waited,
                last_status,
            });
        }

        let pause = config.poll_interval.min(config.max_wait - waited);
        tokio::select! {
            _ = cancel.cancelled() => return Err(StressError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Not ready for the first `ready_after` checks
    struct ScriptedProbe {
        ready_after: usize,
        checks: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(ready_after: usize) -> Self {
            Self {
                ready_after,
                checks: AtomicUsize::new(0),
            }
        }
    }

    impl ReadinessProbe for ScriptedProbe {
        async fn check(&self) -> Readiness {
            let n = self.checks.fetch_add(1, Ordering::SeqCst);
            if n >= self.ready_after {
                Readiness::Ready
            } else {
                Readiness::NotReady("initializing".into())
            }
        }

        fn target(&self) -> String {
            "scripted".into()
        }
    }

    fn config(max_wait_secs: u64) -> ReadinessConfig {
        ReadinessConfig {
            poll_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(max_wait_secs),
            request_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_health_url_mapping() {
        assert_eq!(
            health_url("ws://localhost:8080/ws").unwrap().as_str(),
            "http://localhost:8080/health"
        );
        assert_eq!(
            health_url("wss://asr.example.com/ws/").unwrap().as_str(),
            "https://asr.example.com/health"
        );
        assert_eq!(
            health_url("ws://10.0.0.2:9000/api/ws?token=x#frag").unwrap().as_str(),
            "http://10.0.0.2:9000/api/health"
        );
        assert_eq!(
            health_url("ws://localhost:8080/stream").unwrap().as_str(),
            "http://localhost:8080/health"
        );
        assert!(health_url("http://localhost:8080/ws").is_err());
        assert!(health_url("not a url").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_retries() {
        let probe = ScriptedProbe::new(2);
        let result = wait_until_ready(&probe, &config(60), &CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(probe.checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out() {
        let probe = ScriptedProbe::new(usize::MAX);
        let started = Instant::now();
        let result = wait_until_ready(&probe, &config(10), &CancellationToken::new()).await;
        match result {
            Err(StressError::ReadinessTimeout { last_status, waited, .. }) => {
                assert_eq!(last_status, "initializing");
                assert!(waited >= Duration::from_secs(10));
            }
            other => panic!("expected readiness timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait() {
        let probe = ScriptedProbe::new(usize::MAX);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });
        let result = wait_until_ready(&probe, &config(60), &cancel).await;
        assert!(matches!(result, Err(StressError::Cancelled)));
    }
}
