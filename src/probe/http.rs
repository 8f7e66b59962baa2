//! reqwest-backed probe client.
//!
//! A fresh client is built per measurement because the proxy differs
//! for every server. With no proxy, environment proxies are ignored.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::debug;

use super::{ProbeClient, ProgressFn};
use crate::error::ProbeError;

/// Round-trips per latency measurement; the fastest one wins.
const LATENCY_ATTEMPTS: usize = 2;
const ATTEMPT_GAP: Duration = Duration::from_millis(100);
const PROGRESS_EVERY: Duration = Duration::from_secs(1);
const BYTES_PER_MB: f64 = 1_000_000.0;

pub struct HttpProbeClient {
    user_agent: String,
}

impl Default for HttpProbeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProbeClient {
    pub fn new() -> Self {
        Self {
            user_agent: format!("poolwarden/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    fn client(&self, proxy: Option<SocketAddr>, timeout: Option<Duration>) -> Result<reqwest::Client, ProbeError> {
        let mut builder = reqwest::Client::builder().user_agent(self.user_agent.as_str());
        builder = match proxy {
            Some(addr) => builder.proxy(
                reqwest::Proxy::all(format!("http://{addr}"))
                    .map_err(|e| ProbeError::Proxy(e.to_string()))?,
            ),
            None => builder.no_proxy(),
        };
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        Ok(builder.build()?)
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Http(err)
    }
}

fn mb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 / BYTES_PER_MB / secs * 100.0).round() / 100.0
}

#[async_trait]
impl ProbeClient for HttpProbeClient {
    async fn measure_latency(
        &self,
        url: &str,
        proxy: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<u64, ProbeError> {
        let client = self.client(proxy, Some(timeout))?;

        let attempts = async {
            let mut best: Option<u64> = None;
            let mut last_err = None;
            for attempt in 0..LATENCY_ATTEMPTS {
                if attempt > 0 {
                    time::sleep(ATTEMPT_GAP).await;
                }
                let start = Instant::now();
                match client.get(url).send().await {
                    Ok(_) => {
                        let ms = start.elapsed().as_millis() as u64;
                        best = Some(best.map_or(ms, |b| b.min(ms)));
                    }
                    Err(e) => last_err = Some(classify(e, timeout)),
                }
            }
            match (best, last_err) {
                (Some(ms), _) => Ok(ms),
                (None, Some(e)) => Err(e),
                (None, None) => Err(ProbeError::Timeout(timeout)),
            }
        };

        time::timeout(timeout, attempts)
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
    }

    async fn measure_throughput(
        &self,
        url: &str,
        proxy: Option<SocketAddr>,
        timeout: Duration,
        on_progress: ProgressFn<'_>,
    ) -> Result<f64, ProbeError> {
        let client = self.client(proxy, None)?;
        let start = Instant::now();
        let deadline = start + timeout;

        let mut resp = time::timeout_at(deadline, client.get(url).send())
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
            .map_err(|e| classify(e, timeout))?;
        if !resp.status().is_success() {
            return Err(ProbeError::Status(resp.status().as_u16()));
        }

        let mut received: u64 = 0;
        let mut next_report = start + PROGRESS_EVERY;
        loop {
            match time::timeout_at(deadline, resp.chunk()).await {
                Ok(Ok(Some(chunk))) => {
                    received += chunk.len() as u64;
                    if Instant::now() >= next_report {
                        on_progress(mb_per_sec(received, start.elapsed()));
                        next_report += PROGRESS_EVERY;
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) if received == 0 => return Err(classify(e, timeout)),
                Ok(Err(e)) => {
                    debug!("Download interrupted after {} bytes: {}", received, e);
                    break;
                }
                // Deadline reached mid-download: the test window is over.
                Err(_) => break,
            }
        }

        Ok(mb_per_sec(received, start.elapsed()))
    }
}
