//! Probe client: latency and throughput measurements through a proxy.
//!
//! Cycles never touch HTTP directly. They ask a [`ProbeClient`] to time
//! a round-trip or a download through the local port the engine forwards
//! for a server.

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::ProbeError;

pub mod http;

pub use http::HttpProbeClient;

/// Progress sink for throughput readings, in MB/s.
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// The loopback proxy endpoint for a forwarded port.
pub fn local_proxy(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

#[async_trait]
pub trait ProbeClient: Send + Sync {
    /// Time an HTTP round-trip to `url`. Returns milliseconds.
    async fn measure_latency(
        &self,
        url: &str,
        proxy: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<u64, ProbeError>;

    /// Download from `url` for at most `timeout`, reporting intermediate
    /// speeds through `on_progress`. Returns the final speed in MB/s,
    /// which is not passed to `on_progress`.
    async fn measure_throughput(
        &self,
        url: &str,
        proxy: Option<SocketAddr>,
        timeout: Duration,
        on_progress: ProgressFn<'_>,
    ) -> Result<f64, ProbeError>;
}
