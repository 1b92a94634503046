//! Wait for a rebooting host to accept connections again.
//!
//! Probes are bare TCP connects to the login port. Nothing is authenticated;
//! a successful connect only means the host is back on the network.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReachabilitySettings {
    pub port: u16,
    /// Give up after this long.
    pub timeout: Duration,
    /// Delay between attempts.
    pub interval: Duration,
    /// Bound on a single connect attempt.
    pub probe_timeout: Duration,
}

impl Default for ReachabilitySettings {
    fn default() -> Self {
        Self {
            port: 22,
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// One bounded connect attempt.
pub async fn probe(host: &str, port: u16, probe_timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(probe_timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Poll `host` until it accepts a connection, the timeout elapses or `cancel` fires.
///
/// `on_attempt` is called once per attempt with the 1-based attempt number.
pub async fn wait_until_reachable(
    host: &str,
    settings: &ReachabilitySettings,
    cancel: &CancellationToken,
    mut on_attempt: impl FnMut(u32),
) -> bool {
    info!(host = %host, timeout_secs = settings.timeout.as_secs(), "Waiting for host to come back");
    let deadline = Instant::now() + settings.timeout;
    let mut attempt = 0;

    loop {
        attempt += 1;
        on_attempt(attempt);

        if probe(host, settings.port, settings.probe_timeout).await {
            info!(host = %host, attempts = attempt, "Host is reachable");
            return true;
        }
        debug!(host = %host, attempt, "Host not reachable yet");

        if Instant::now() + settings.interval > deadline {
            warn!(host = %host, attempts = attempt, "Host did not come back in time");
            return false;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(host = %host, "Reachability wait cancelled");
                return false;
            }
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }
}
