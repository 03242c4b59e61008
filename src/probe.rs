use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    /// How long a single connection attempt may take.
    ///
    /// default: 250 ms
    pub attempt_timeout: Duration,

    /// Pause between two connection attempts.
    ///
    /// default: 50 ms
    pub retry_interval: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(250),
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Checks whether something accepts TCP connections on `host:port`, retrying until `timeout`.
///
/// Returns `true` as soon as one connection attempt succeeds and `false` once the timeout elapsed
/// without success. Failing attempts (refused connections, unresolvable hosts, ...) are never
/// raised.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    probe_with(host, port, timeout, ProbeOptions::default()).await
}

pub async fn probe_with(host: &str, port: u16, timeout: Duration, options: ProbeOptions) -> bool {
    let deadline = Instant::now() + timeout;
    let mut attempts: u32 = 0;

    while Instant::now() < deadline {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt_timeout = options.attempt_timeout.min(remaining);

        match tokio::time::timeout(attempt_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                tracing::debug!(host, port, attempts, "Endpoint accepts connections");
                return true;
            }
            Ok(Err(err)) => {
                tracing::trace!(host, port, attempts, error = %err, "Connection attempt failed");
            }
            Err(_elapsed) => {
                tracing::trace!(host, port, attempts, "Connection attempt timed out");
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(options.retry_interval.min(remaining)).await;
    }

    tracing::debug!(host, port, attempts, ?timeout, "Endpoint did not open in time");
    false
}
