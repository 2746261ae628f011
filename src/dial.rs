//! Dialing a backend that may still be booting

use crate::error::DialError;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Connect timeout for a single attempt, and the minimum spacing between attempts
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(250);

/// Upper bound on attempts whatever the timeout
pub const MAX_ATTEMPTS: u32 = 1000;

/// Only a backend that is not listening yet is worth waiting for
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::ConnectionRefused
    )
}

/// Connect to `endpoint`, retrying refused and timed out attempts until
/// `timeout` has elapsed.
///
/// Each attempt occupies at least [`ATTEMPT_TIMEOUT`]: an attempt that is
/// refused immediately waits out the rest of its slot before the next one.
pub async fn await_dial(endpoint: &str, timeout: Duration) -> Result<TcpStream, DialError> {
    dial_with(endpoint, timeout, || TcpStream::connect(endpoint)).await
}

/// Retry loop behind [`await_dial`], with the connect step supplied by the caller
async fn dial_with<S, F, Fut>(endpoint: &str, timeout: Duration, mut connect: F) -> Result<S, DialError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<S>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts: u32 = 0;

    loop {
        if attempts >= MAX_ATTEMPTS {
            return Err(DialError::TooManyAttempts(attempts));
        }

        let attempt_start = Instant::now();
        if attempt_start >= deadline {
            debug!(endpoint, attempts, "Backend dial deadline elapsed");
            return Err(DialError::Timeout {
                attempts,
                elapsed: start.elapsed(),
            });
        }

        attempts += 1;
        if attempts == 2 {
            debug!(endpoint, "Backend not reachable yet, retrying");
        }

        let slot_end = (attempt_start + ATTEMPT_TIMEOUT).min(deadline);
        let err = match tokio::time::timeout_at(slot_end, connect()).await {
            Ok(Ok(stream)) => {
                if attempts > 1 {
                    debug!(
                        endpoint,
                        attempts,
                        elapsed_secs = start.elapsed().as_secs_f64(),
                        "Connected to backend"
                    );
                }
                return Ok(stream);
            }
            Ok(Err(e)) => e,
            Err(_) => io::Error::from(io::ErrorKind::TimedOut),
        };

        if !is_retryable(&err) {
            return Err(DialError::Io(err));
        }

        tokio::time::sleep_until(slot_end).await;
    }
}
