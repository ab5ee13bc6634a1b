//! # Time Sources
//!
//! Wall-clock access plus a one-shot drift measurement used at bootstrap.
//!
//! | Adapter | `now()` | `drift()` |
//! |---------|---------|-----------|
//! | [`SystemTimeSource`] | OS clock | always 0 |
//! | [`SntpTimeSource`] | OS clock | SNTP query |
//! | `ManualTimeSource` (test-utils) | settable | settable |

use crate::TimeError;
use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::debug;

/// Seconds between 1900-01-01 (NTP era 0) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Size of an SNTP packet without extensions.
const SNTP_PACKET_LEN: usize = 48;

/// Clock abstraction; timestamps are unix seconds, drift is milliseconds.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Current unix time in seconds.
    fn now(&self) -> u64;

    /// Offset of the reference clock against the local one, in milliseconds.
    async fn drift(&self) -> Result<i64, TimeError>;
}

fn system_millis() -> i128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i128)
}

/// Local OS clock, assumed correct.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

#[async_trait]
impl TimeSource for SystemTimeSource {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }

    async fn drift(&self) -> Result<i64, TimeError> {
        Ok(0)
    }
}

/// Local OS clock checked against an SNTP server.
#[derive(Debug, Clone)]
pub struct SntpTimeSource {
    server: String,
    timeout: Duration,
}

impl SntpTimeSource {
    /// Create new source querying `server` (`host:port`).
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Override the query timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn query(&self) -> Result<i64, TimeError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.server).await?;

        let mut request = [0u8; SNTP_PACKET_LEN];
        // LI = 0, VN = 3, Mode = 3 (client)
        request[0] = 0x1B;

        let sent_at = system_millis();
        socket.send(&request).await?;

        let mut response = [0u8; SNTP_PACKET_LEN];
        let len = socket.recv(&mut response).await?;
        let received_at = system_millis();

        parse_offset(&response[..len], sent_at, received_at)
    }
}

/// Clock offset `((t2 - t1) + (t3 - t4)) / 2` from an SNTP response.
fn parse_offset(response: &[u8], sent_at: i128, received_at: i128) -> Result<i64, TimeError> {
    if response.len() < SNTP_PACKET_LEN {
        return Err(TimeError::InvalidResponse(format!("{} byte packet", response.len())));
    }
    let mode = response[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(TimeError::InvalidResponse(format!("mode {mode}")));
    }

    let server_received = ntp_millis(&response[32..40])?;
    let server_sent = ntp_millis(&response[40..48])?;
    let offset = ((server_received - sent_at) + (server_sent - received_at)) / 2;

    i64::try_from(offset).map_err(|_| TimeError::InvalidResponse("offset out of range".into()))
}

/// 64-bit NTP timestamp to unix milliseconds.
fn ntp_millis(bytes: &[u8]) -> Result<i128, TimeError> {
    let word = |range: std::ops::Range<usize>| -> Result<u64, TimeError> {
        let raw: [u8; 4] = bytes
            .get(range)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| TimeError::InvalidResponse("short timestamp".into()))?;
        Ok(u64::from(u32::from_be_bytes(raw)))
    };
    let seconds = word(0..4)?;
    let fraction = word(4..8)?;
    if seconds == 0 {
        return Err(TimeError::InvalidResponse("unset timestamp".into()));
    }

    let unix_seconds = i128::from(seconds) - i128::from(NTP_UNIX_OFFSET);
    let millis = (i128::from(fraction) * 1000) >> 32;
    Ok(unix_seconds * 1000 + millis)
}

#[async_trait]
impl TimeSource for SntpTimeSource {
    fn now(&self) -> u64 {
        SystemTimeSource.now()
    }

    async fn drift(&self) -> Result<i64, TimeError> {
        let drift = tokio::time::timeout(self.timeout, self.query())
            .await
            .map_err(|_| TimeError::Timeout)??;
        debug!(server = %self.server, drift_ms = drift, "measured clock drift");
        Ok(drift)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use manual::ManualTimeSource;

#[cfg(any(test, feature = "test-utils"))]
mod manual {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
    use std::sync::Arc;

    /// Clock driven by the test.
    #[derive(Debug, Clone, Default)]
    pub struct ManualTimeSource {
        now: Arc<AtomicU64>,
        drift: Arc<AtomicI64>,
    }

    impl ManualTimeSource {
        /// Create new clock reading `now`.
        pub fn new(now: u64) -> Self {
            Self {
                now: Arc::new(AtomicU64::new(now)),
                drift: Arc::default(),
            }
        }

        /// Set the clock.
        pub fn set(&self, now: u64) {
            self.now.store(now, Ordering::SeqCst);
        }

        /// Move the clock forward.
        pub fn advance(&self, seconds: u64) {
            self.now.fetch_add(seconds, Ordering::SeqCst);
        }

        /// Set the drift `drift()` reports.
        pub fn set_drift(&self, drift_ms: i64) {
            self.drift.store(drift_ms, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TimeSource for ManualTimeSource {
        fn now(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }

        async fn drift(&self) -> Result<i64, TimeError> {
            Ok(self.drift.load(Ordering::SeqCst))
        }
    }
}
