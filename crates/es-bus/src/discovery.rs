//! # Broker Discovery
//!
//! An ordered list of methods, each either a literal address or an async
//! resolver given the trust-root fingerprint. A cursor remembers the method
//! that produced the last address; a failing method (or a broker refusing
//! the address it produced) moves the cursor on, wrapping to the first
//! method after the last. Once every method failed in a row the cycle pauses
//! briefly before going on. There is no attempt limit.

use crate::{ConfigurationError, DiscoveryError};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Resolves a broker address for a trust root.
#[async_trait]
pub trait BrokerResolver: Send + Sync {
    /// Find a broker serving clients of the CA with `fingerprint`.
    async fn resolve(&self, fingerprint: &str) -> Result<String, DiscoveryError>;
}

#[async_trait]
impl<F, Fut> BrokerResolver for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, DiscoveryError>> + Send + 'static,
{
    async fn resolve(&self, fingerprint: &str) -> Result<String, DiscoveryError> {
        self(fingerprint.to_string()).await
    }
}

/// One way of finding the broker.
#[derive(Clone)]
pub enum DiscoveryMethod {
    /// Fixed address
    Address(String),
    /// Looked up on demand
    Resolver(Arc<dyn BrokerResolver>),
}

impl DiscoveryMethod {
    /// Wrap a resolver.
    pub fn resolver(resolver: impl BrokerResolver + 'static) -> Self {
        DiscoveryMethod::Resolver(Arc::new(resolver))
    }

    async fn resolve(&self, fingerprint: &str) -> Result<String, DiscoveryError> {
        match self {
            DiscoveryMethod::Address(address) => Ok(address.clone()),
            DiscoveryMethod::Resolver(resolver) => resolver.resolve(fingerprint).await,
        }
    }
}

impl fmt::Debug for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryMethod::Address(address) => f.debug_tuple("Address").field(address).finish(),
            DiscoveryMethod::Resolver(_) => f.write_str("Resolver"),
        }
    }
}

impl From<&str> for DiscoveryMethod {
    fn from(address: &str) -> Self {
        DiscoveryMethod::Address(address.to_string())
    }
}

/// Cycles through discovery methods until one yields an address.
#[derive(Debug)]
pub struct Discovery {
    methods: Vec<DiscoveryMethod>,
    cursor: usize,
    fingerprint: String,
    retry_delay: Duration,
}

impl Discovery {
    /// Create new discovery over `methods`; an empty list is a configuration error.
    pub fn new(
        methods: Vec<DiscoveryMethod>,
        fingerprint: impl Into<String>,
        retry_delay: Duration,
    ) -> Result<Self, ConfigurationError> {
        if methods.is_empty() {
            return Err(ConfigurationError::EmptyDiscovery);
        }
        Ok(Self {
            methods,
            cursor: 0,
            fingerprint: fingerprint.into(),
            retry_delay,
        })
    }

    /// Resolve the next broker address, starting at the cursor. Never gives up.
    pub async fn next_address(&mut self) -> String {
        let mut failures = 0;
        loop {
            let index = self.cursor;
            match self.methods[index].resolve(&self.fingerprint).await {
                Ok(address) => {
                    debug!(index, address = %address, "broker discovered");
                    return address;
                }
                Err(e) => {
                    debug!(index, error = %e, "discovery method failed");
                    self.advance();
                    failures += 1;
                }
            }

            if failures == self.methods.len() {
                warn!(
                    methods = self.methods.len(),
                    retry_ms = self.retry_delay.as_millis() as u64,
                    "no discovery method produced a broker address"
                );
                tokio::time::sleep(self.retry_delay).await;
                failures = 0;
            }
        }
    }

    /// Skip the current method, e.g. because its broker refused the connection.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.methods.len();
    }

    /// Pause applied after a fully failed round.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_list_rejected() {
        assert_eq!(
            Discovery::new(Vec::new(), "fp", Duration::from_secs(1)).unwrap_err(),
            ConfigurationError::EmptyDiscovery
        );
    }

    #[tokio::test]
    async fn test_literal_resolves_immediately() {
        let mut discovery = Discovery::new(vec!["mqtts://a".into()], "fp", Duration::from_secs(1)).unwrap();
        assert_eq!(discovery.next_address().await, "mqtts://a");
    }

    #[tokio::test]
    async fn test_failed_resolver_falls_through_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let rejecting = move |_fingerprint: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<String, _>(DiscoveryError::NotFound) }
        };

        let mut discovery = Discovery::new(
            vec![DiscoveryMethod::resolver(rejecting), "mqtts://literal".into()],
            "fp",
            Duration::from_secs(1),
        )
        .unwrap();

        assert_eq!(discovery.next_address().await, "mqtts://literal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The cursor stays on the method that worked.
        assert_eq!(discovery.next_address().await, "mqtts://literal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A refused literal hands over to the resolver again.
        discovery.advance();
        assert_eq!(discovery.next_address().await, "mqtts://literal");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resolver_receives_fingerprint() {
        let resolver = |fingerprint: String| async move { Ok::<_, DiscoveryError>(format!("mqtts://{fingerprint}")) };
        let mut discovery =
            Discovery::new(vec![DiscoveryMethod::resolver(resolver)], "ab:cd", Duration::from_secs(1)).unwrap();
        assert_eq!(discovery.next_address().await, "mqtts://ab:cd");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wraps_around_after_pause() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let flaky = move |_fingerprint: String| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(DiscoveryError::Failed("not yet".into()))
                } else {
                    Ok("mqtts://late".to_string())
                }
            }
        };

        let mut discovery =
            Discovery::new(vec![DiscoveryMethod::resolver(flaky)], "fp", Duration::from_secs(1)).unwrap();
        let started = tokio::time::Instant::now();
        assert_eq!(discovery.next_address().await, "mqtts://late");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
