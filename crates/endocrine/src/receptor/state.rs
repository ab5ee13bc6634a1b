//! Per-stream receptor state.

use es_bus::SubscriptionHandle;
use es_crypto::CertInfo;
use es_protocol::{Definition, Field, Hormone, Sample};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// An accepted stream.
pub(crate) struct Stream {
    pub(crate) definition: Arc<Definition>,
    pub(crate) origin: CertInfo,
    pub(crate) subscription: SubscriptionHandle,
    pub(crate) latest: Option<Received>,
}

/// The last hormone of a stream and what it did to the stream's state.
pub(crate) struct Received {
    pub(crate) hormone: Hormone,
    pub(crate) received_at: u64,
    pub(crate) state_changed_at: u64,
    pub(crate) is_fresh: bool,
    pub(crate) error: i64,
    /// Identifies the expiration timer armed for this hormone.
    pub(crate) generation: u64,
    pub(crate) timer: Option<JoinHandle<()>>,
}

impl Received {
    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for Received {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Snapshot of one stream's latest hormone.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HormoneView {
    /// Stream name
    pub name: String,
    /// Producer timestamp
    pub sent_at: u64,
    /// Local time of arrival
    pub received_at: u64,
    /// Local time of the last freshness or error transition
    pub state_changed_at: u64,
    /// Values by field name
    pub values: Sample,
    /// Ordered fields
    pub data_format: Vec<Field>,
    /// Check result, 0 when fine
    pub error: i64,
    /// Within the freshness window
    pub is_fresh: bool,
}

impl HormoneView {
    pub(crate) fn new(name: &str, received: &Received) -> Self {
        Self {
            name: name.to_string(),
            sent_at: received.hormone.timestamp(),
            received_at: received.received_at,
            state_changed_at: received.state_changed_at,
            values: received.hormone.sample(),
            data_format: received.hormone.definition().data_format().to_vec(),
            error: received.error,
            is_fresh: received.is_fresh,
        }
    }

    /// Fresh and error-free.
    pub fn is_good(&self) -> bool {
        self.is_fresh && self.error == 0
    }
}
