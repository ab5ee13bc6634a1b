//! # Connection Events
//!
//! Lifecycle signals of the connection manager and the state it walks
//! through.
//!
//! ```text
//! Disconnected -> Discovering -> Connecting -> Connected
//!                     ^              |            |
//!                     |              v            v
//!                     +-------- Reconnecting <----+
//!
//! Connected -> Disconnecting -> Disconnected      (shutdown)
//! ```

use crate::BusError;
use std::fmt;

/// Lifecycle signal broadcast by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    /// A connection attempt to `address` started.
    Connecting {
        /// Discovered broker address
        address: String,
    },
    /// Connected and every live topic resubscribed.
    Online,
    /// The connection went away.
    Offline,
    /// Something failed; the manager keeps going unless bootstrap failed.
    Error(BusError),
}

/// Where the connection manager currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not started or shut down
    #[default]
    Disconnected,
    /// Looking for a broker
    Discovering,
    /// Transport created, waiting for it to connect
    Connecting,
    /// Connection lost, reconnect timer armed
    Reconnecting,
    /// Live
    Connected,
    /// Shutting down
    Disconnecting,
}

impl ConnectionState {
    /// Whether messages can currently flow.
    pub fn is_online(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Disconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_states() {
        assert!(ConnectionState::Connected.is_online());
        assert!(ConnectionState::Disconnecting.is_online());
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Discovering,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
        ] {
            assert!(!state.is_online(), "{state}");
        }
    }
}
