//! Connection lifecycle for a serial link
//!
//! This module holds the connection state machine, the reset handshake run
//! after every successful open and the recovery policy for receive errors.

mod manager;
pub mod recovery;
pub mod reset;

use std::fmt;

use serde::Serialize;

use crate::transport::ConnectionId;

pub use manager::ConnectionManager;
pub use recovery::{HostStatus, RecoveryDecision, RecoveryOutcome};
pub use reset::{ResetPhase, ResetSequence, RESET_PULSE};

/// Connection manager state
///
/// `Disconnected -> Connecting -> ResettingDevice -> Connected -> Disconnecting
/// -> Disconnected`, with `FailedToOpen` reachable from `Connecting`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ResettingDevice,
    Connected,
    Disconnecting,
    FailedToOpen,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ResettingDevice => "resetting device",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::FailedToOpen => "failed to open",
        };
        f.write_str(name)
    }
}

/// Per-connection bookkeeping owned by the manager
#[derive(Debug, Clone, Default)]
pub struct Connection {
    pub id: Option<ConnectionId>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub consecutive_failures: u32,
    pub state: ConnectionState,
    /// Bumped on every open and teardown so late completions can detect staleness
    pub generation: u64,
}

impl Connection {
    /// Start tracking a freshly opened handle
    pub fn open(&mut self, id: ConnectionId) {
        self.id = Some(id);
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.consecutive_failures = 0;
        self.state = ConnectionState::ResettingDevice;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Forget the handle and zero the counters
    pub fn reset(&mut self) {
        self.id = None;
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.consecutive_failures = 0;
        self.state = ConnectionState::Disconnected;
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::ResettingDevice | ConnectionState::Connected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_resets_counters_and_bumps_generation() {
        let mut conn = Connection {
            bytes_sent: 10,
            bytes_received: 20,
            consecutive_failures: 3,
            ..Default::default()
        };

        conn.open(ConnectionId(5));

        assert_eq!(conn.id, Some(ConnectionId(5)));
        assert_eq!(conn.bytes_sent, 0);
        assert_eq!(conn.bytes_received, 0);
        assert_eq!(conn.consecutive_failures, 0);
        assert_eq!(conn.state, ConnectionState::ResettingDevice);
        assert_eq!(conn.generation, 1);
        assert!(conn.is_active());
    }

    #[test]
    fn test_reset_keeps_generation() {
        let mut conn = Connection::default();
        conn.open(ConnectionId(1));
        conn.bytes_sent = 7;

        conn.reset();

        assert_eq!(conn.id, None);
        assert_eq!(conn.bytes_sent, 0);
        assert_eq!(conn.state, ConnectionState::Disconnected);
        assert_eq!(conn.generation, 1);
        assert!(!conn.is_active());
    }
}
