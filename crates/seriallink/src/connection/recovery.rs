//! Receive error recovery policy
//!
//! Only `system_error` is treated as possibly transient. The first one of an
//! episode triggers a single attempt to unpause the port and re-check its
//! status; repeats during the same episode are only counted. Every other
//! error kind is reported but left alone.

use tracing::{info, warn};

use super::Connection;
use crate::transport::{ConnectionId, ReceiveErrorKind, SerialTransport, TransportError};

/// Host-side view consulted when a failure cannot be recovered
pub trait HostStatus: Send + Sync {
    /// Whether the host still considers itself connected or connecting
    fn wants_connection(&self) -> bool;
}

impl<F> HostStatus for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn wants_connection(&self) -> bool {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Start a recovery attempt
    Attempt,
    /// An attempt for this episode is already running
    AlreadyRecovering,
    /// No automated action for this kind
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    StillPaused,
    StatusUnavailable(TransportError),
}

/// Apply the policy for one receive error, updating the failure counter
pub fn classify(kind: ReceiveErrorKind, connection: &mut Connection) -> RecoveryDecision {
    match kind {
        ReceiveErrorKind::SystemError => {
            let first = connection.consecutive_failures == 0;
            connection.consecutive_failures = connection.consecutive_failures.saturating_add(1);
            if first {
                RecoveryDecision::Attempt
            } else {
                RecoveryDecision::AlreadyRecovering
            }
        }
        // TODO: device_lost could close the handle right away instead of waiting for the host
        _ => RecoveryDecision::Ignore,
    }
}

/// Unpause the port and check whether it stays unpaused
pub async fn attempt_recovery(transport: &dyn SerialTransport, id: ConnectionId) -> RecoveryOutcome {
    info!(%id, "Trying to recover, unpausing the bus");

    if let Err(e) = transport.set_paused(id, false).await {
        warn!(%id, error = %e, "Unpause request failed");
    }

    match transport.get_info(id).await {
        Ok(info) if !info.paused => RecoveryOutcome::Recovered,
        Ok(_) => RecoveryOutcome::StillPaused,
        Err(e) => RecoveryOutcome::StatusUnavailable(e),
    }
}
