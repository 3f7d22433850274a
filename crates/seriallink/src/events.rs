//! Link events published to the host application
//!
//! Diagnostics that are not returned to a specific caller (failed opens,
//! receive errors, recovery outcomes, overflow drops, close statistics) are
//! broadcast as [`LinkEvent`]s alongside the corresponding `tracing` record.

use serde::Serialize;

use crate::connection::ResetPhase;
use crate::transport::{ConnectionId, ConnectionOptions, ReceiveErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LinkEvent {
    /// The transport yielded a handle; the reset sequence starts next
    Opened {
        id: ConnectionId,
        path: String,
        bitrate: u32,
    },
    OpenFailed {
        path: String,
        reason: String,
    },
    /// A control-signal command of the reset sequence was not acknowledged
    ResetSignalFailed {
        id: ConnectionId,
        phase: ResetPhase,
        reason: String,
    },
    /// Reset sequence finished and the connection is usable
    Ready {
        id: ConnectionId,
    },
    ReceiveError {
        id: ConnectionId,
        kind: ReceiveErrorKind,
    },
    Recovered {
        id: ConnectionId,
    },
    Unrecoverable {
        id: ConnectionId,
        reason: String,
    },
    /// The host should re-initiate connect with these parameters
    ReconnectRequested {
        path: String,
        options: ConnectionOptions,
    },
    QueueOverflow {
        dropped: usize,
    },
    CloseFailed {
        id: ConnectionId,
    },
    Closed {
        id: ConnectionId,
        bytes_sent: u64,
        bytes_received: u64,
    },
}
