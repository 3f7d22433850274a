//! Transport adapter trait and types

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::TransportError;

/// Opaque handle to an open port, assigned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataBits {
    Seven,
    #[default]
    Eight,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityBit {
    #[default]
    No,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

/// Options used when opening a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Baud rate in bits per second
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default)]
    pub data_bits: DataBits,
    #[serde(default)]
    pub parity: ParityBit,
    #[serde(default)]
    pub stop_bits: StopBits,
    /// Hardware (RTS/CTS) flow control
    #[serde(default)]
    pub cts_flow_control: bool,
    /// Inactivity before a `timeout` receive error is raised (0 disables)
    #[serde(default)]
    pub receive_timeout_ms: u64,
    /// Upper bound for a single write (0 disables)
    #[serde(default)]
    pub send_timeout_ms: u64,
    /// Application-defined label attached to the connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_bitrate() -> u32 {
    9600
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            data_bits: DataBits::default(),
            parity: ParityBit::default(),
            stop_bits: StopBits::default(),
            cts_flow_control: false,
            receive_timeout_ms: 0,
            send_timeout_ms: 0,
            name: None,
        }
    }
}

impl ConnectionOptions {
    pub fn with_bitrate(bitrate: u32) -> Self {
        Self {
            bitrate,
            ..Self::default()
        }
    }
}

/// Result of a successful open, also returned by status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub path: String,
    pub bitrate: u32,
    /// Set by the transport after a receive error until explicitly resumed
    pub paused: bool,
    pub options: ConnectionOptions,
}

/// Output control lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignals {
    pub dtr: bool,
    pub rts: bool,
}

impl ControlSignals {
    pub const ASSERTED: Self = Self {
        dtr: true,
        rts: true,
    };
    pub const DEASSERTED: Self = Self {
        dtr: false,
        rts: false,
    };
}

/// Input status lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalState {
    pub dcd: bool,
    pub cts: bool,
    pub ri: bool,
    pub dsr: bool,
}

/// Completion report of a single write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendInfo {
    pub bytes_sent: usize,
}

/// A port discovered by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl DeviceInfo {
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            vendor_id: None,
            product_id: None,
            display_name: None,
        }
    }
}

/// Reason attached to a receive error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveErrorKind {
    Disconnected,
    Timeout,
    DeviceLost,
    SystemError,
    Break,
    FrameError,
    Overrun,
    BufferOverflow,
    ParityError,
}

impl fmt::Display for ReceiveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReceiveErrorKind::Disconnected => "disconnected",
            ReceiveErrorKind::Timeout => "timeout",
            ReceiveErrorKind::DeviceLost => "device_lost",
            ReceiveErrorKind::SystemError => "system_error",
            ReceiveErrorKind::Break => "break",
            ReceiveErrorKind::FrameError => "frame_error",
            ReceiveErrorKind::Overrun => "overrun",
            ReceiveErrorKind::BufferOverflow => "buffer_overflow",
            ReceiveErrorKind::ParityError => "parity_error",
        };
        f.write_str(name)
    }
}

/// Inbound bytes on an open connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedData {
    pub id: ConnectionId,
    pub data: Bytes,
}

/// Inbound error on an open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveError {
    pub id: ConnectionId,
    pub kind: ReceiveErrorKind,
}

/// Event stream emitted by a transport, in the order the port produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Received(ReceivedData),
    ReceiveError(ReceiveError),
}

impl TransportEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            TransportEvent::Received(data) => data.id,
            TransportEvent::ReceiveError(err) => err.id,
        }
    }
}

/// Byte-stream device abstraction used by the connection manager
///
/// Every operation is keyed by the [`ConnectionId`] handed out by `open`.
/// Inbound traffic for all open connections is delivered through the
/// broadcast channel returned by `subscribe`.
#[async_trait]
pub trait SerialTransport: Send + Sync {
    /// Enumerate ports available for `open`
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Open a port
    async fn open(
        &self,
        path: &str,
        options: &ConnectionOptions,
    ) -> Result<ConnectionInfo, TransportError>;

    /// Close a port; `Ok(false)` when the transport refused or did not know the id
    async fn close(&self, id: ConnectionId) -> Result<bool, TransportError>;

    /// Write one buffer to the port
    async fn write(&self, id: ConnectionId, data: &[u8]) -> Result<SendInfo, TransportError>;

    /// Query current connection status
    async fn get_info(&self, id: ConnectionId) -> Result<ConnectionInfo, TransportError>;

    /// Pause or resume delivery of inbound data
    async fn set_paused(&self, id: ConnectionId, paused: bool) -> Result<(), TransportError>;

    /// Read the input status lines
    async fn get_control_signals(&self, id: ConnectionId) -> Result<SignalState, TransportError>;

    /// Drive the output control lines
    async fn set_control_signals(
        &self,
        id: ConnectionId,
        signals: ControlSignals,
    ) -> Result<bool, TransportError>;

    /// Subscribe to inbound data and receive errors
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
