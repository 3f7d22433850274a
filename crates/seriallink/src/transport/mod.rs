//! Transport layer for serial links
//!
//! This module provides transport adapters for talking to byte-stream devices:
//! - Native adapter backed by the `serialport` crate
//! - Mock adapter for testing
//!
//! # Example
//!
//! ```ignore
//! use seriallink::transport::{create_transport, SerialTransport};
//! use seriallink::config::TransportConfig;
//!
//! let transport = create_transport(&TransportConfig::default())?;
//! let devices = transport.list_devices().await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

#[cfg(feature = "native")]
pub mod native;

pub use adapter::{
    ConnectionId, ConnectionInfo, ConnectionOptions, ControlSignals, DataBits, DeviceInfo,
    ParityBit, ReceiveError, ReceiveErrorKind, ReceivedData, SendInfo, SerialTransport,
    SignalState, StopBits, TransportEvent,
};
pub use error::TransportError;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a transport adapter based on configuration
pub fn create_transport(
    config: &TransportConfig,
) -> Result<Arc<dyn SerialTransport>, TransportError> {
    match config {
        #[cfg(feature = "native")]
        TransportConfig::Native(cfg) => Ok(Arc::new(native::NativeSerialTransport::new(cfg))),
        #[cfg(not(feature = "native"))]
        TransportConfig::Native(_) => Err(TransportError::Unsupported(
            "Native serial ports require the 'native' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => Ok(Arc::new(mock::MockTransport::new(cfg))),
    }
}
