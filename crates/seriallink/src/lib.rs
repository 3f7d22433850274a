//! seriallink - managed serial connections
//!
//! This crate owns one serial connection on behalf of a host application:
//! it opens the port, reboots the attached board with a DTR/RTS pulse train,
//! serialises outbound writes through a bounded queue, fans inbound data out
//! to listeners and tries to recover from transient receive errors.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConnectionManager                         │
//! │  connect / send / disconnect, LinkEvent broadcast           │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐ │
//! │  │ResetSequence│  │ OutputQueue │  │ ListenerRegistry    │ │
//! │  │ (DTR/RTS)   │  │ (bounded)   │  │ (data / errors)     │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘ │
//! │                          │                                  │
//! │                   ┌──────┴──────┐                           │
//! │                   │  recovery   │                           │
//! │                   │ (policy)    │                           │
//! │                   └──────┬──────┘                           │
//! │                          │                                  │
//! │                 ┌────────┴────────┐                         │
//! │                 │ SerialTransport │                         │
//! │                 │ (native/mock)   │                         │
//! │                 └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod listener;
pub mod queue;
pub mod transport;

pub use config::{LinkConfig, PortConfig, QueueConfig, RecoveryConfig, TransportConfig};
pub use connection::{ConnectionManager, ConnectionState, HostStatus, ResetPhase};
pub use error::{LinkError, LinkResult};
pub use events::LinkEvent;
pub use listener::{ListenerId, ListenerKind};
pub use queue::SendCallback;
pub use transport::{
    create_transport, ConnectionId, ConnectionInfo, ConnectionOptions, ControlSignals,
    DeviceInfo, ReceiveError, ReceiveErrorKind, ReceivedData, SendInfo, SerialTransport,
    SignalState, TransportError,
};

// Re-export port scanner (native feature only)
#[cfg(feature = "native")]
pub use transport::native::scanner;
