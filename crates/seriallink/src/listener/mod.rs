//! Inbound listener fan-out
//!
//! One authoritative registry of data and error listeners per manager.
//! Listeners are keyed by a [`ListenerId`] so attach and detach are
//! idempotent regardless of closure identity.

mod registry;

pub use registry::{DataListener, ErrorListener, ListenerId, ListenerKind, ListenerRegistry};
