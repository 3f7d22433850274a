//! Listener registry

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::transport::{ReceiveError, ReceivedData};

pub type DataListener = Arc<dyn Fn(&ReceivedData) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&ReceiveError) + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Data,
    Error,
}

/// Registered inbound listeners, dispatched in registration order
#[derive(Default)]
pub struct ListenerRegistry {
    data: RwLock<Vec<(ListenerId, DataListener)>>,
    error: RwLock<Vec<(ListenerId, ErrorListener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a data listener under `id`; returns false if `id` is already attached
    pub fn attach_data(&self, id: ListenerId, listener: DataListener) -> bool {
        let mut data = self.data.write();
        if data.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        data.push((id, listener));
        true
    }

    /// Attach an error listener under `id`; returns false if `id` is already attached
    pub fn attach_error(&self, id: ListenerId, listener: ErrorListener) -> bool {
        let mut error = self.error.write();
        if error.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        error.push((id, listener));
        true
    }

    /// Register a data listener under a fresh id
    pub fn add_data(&self, listener: impl Fn(&ReceivedData) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId::next();
        self.attach_data(id, Arc::new(listener));
        id
    }

    /// Register an error listener under a fresh id
    pub fn add_error(
        &self,
        listener: impl Fn(&ReceiveError) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId::next();
        self.attach_error(id, Arc::new(listener));
        id
    }

    /// Detach a listener of either kind; returns the kind it was registered as
    pub fn detach(&self, id: ListenerId) -> Option<ListenerKind> {
        {
            let mut data = self.data.write();
            if let Some(pos) = data.iter().position(|(existing, _)| *existing == id) {
                data.remove(pos);
                return Some(ListenerKind::Data);
            }
        }
        let mut error = self.error.write();
        let pos = error.iter().position(|(existing, _)| *existing == id)?;
        error.remove(pos);
        Some(ListenerKind::Error)
    }

    /// Detach every listener; returns how many were removed
    pub fn detach_all(&self) -> usize {
        let data = std::mem::take(&mut *self.data.write()).len();
        let error = std::mem::take(&mut *self.error.write()).len();
        data + error
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.data.read().iter().any(|(existing, _)| *existing == id)
            || self.error.read().iter().any(|(existing, _)| *existing == id)
    }

    pub fn len(&self, kind: ListenerKind) -> usize {
        match kind {
            ListenerKind::Data => self.data.read().len(),
            ListenerKind::Error => self.error.read().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty() && self.error.read().is_empty()
    }

    /// Deliver inbound data to every data listener
    ///
    /// The listener list is snapshotted first, so listeners may attach or
    /// detach (including themselves) while being called.
    pub fn dispatch_data(&self, event: &ReceivedData) -> usize {
        let listeners: Vec<DataListener> = self
            .data
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }

    /// Deliver a receive error to every error listener
    pub fn dispatch_error(&self, event: &ReceiveError) -> usize {
        let listeners: Vec<ErrorListener> = self
            .error
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }
}
