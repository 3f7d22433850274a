//! Mock transport adapter for testing

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use super::{
    ConnectionId, ConnectionInfo, ConnectionOptions, ControlSignals, DeviceInfo, ReceiveError,
    ReceiveErrorKind, ReceivedData, SendInfo, SerialTransport, SignalState, TransportError,
    TransportEvent,
};
use crate::config::MockConfig;

/// A call observed by the mock, in the order it was made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    ListDevices,
    Open { path: String },
    Close { id: ConnectionId },
    Write { id: ConnectionId, data: Vec<u8> },
    GetInfo { id: ConnectionId },
    SetPaused { id: ConnectionId, paused: bool },
    GetControlSignals { id: ConnectionId },
    SetControlSignals { id: ConnectionId, signals: ControlSignals },
}

/// Mock transport adapter for testing
pub struct MockTransport {
    config: MockConfig,
    next_id: AtomicU32,
    incoming_tx: broadcast::Sender<TransportEvent>,
    open: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
    calls: Mutex<Vec<TransportCall>>,
    signal_log: Mutex<Vec<(Instant, ControlSignals)>>,
    /// Paths whose open attempts fail
    failing_paths: RwLock<HashSet<String>>,
    writes_held: AtomicBool,
    write_gate: Notify,
    fail_writes: AtomicBool,
    fail_info: AtomicBool,
    /// Connections stay paused after `set_paused(false)`
    stuck_paused: AtomicBool,
    close_result: AtomicBool,
    input_signals: RwLock<SignalState>,
}

impl MockTransport {
    pub fn new(config: &MockConfig) -> Self {
        let (incoming_tx, _) = broadcast::channel(1024);
        Self {
            config: config.clone(),
            next_id: AtomicU32::new(1),
            incoming_tx,
            open: RwLock::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            signal_log: Mutex::new(Vec::new()),
            failing_paths: RwLock::new(HashSet::new()),
            writes_held: AtomicBool::new(false),
            write_gate: Notify::new(),
            fail_writes: AtomicBool::new(false),
            fail_info: AtomicBool::new(false),
            stuck_paused: AtomicBool::new(false),
            close_result: AtomicBool::new(true),
            input_signals: RwLock::new(SignalState::default()),
        }
    }

    /// Make every open of `path` fail
    pub fn fail_open(&self, path: &str) {
        self.failing_paths.write().insert(path.to_string());
    }

    /// Block writes until [`release_writes`](Self::release_writes) is called
    pub fn hold_writes(&self) {
        self.writes_held.store(true, Ordering::SeqCst);
    }

    pub fn release_writes(&self) {
        self.writes_held.store(false, Ordering::SeqCst);
        self.write_gate.notify_waiters();
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_info(&self, fail: bool) {
        self.fail_info.store(fail, Ordering::SeqCst);
    }

    pub fn set_stuck_paused(&self, stuck: bool) {
        self.stuck_paused.store(stuck, Ordering::SeqCst);
    }

    pub fn set_close_result(&self, result: bool) {
        self.close_result.store(result, Ordering::SeqCst);
    }

    pub fn set_input_signals(&self, signals: SignalState) {
        *self.input_signals.write() = signals;
    }

    /// Inject inbound bytes (simulates the device sending data)
    pub fn inject_data(&self, id: ConnectionId, data: impl Into<Bytes>) {
        let _ = self.incoming_tx.send(TransportEvent::Received(ReceivedData {
            id,
            data: data.into(),
        }));
    }

    /// Inject a receive error; like a real port, the connection becomes paused
    pub fn inject_error(&self, id: ConnectionId, kind: ReceiveErrorKind) {
        if let Some(info) = self.open.write().get_mut(&id) {
            info.paused = true;
        }
        let _ = self
            .incoming_tx
            .send(TransportEvent::ReceiveError(ReceiveError { id, kind }));
    }

    /// All calls made so far
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Payloads written, in wire order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Control signal commands with the (tokio) time they were issued
    pub fn signal_log(&self) -> Vec<(Instant, ControlSignals)> {
        self.signal_log.lock().clone()
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.open.read().contains_key(&id)
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    fn ensure_open(&self, id: ConnectionId) -> Result<(), TransportError> {
        if self.open.read().contains_key(&id) {
            Ok(())
        } else {
            Err(TransportError::UnknownConnection(id))
        }
    }

    async fn wait_for_write_gate(&self) {
        loop {
            let released = self.write_gate.notified();
            if !self.writes_held.load(Ordering::SeqCst) {
                return;
            }
            released.await;
        }
    }
}

#[async_trait]
impl SerialTransport for MockTransport {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        self.record(TransportCall::ListDevices);
        Ok(self
            .config
            .devices
            .iter()
            .map(DeviceInfo::from_path)
            .collect())
    }

    async fn open(
        &self,
        path: &str,
        options: &ConnectionOptions,
    ) -> Result<ConnectionInfo, TransportError> {
        self.record(TransportCall::Open {
            path: path.to_string(),
        });
        self.simulate_latency().await;

        if self.failing_paths.read().contains(path) {
            return Err(TransportError::ConnectionFailed(format!(
                "Mock transport: cannot open {}",
                path
            )));
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let info = ConnectionInfo {
            id,
            path: path.to_string(),
            bitrate: options.bitrate,
            paused: false,
            options: options.clone(),
        };
        self.open.write().insert(id, info.clone());
        tracing::debug!(%id, path, "Mock transport: opened");
        Ok(info)
    }

    async fn close(&self, id: ConnectionId) -> Result<bool, TransportError> {
        self.record(TransportCall::Close { id });
        self.simulate_latency().await;

        let known = self.open.write().remove(&id).is_some();
        Ok(known && self.close_result.load(Ordering::SeqCst))
    }

    async fn write(&self, id: ConnectionId, data: &[u8]) -> Result<SendInfo, TransportError> {
        self.record(TransportCall::Write {
            id,
            data: data.to_vec(),
        });
        self.wait_for_write_gate().await;
        self.simulate_latency().await;

        self.ensure_open(id)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed(
                "Mock transport: write rejected".to_string(),
            ));
        }

        tracing::debug!(%id, len = data.len(), "Mock transport: sent bytes");
        Ok(SendInfo {
            bytes_sent: data.len(),
        })
    }

    async fn get_info(&self, id: ConnectionId) -> Result<ConnectionInfo, TransportError> {
        self.record(TransportCall::GetInfo { id });
        self.simulate_latency().await;

        if self.fail_info.load(Ordering::SeqCst) {
            return Err(TransportError::ReceiveFailed(
                "Mock transport: status unavailable".to_string(),
            ));
        }
        self.open
            .read()
            .get(&id)
            .cloned()
            .ok_or(TransportError::UnknownConnection(id))
    }

    async fn set_paused(&self, id: ConnectionId, paused: bool) -> Result<(), TransportError> {
        self.record(TransportCall::SetPaused { id, paused });
        self.simulate_latency().await;

        let stuck = self.stuck_paused.load(Ordering::SeqCst);
        let mut open = self.open.write();
        let info = open
            .get_mut(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        info.paused = paused || stuck;
        Ok(())
    }

    async fn get_control_signals(&self, id: ConnectionId) -> Result<SignalState, TransportError> {
        self.record(TransportCall::GetControlSignals { id });
        self.simulate_latency().await;

        self.ensure_open(id)?;
        Ok(*self.input_signals.read())
    }

    async fn set_control_signals(
        &self,
        id: ConnectionId,
        signals: ControlSignals,
    ) -> Result<bool, TransportError> {
        self.record(TransportCall::SetControlSignals { id, signals });
        self.signal_log.lock().push((Instant::now(), signals));
        self.simulate_latency().await;

        self.ensure_open(id)?;
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.incoming_tx.subscribe()
    }
}
