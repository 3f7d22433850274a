//! Connection manager for a serial link

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::recovery::{self, HostStatus, RecoveryDecision, RecoveryOutcome};
use super::reset::{ResetPhase, ResetSequence};
use super::{Connection, ConnectionState};
use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::events::LinkEvent;
use crate::listener::{ListenerId, ListenerKind, ListenerRegistry};
use crate::queue::{OutputItem, OutputQueue, SendCallback};
use crate::transport::{
    create_transport, ConnectionId, ConnectionInfo, ConnectionOptions, ControlSignals, DeviceInfo,
    ReceiveError, ReceivedData, SendInfo, SerialTransport, SignalState, TransportError,
    TransportEvent,
};

/// Manages one serial connection: open with reset handshake, queued writes,
/// inbound fan-out and receive error recovery
///
/// Cloning is cheap and every clone drives the same connection. Methods that
/// spawn work (`connect`, `send`) must be called from within a tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn SerialTransport>,
    config: LinkConfig,
    connection: Mutex<Connection>,
    queue: Mutex<OutputQueue>,
    listeners: ListenerRegistry,
    reset: Mutex<Option<ResetSequence>>,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<LinkEvent>,
    host: RwLock<Option<Arc<dyn HostStatus>>>,
    last_connect: Mutex<Option<(String, ConnectionOptions)>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn SerialTransport>, config: LinkConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let queue = OutputQueue::new(config.queue.capacity);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                connection: Mutex::new(Connection::default()),
                queue: Mutex::new(queue),
                listeners: ListenerRegistry::new(),
                reset: Mutex::new(None),
                pump_handle: Mutex::new(None),
                events,
                host: RwLock::new(None),
                last_connect: Mutex::new(None),
            }),
        }
    }

    /// Build the transport named in `config` and a manager on top of it
    pub fn from_config(config: LinkConfig) -> LinkResult<Self> {
        let transport = create_transport(&config.transport)?;
        Ok(Self::new(transport, config))
    }

    /// Install the host hook consulted before requesting a reconnect
    pub fn with_host(self, host: impl HostStatus + 'static) -> Self {
        *self.inner.host.write() = Some(Arc::new(host));
        self
    }

    pub fn transport(&self) -> Arc<dyn SerialTransport> {
        self.inner.transport.clone()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Subscribe to link events
    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.lock().state
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.connection.lock().id
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.connection.lock().bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.connection.lock().bytes_received
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.connection.lock().consecutive_failures
    }

    /// Number of sends waiting, the one being written included
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.queue.lock().is_draining()
    }

    pub fn listener_count(&self, kind: ListenerKind) -> usize {
        self.inner.listeners.len(kind)
    }

    /// Paths of the ports the transport can open
    pub async fn get_devices(&self) -> LinkResult<Vec<String>> {
        let devices = self.list_devices().await?;
        Ok(devices.into_iter().map(|device| device.path).collect())
    }

    pub async fn list_devices(&self) -> LinkResult<Vec<DeviceInfo>> {
        Ok(self.inner.transport.list_devices().await?)
    }

    /// Open `path`, run the reset handshake and resolve once the link is ready
    ///
    /// A `disconnect` issued before the handshake completes resolves this
    /// call with [`LinkError::Cancelled`]; the connection never reaches
    /// `Connected` in that case.
    pub async fn connect(
        &self,
        path: &str,
        options: ConnectionOptions,
    ) -> LinkResult<ConnectionInfo> {
        let start_generation = {
            let mut conn = self.inner.connection.lock();
            match conn.state {
                ConnectionState::Disconnected | ConnectionState::FailedToOpen => {}
                state => return Err(LinkError::Busy(state)),
            }
            conn.state = ConnectionState::Connecting;
            conn.generation
        };
        *self.inner.last_connect.lock() = Some((path.to_string(), options.clone()));

        // Subscribe before opening so nothing the device sends right away is missed
        let events = self.inner.transport.subscribe();

        let info = match self.inner.transport.open(path, &options).await {
            Ok(info) => info,
            Err(e) => {
                {
                    let mut conn = self.inner.connection.lock();
                    if conn.generation == start_generation {
                        conn.state = ConnectionState::FailedToOpen;
                    }
                }
                warn!(path, error = %e, "Failed to open serial port");
                self.inner.emit(LinkEvent::OpenFailed {
                    path: path.to_string(),
                    reason: e.to_string(),
                });
                return Err(LinkError::OpenFailed {
                    path: path.to_string(),
                    source: e,
                });
            }
        };

        // Everything a disconnect tears down is attached under the same lock
        // that records the handle, so a concurrent disconnect either sees all
        // of it or none of it
        let ready_rx = {
            let mut conn = self.inner.connection.lock();
            if conn.generation != start_generation || conn.state != ConnectionState::Connecting {
                None
            } else {
                conn.open(info.id);
                let generation = conn.generation;

                self.attach_internal_listeners();
                self.start_pump(events, info.id);

                info!(id = %info.id, path, bitrate = info.bitrate, "Connection opened");
                self.inner.emit(LinkEvent::Opened {
                    id: info.id,
                    path: info.path.clone(),
                    bitrate: info.bitrate,
                });
                Some(self.start_reset(info.id, generation))
            }
        };
        let Some(ready_rx) = ready_rx else {
            // Disconnected while the open was in flight
            debug!(id = %info.id, "Connect cancelled during open, releasing handle");
            if let Err(e) = self.inner.transport.close(info.id).await {
                warn!(id = %info.id, error = %e, "Failed to release cancelled connection");
            }
            return Err(LinkError::Cancelled);
        };

        match ready_rx.await {
            Ok(()) => Ok(info),
            Err(_) => {
                debug!(id = %info.id, "Reset sequence cancelled before ready");
                Err(LinkError::Cancelled)
            }
        }
    }

    /// Tear the connection down; safe to call in any state and from any listener
    ///
    /// Resolves to the transport's close result, or `false` without touching
    /// the transport when no connection is held.
    pub async fn disconnect(&self) -> bool {
        let discarded = self.inner.queue.lock().clear();
        if discarded > 0 {
            debug!(discarded, "Discarded queued sends");
        }

        let id = {
            let mut conn = self.inner.connection.lock();
            conn.generation = conn.generation.wrapping_add(1);
            let id = conn.id.take();
            conn.state = match id {
                Some(_) => ConnectionState::Disconnecting,
                None if conn.state == ConnectionState::Connecting => ConnectionState::Disconnected,
                None => conn.state,
            };
            id
        };

        // After the generation bump: a connect racing with us has either
        // attached already or will see the bump and attach nothing
        let sequence = self.inner.reset.lock().take();
        if let Some(sequence) = sequence {
            sequence.cancel();
        }
        let detached = self.inner.listeners.detach_all();
        if let Some(handle) = self.inner.pump_handle.lock().take() {
            handle.abort();
        }
        if detached > 0 {
            debug!(detached, "Detached listeners");
        }

        let Some(id) = id else {
            return false;
        };

        let closed = match self.inner.transport.close(id).await {
            Ok(closed) => closed,
            Err(e) => {
                warn!(%id, error = %e, "Close request failed");
                false
            }
        };
        if closed {
            info!(%id, "Connection closed");
        } else {
            warn!(%id, "Failed to close connection");
            self.inner.emit(LinkEvent::CloseFailed { id });
        }

        let (bytes_sent, bytes_received) = {
            let mut conn = self.inner.connection.lock();
            let stats = (conn.bytes_sent, conn.bytes_received);
            conn.reset();
            stats
        };
        info!(%id, bytes_sent, bytes_received, "Connection statistics");
        self.inner.emit(LinkEvent::Closed {
            id,
            bytes_sent,
            bytes_received,
        });

        closed
    }

    /// Queue `payload` for transmission
    ///
    /// Writes go out one at a time in enqueue order. `callback` receives the
    /// transport's result; it is never called for an item dropped by
    /// overflow trimming or by `disconnect`.
    pub fn send(&self, payload: impl Into<Bytes>, callback: Option<SendCallback>) {
        let start = self
            .inner
            .queue
            .lock()
            .push(OutputItem::new(payload, callback));
        if start {
            let manager = self.clone();
            tokio::spawn(async move { manager.drain().await });
        }
    }

    /// Queue `payload` and wait for its write to complete
    pub async fn write(&self, payload: impl Into<Bytes>) -> LinkResult<SendInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(
            payload,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(LinkError::Dropped),
        }
    }

    /// Drop every pending send without running callbacks
    pub fn empty_output_buffer(&self) -> usize {
        self.inner.queue.lock().clear()
    }

    pub async fn get_info(&self) -> LinkResult<ConnectionInfo> {
        let id = self.current_id()?;
        Ok(self.inner.transport.get_info(id).await?)
    }

    pub async fn get_control_signals(&self) -> LinkResult<SignalState> {
        let id = self.current_id()?;
        Ok(self.inner.transport.get_control_signals(id).await?)
    }

    pub async fn set_control_signals(&self, signals: ControlSignals) -> LinkResult<bool> {
        let id = self.current_id()?;
        Ok(self.inner.transport.set_control_signals(id, signals).await?)
    }

    /// Register a listener for inbound data on the open connection
    pub fn add_data_listener(
        &self,
        listener: impl Fn(&ReceivedData) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.add_data(listener)
    }

    /// Register a listener for receive errors on the open connection
    pub fn add_error_listener(
        &self,
        listener: impl Fn(&ReceiveError) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.add_error(listener)
    }

    /// Remove a listener; returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.detach(id).is_some()
    }

    fn current_id(&self) -> LinkResult<ConnectionId> {
        self.inner.connection.lock().id.ok_or(LinkError::NotConnected)
    }

    fn attach_internal_listeners(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.listeners.add_data(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.record_received(event);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        self.inner.listeners.add_error(move |event| {
            if let Some(inner) = weak.upgrade() {
                ConnectionManager { inner }.on_receive_error(event);
            }
        });
    }

    /// Forward transport events for `id` to the listener registry
    fn start_pump(&self, mut events: broadcast::Receiver<TransportEvent>, id: ConnectionId) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.connection_id() == id => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        match event {
                            TransportEvent::Received(data) => {
                                inner.listeners.dispatch_data(&data);
                            }
                            TransportEvent::ReceiveError(err) => {
                                inner.listeners.dispatch_error(&err);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%id, skipped, "Inbound event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(%id, "Transport event channel closed");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.inner.pump_handle.lock().replace(handle) {
            previous.abort();
        }
    }

    fn start_reset(&self, id: ConnectionId, generation: u64) -> oneshot::Receiver<()> {
        let (ready_tx, ready_rx) = oneshot::channel();

        let on_failure = {
            let weak = Arc::downgrade(&self.inner);
            move |phase: ResetPhase, reason: String| {
                warn!(%id, ?phase, %reason, "Reset sequence control signal failed");
                if let Some(inner) = weak.upgrade() {
                    inner.emit(LinkEvent::ResetSignalFailed { id, phase, reason });
                }
            }
        };

        let on_ready = {
            let weak = Arc::downgrade(&self.inner);
            move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                {
                    let mut conn = inner.connection.lock();
                    if conn.generation != generation
                        || conn.state != ConnectionState::ResettingDevice
                    {
                        return;
                    }
                    conn.state = ConnectionState::Connected;
                }
                info!(%id, "Connection ready");
                inner.emit(LinkEvent::Ready { id });
                let _ = ready_tx.send(());
            }
        };

        let sequence =
            ResetSequence::start(self.inner.transport.clone(), id, on_failure, on_ready);
        if let Some(previous) = self.inner.reset.lock().replace(sequence) {
            previous.cancel();
        }
        ready_rx
    }

    /// Single-flight write loop; exactly one runs while the queue is draining
    async fn drain(self) {
        loop {
            let (payload, epoch) = {
                let queue = self.inner.queue.lock();
                match queue.head_payload() {
                    Some(payload) => (payload, queue.epoch()),
                    None => return,
                }
            };

            let id = self.inner.connection.lock().id;
            let result = match id {
                Some(id) => self.inner.transport.write(id, &payload).await,
                None => Err(TransportError::NotConnected),
            };

            let step = {
                let mut queue = self.inner.queue.lock();
                if queue.epoch() != epoch {
                    debug!("Write completed after the output buffer was emptied");
                    return;
                }
                if let Ok(info) = &result {
                    self.inner.connection.lock().bytes_sent += info.bytes_sent as u64;
                }
                queue.complete_head()
            };

            if step.dropped > 0 {
                warn!(dropped = step.dropped, "Send buffer overflowing, dropped entries");
                self.inner.emit(LinkEvent::QueueOverflow {
                    dropped: step.dropped,
                });
            }
            if let Err(e) = &result {
                warn!(error = %e, "Write failed");
            }
            if let Some(callback) = step.callback {
                callback(result);
            }
            if !step.more {
                return;
            }
        }
    }

    fn on_receive_error(&self, event: &ReceiveError) {
        warn!(id = %event.id, kind = %event.kind, "Receive error");
        self.inner.emit(LinkEvent::ReceiveError {
            id: event.id,
            kind: event.kind,
        });

        let (decision, failures, generation) = {
            let mut conn = self.inner.connection.lock();
            if conn.id != Some(event.id) {
                return;
            }
            let decision = recovery::classify(event.kind, &mut conn);
            (decision, conn.consecutive_failures, conn.generation)
        };

        match decision {
            RecoveryDecision::Attempt => {
                let manager = self.clone();
                let id = event.id;
                tokio::spawn(async move { manager.recover(id, generation).await });
            }
            RecoveryDecision::AlreadyRecovering => {
                debug!(id = %event.id, failures, "Recovery already in progress");
            }
            RecoveryDecision::Ignore => {
                debug!(id = %event.id, kind = %event.kind, "No automated recovery for this error");
            }
        }
    }

    async fn recover(&self, id: ConnectionId, generation: u64) {
        let reason = match recovery::attempt_recovery(self.inner.transport.as_ref(), id).await {
            RecoveryOutcome::Recovered => {
                let current = {
                    let mut conn = self.inner.connection.lock();
                    let current = conn.generation == generation;
                    if current {
                        conn.consecutive_failures = 0;
                    }
                    current
                };
                if current {
                    info!(%id, "Connection recovered from receive error");
                    self.inner.emit(LinkEvent::Recovered { id });
                }
                return;
            }
            RecoveryOutcome::StillPaused => "connection still paused".to_string(),
            RecoveryOutcome::StatusUnavailable(e) => format!("status query failed: {}", e),
        };

        let was_active = {
            let conn = self.inner.connection.lock();
            if conn.generation != generation {
                debug!(%id, "Connection changed during recovery, not escalating");
                return;
            }
            conn.is_active()
        };
        let host = self.inner.host.read().clone();
        let wants_reconnect = match host {
            Some(host) => host.wants_connection(),
            None => was_active,
        };

        error!(%id, %reason, "Unrecoverable failure of serial connection, disconnecting");
        self.inner.emit(LinkEvent::Unrecoverable { id, reason });
        self.disconnect().await;

        if !wants_reconnect {
            return;
        }
        let Some((path, options)) = self.inner.last_connect.lock().clone() else {
            return;
        };
        info!(path = %path, "Requesting reconnect");
        self.inner.emit(LinkEvent::ReconnectRequested {
            path: path.clone(),
            options: options.clone(),
        });

        if self.inner.config.recovery.auto_reconnect {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.connect(&path, options).await {
                    warn!(path = %path, error = %e, "Automatic reconnect failed");
                }
            });
        }
    }
}

impl Inner {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn record_received(&self, event: &ReceivedData) {
        let mut conn = self.connection.lock();
        if conn.id == Some(event.id) {
            conn.bytes_received += event.data.len() as u64;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.pump_handle.get_mut().take() {
            handle.abort();
        }
        if let Some(sequence) = self.reset.get_mut().take() {
            sequence.cancel();
        }
    }
}
