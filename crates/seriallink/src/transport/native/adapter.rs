//! Native serial adapter using the `serialport` crate

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serialport::{FlowControl, SerialPort};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::scanner;
use crate::config::NativeConfig;
use crate::transport::{
    ConnectionId, ConnectionInfo, ConnectionOptions, ControlSignals, DataBits, DeviceInfo,
    ParityBit, ReceiveError, ReceiveErrorKind, ReceivedData, SendInfo, SerialTransport,
    SignalState, StopBits, TransportError, TransportEvent,
};

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// One open port: the write/control half plus the reader thread's flags
struct PortSlot {
    info: ConnectionInfo,
    port: SharedPort,
    paused: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Native serial adapter
pub struct NativeSerialTransport {
    config: NativeConfig,
    next_id: AtomicU32,
    ports: RwLock<HashMap<ConnectionId, Arc<PortSlot>>>,
    incoming_tx: broadcast::Sender<TransportEvent>,
}

impl NativeSerialTransport {
    pub fn new(config: &NativeConfig) -> Self {
        let (incoming_tx, _) = broadcast::channel(1024);
        Self {
            config: config.clone(),
            next_id: AtomicU32::new(1),
            ports: RwLock::new(HashMap::new()),
            incoming_tx,
        }
    }

    fn slot(&self, id: ConnectionId) -> Result<Arc<PortSlot>, TransportError> {
        self.ports
            .read()
            .get(&id)
            .cloned()
            .ok_or(TransportError::UnknownConnection(id))
    }

    fn open_port(
        path: &str,
        options: &ConnectionOptions,
        poll: Duration,
    ) -> Result<Box<dyn SerialPort>, TransportError> {
        let data_bits = match options.data_bits {
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };
        let parity = match options.parity {
            ParityBit::No => serialport::Parity::None,
            ParityBit::Odd => serialport::Parity::Odd,
            ParityBit::Even => serialport::Parity::Even,
        };
        let stop_bits = match options.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        };
        let flow_control = if options.cts_flow_control {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };

        serialport::new(path, options.bitrate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .timeout(poll)
            .open()
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", path, e)))
    }

    /// Blocking read loop for one port, publishing into the shared channel
    fn start_reader(&self, slot: &PortSlot, mut reader: Box<dyn SerialPort>) {
        let id = slot.info.id;
        let incoming_tx = self.incoming_tx.clone();
        let paused = slot.paused.clone();
        let running = slot.running.clone();
        let poll = Duration::from_millis(self.config.read_poll_ms.max(1));
        let buffer_size = self.config.read_buffer_size.max(1);
        let receive_timeout = match slot.info.options.receive_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let handle = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; buffer_size];
            let mut last_activity = Instant::now();

            let emit_error = |kind: ReceiveErrorKind| {
                let _ = incoming_tx.send(TransportEvent::ReceiveError(ReceiveError { id, kind }));
            };

            while running.load(Ordering::SeqCst) {
                if paused.load(Ordering::SeqCst) {
                    std::thread::sleep(poll);
                    last_activity = Instant::now();
                    continue;
                }

                match reader.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        last_activity = Instant::now();
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        tracing::trace!(%id, len = n, "Serial data received");
                        let _ = incoming_tx.send(TransportEvent::Received(ReceivedData { id, data }));
                    }
                    Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let kind = match e.kind() {
                            ErrorKind::NotFound
                            | ErrorKind::BrokenPipe
                            | ErrorKind::NotConnected
                            | ErrorKind::UnexpectedEof => ReceiveErrorKind::DeviceLost,
                            _ => ReceiveErrorKind::SystemError,
                        };
                        tracing::error!(%id, ?e, %kind, "Serial read error, pausing");
                        paused.store(true, Ordering::SeqCst);
                        emit_error(kind);
                        continue;
                    }
                }

                if let Some(timeout) = receive_timeout {
                    if last_activity.elapsed() >= timeout {
                        emit_error(ReceiveErrorKind::Timeout);
                        last_activity = Instant::now();
                    }
                }
            }
            tracing::debug!(%id, "Serial reader stopped");
        });

        *slot.reader_handle.lock() = Some(handle);
    }

    /// Run a blocking operation against the port's write/control half
    async fn with_port<T, F>(&self, id: ConnectionId, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SerialPort) -> Result<T, TransportError> + Send + 'static,
    {
        let port = self.slot(id)?.port.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock();
            op(&mut **guard)
        })
        .await
        .map_err(|e| TransportError::Io(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl SerialTransport for NativeSerialTransport {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        scanner::scan_ports().await
    }

    async fn open(
        &self,
        path: &str,
        options: &ConnectionOptions,
    ) -> Result<ConnectionInfo, TransportError> {
        let poll = Duration::from_millis(self.config.read_poll_ms.max(1));
        let (port, reader) = {
            let path = path.to_string();
            let options = options.clone();
            tokio::task::spawn_blocking(move || {
                let port = Self::open_port(&path, &options, poll)?;
                let reader = port.try_clone().map_err(|e| {
                    TransportError::ConnectionFailed(format!("Failed to clone port handle: {}", e))
                })?;
                Ok::<_, TransportError>((port, reader))
            })
            .await
            .map_err(|e| TransportError::Io(format!("Task join error: {}", e)))??
        };

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let info = ConnectionInfo {
            id,
            path: path.to_string(),
            bitrate: options.bitrate,
            paused: false,
            options: options.clone(),
        };
        let slot = Arc::new(PortSlot {
            info: info.clone(),
            port: Arc::new(Mutex::new(port)),
            paused: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(true)),
            reader_handle: Mutex::new(None),
        });

        self.start_reader(&slot, reader);
        self.ports.write().insert(id, slot);

        tracing::debug!(%id, path, bitrate = options.bitrate, "Serial port opened");
        Ok(info)
    }

    async fn close(&self, id: ConnectionId) -> Result<bool, TransportError> {
        let Some(slot) = self.ports.write().remove(&id) else {
            return Ok(false);
        };

        slot.running.store(false, Ordering::SeqCst);
        let handle = slot.reader_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(%id, ?e, "Serial reader did not shut down cleanly");
            }
        }
        Ok(true)
    }

    async fn write(&self, id: ConnectionId, data: &[u8]) -> Result<SendInfo, TransportError> {
        let send_timeout = self.slot(id)?.info.options.send_timeout_ms;
        let data = data.to_vec();

        let write = self.with_port(id, move |port| {
            port.write_all(&data)
                .and_then(|_| port.flush())
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            Ok(SendInfo {
                bytes_sent: data.len(),
            })
        });

        if send_timeout == 0 {
            return write.await;
        }
        tokio::time::timeout(Duration::from_millis(send_timeout), write)
            .await
            .map_err(|_| TransportError::Timeout(format!("Write exceeded {} ms", send_timeout)))?
    }

    async fn get_info(&self, id: ConnectionId) -> Result<ConnectionInfo, TransportError> {
        let slot = self.slot(id)?;
        let mut info = slot.info.clone();
        info.paused = slot.paused.load(Ordering::SeqCst);
        Ok(info)
    }

    async fn set_paused(&self, id: ConnectionId, paused: bool) -> Result<(), TransportError> {
        self.slot(id)?.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }

    async fn get_control_signals(&self, id: ConnectionId) -> Result<SignalState, TransportError> {
        self.with_port(id, |port| {
            let map = |e: serialport::Error| TransportError::Io(e.to_string());
            Ok(SignalState {
                dcd: port.read_carrier_detect().map_err(map)?,
                cts: port.read_clear_to_send().map_err(map)?,
                ri: port.read_ring_indicator().map_err(map)?,
                dsr: port.read_data_set_ready().map_err(map)?,
            })
        })
        .await
    }

    async fn set_control_signals(
        &self,
        id: ConnectionId,
        signals: ControlSignals,
    ) -> Result<bool, TransportError> {
        self.with_port(id, move |port| {
            let map = |e: serialport::Error| TransportError::Io(e.to_string());
            port.write_data_terminal_ready(signals.dtr).map_err(map)?;
            port.write_request_to_send(signals.rts).map_err(map)?;
            Ok(true)
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.incoming_tx.subscribe()
    }
}

impl Drop for NativeSerialTransport {
    fn drop(&mut self) {
        for slot in self.ports.get_mut().values() {
            slot.running.store(false, Ordering::SeqCst);
        }
    }
}
