//! Serial port enumeration
//!
//! Lists the ports the operating system exposes and, for USB adapters,
//! attaches vendor/product identification so hosts can pick the right one.

use serialport::{SerialPortInfo, SerialPortType};
use tracing::debug;

use crate::transport::{DeviceInfo, TransportError};

/// Enumerate serial ports on a blocking thread
pub async fn scan_ports() -> Result<Vec<DeviceInfo>, TransportError> {
    let ports = tokio::task::spawn_blocking(serialport::available_ports)
        .await
        .map_err(|e| TransportError::Io(format!("Scan task join error: {}", e)))?
        .map_err(|e| TransportError::Io(format!("Port enumeration failed: {}", e)))?;

    let devices: Vec<DeviceInfo> = ports.into_iter().map(device_from_port).collect();
    debug!(count = devices.len(), "Enumerated serial ports");
    Ok(devices)
}

fn device_from_port(port: SerialPortInfo) -> DeviceInfo {
    match port.port_type {
        SerialPortType::UsbPort(usb) => DeviceInfo {
            path: port.port_name,
            vendor_id: Some(usb.vid),
            product_id: Some(usb.pid),
            display_name: usb.product.or(usb.manufacturer),
        },
        _ => DeviceInfo::from_path(port.port_name),
    }
}
