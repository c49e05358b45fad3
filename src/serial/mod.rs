pub mod device;
pub mod interface;
pub mod metrics;
pub mod reader;
pub mod scripted;
pub mod stream;

pub use device::{ByteSink, ByteSource, DeviceHandle, DeviceOpener, SerialPortDevice, SystemOpener};
pub use interface::{ReleaseReport, SerialConnection};
pub use metrics::ConnectionMetrics;
pub use scripted::{ScriptedDevice, SinkEvent};
pub use stream::{InputStream, OutputStream};

use serde::{Deserialize, Serialize};

/// Port discovered on the host, as reported by `serialport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Serial {0} is null")]
    MissingPayload(&'static str),

    #[error("Invalid connection configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection failed for {config}: {source}")]
    ConnectionFailed {
        config: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Failed to release {resource}: {source}")]
    ReleaseFailed {
        resource: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// List the serial ports currently present on the host.
pub fn discover_ports() -> Result<Vec<SerialDeviceInfo>> {
    let ports = serialport::available_ports()?;
    let devices = ports
        .into_iter()
        .map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                port_name: port.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                serial_number: usb_info.serial_number,
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => SerialDeviceInfo {
                port_name: port.port_name,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        })
        .collect();

    Ok(devices)
}

/// Render bytes for debug logs, e.g. `0x01 0xab`.
pub(crate) fn bytes_as_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("0x{}", hex::encode([*b])))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_as_string() {
        assert_eq!(bytes_as_string(&[0x01, 0xAB, 0x00]), "0x01 0xab 0x00");
        assert_eq!(bytes_as_string(&[]), "");
    }
}
