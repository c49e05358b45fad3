#![allow(dead_code)]

use std::sync::Arc;

use uart_link_lib::serial::ScriptedDevice;
use uart_link_lib::{ConnectionConfig, SerialConnection};

pub const PORT: &str = "/dev/ttyTEST0";

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::new(PORT, 115200)
}

/// A connection configured against `device`.
pub fn connect(device: &ScriptedDevice) -> SerialConnection {
    let mut connection = SerialConnection::with_opener(Arc::new(device.clone()));
    connection.configure(test_config()).expect("configure scripted device");
    connection
}
