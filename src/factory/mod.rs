pub mod registry;

pub use registry::ConnectionFactory;

use crate::serial::SerialConnection;

/// Externally registered source of connection instances.
///
/// When one is registered the factory asks it for a connection instead of
/// building the default `serialport`-backed one, then configures it.
pub trait ConnectionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self) -> crate::serial::Result<SerialConnection>;
}

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("Port {0} is already open with a different configuration")]
    PortInUse(String),

    #[error("No connection cached for port {0}")]
    NotFound(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, FactoryError>;
