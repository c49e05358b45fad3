use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::config::{ConnectionConfig, ReadSettings};
use crate::serial::stream::lock;
use crate::serial::{DeviceOpener, ReleaseReport, SerialConnection, SystemOpener};

use super::{ConnectionProvider, FactoryError, Result};

/// Resolves configuration strings to shared connections.
///
/// Connections are cached per port. Asking again with the same configuration
/// returns the cached instance; asking with a different configuration for a
/// port that is still open is refused rather than silently handing back a
/// connection with the wrong line settings.
pub struct ConnectionFactory {
    opener: Arc<dyn DeviceOpener>,
    settings: ReadSettings,
    provider: RwLock<Option<Arc<dyn ConnectionProvider>>>,
    connections: Mutex<HashMap<String, Arc<SerialConnection>>>,
}

impl ConnectionFactory {
    pub fn new() -> Self {
        Self::with_opener(Arc::new(SystemOpener))
    }

    pub fn with_opener(opener: Arc<dyn DeviceOpener>) -> Self {
        Self {
            opener,
            settings: ReadSettings::default(),
            provider: RwLock::new(None),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Read settings given to connections built by this factory.
    pub fn with_settings(mut self, settings: ReadSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn register_provider(&self, provider: Arc<dyn ConnectionProvider>) {
        log::info!("Registered connection provider {}", provider.name());
        *self.provider.write().unwrap_or_else(PoisonError::into_inner) = Some(provider);
    }

    pub fn unregister_provider(&self) -> Option<Arc<dyn ConnectionProvider>> {
        self.provider
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn current_provider(&self) -> Option<Arc<dyn ConnectionProvider>> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve a JSON configuration string to a connection.
    pub fn resolve(&self, config: &str) -> Result<Arc<SerialConnection>> {
        let config: ConnectionConfig = config.parse()?;
        self.resolve_config(config)
    }

    pub fn resolve_config(&self, config: ConnectionConfig) -> Result<Arc<SerialConnection>> {
        // Held across creation so two callers cannot open the same port twice
        let mut connections = lock(&self.connections);

        if let Some(existing) = connections.get(&config.port) {
            if existing.is_open() {
                if existing.config() == Some(&config) {
                    log::debug!("Reusing cached connection for {}", config.port);
                    return Ok(existing.clone());
                }
                return Err(FactoryError::PortInUse(config.port));
            }
            log::debug!("Dropping closed connection cached for {}", config.port);
            connections.remove(&config.port);
        }

        let mut connection = match self.current_provider() {
            Some(provider) => {
                log::info!(
                    "Registered connection provider ({}) found. Instantiating...",
                    provider.name()
                );
                provider.create()?
            }
            None => {
                log::info!("No registered connection provider found. Falling back to default...");
                SerialConnection::with_opener(self.opener.clone()).with_settings(self.settings)
            }
        };
        connection.configure(config.clone())?;

        let connection = Arc::new(connection);
        connections.insert(config.port, connection.clone());
        Ok(connection)
    }

    /// Ports with a cached connection, sorted.
    pub fn cached_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = lock(&self.connections).keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Remove a port from the cache and close its connection.
    pub fn release(&self, port: &str) -> Result<ReleaseReport> {
        let connection = lock(&self.connections)
            .remove(port)
            .ok_or_else(|| FactoryError::NotFound(port.to_string()))?;
        Ok(connection.close()?)
    }

    /// Close every cached connection. All of them are attempted; the first
    /// failure is returned.
    pub fn close_all(&self) -> Result<()> {
        let drained: Vec<(String, Arc<SerialConnection>)> =
            lock(&self.connections).drain().collect();

        let mut first_error = None;
        for (port, connection) in drained {
            match connection.close() {
                Ok(report) if !report.is_clean() => {
                    log::warn!(
                        "Closed {} with {} release failure(s)",
                        port,
                        report.failures.len()
                    );
                }
                Ok(_) => log::debug!("Closed {}", port),
                Err(e) => {
                    log::error!("Failed to close {}: {}", port, e);
                    first_error.get_or_insert(FactoryError::from(e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}
