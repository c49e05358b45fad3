pub mod connection;
pub mod settings;

pub use connection::{ConnectionConfig, DataBits, FlowControl, Parity, StopBits, DEFAULT_BAUD_RATE};
pub use settings::ReadSettings;
