pub mod commands;
pub mod config;
pub mod factory;
pub mod serial;

use clap::Parser;

pub use config::{ConnectionConfig, ReadSettings};
pub use factory::{ConnectionFactory, ConnectionProvider};
pub use serial::{SerialConnection, SerialError};

/// Entry point of the `uart-link` binary.
pub fn run() -> anyhow::Result<()> {
    let cli = commands::Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    commands::execute(cli)
}
