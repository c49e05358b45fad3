use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::config::{ConnectionConfig, ReadSettings, DEFAULT_BAUD_RATE};
use crate::serial::{self, SerialConnection};

/// Talk to a serial device from the command line
#[derive(Parser, Debug)]
#[command(name = "uart-link", version, long_about = None)]
pub struct Cli {
    /// JSON file with `connection` and optional `read` sections
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Serial port, e.g. /dev/ttyUSB0 (overrides the config file)
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    /// Baud rate used with --port
    #[arg(short, long, global = true)]
    pub baud: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// List serial ports present on this host
    Ports,
    /// Send bytes without waiting for a reply
    Send(Payload),
    /// Send bytes and print the reply
    Command {
        #[command(flatten)]
        payload: Payload,
        /// How long to wait for the first reply byte
        #[arg(short, long, default_value_t = 1000)]
        timeout_ms: u64,
        /// End the reply after this much silence instead of a single drain
        #[arg(short, long)]
        demark_ms: Option<u64>,
    },
    /// Drain and print anything waiting in the input buffer
    Flush,
}

#[derive(Args, Debug)]
pub struct Payload {
    /// Hex bytes, e.g. "01 02 ff" or "0102ff"
    pub hex: String,
}

/// Layout of the `--config` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub read: ReadSettings,
}

pub fn parse_hex(input: &str) -> anyhow::Result<Vec<u8>> {
    let cleaned: String = input
        .split_whitespace()
        .map(|part| part.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    if cleaned.is_empty() {
        bail!("payload is empty");
    }
    hex::decode(&cleaned).with_context(|| format!("invalid hex payload '{}'", input))
}

fn load_config(path: &Path) -> anyhow::Result<CliConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Merge the config file with command line overrides.
pub fn resolve_config(cli: &Cli) -> anyhow::Result<CliConfig> {
    let mut resolved = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            let Some(port) = &cli.port else {
                bail!("either --config or --port is required");
            };
            CliConfig {
                connection: ConnectionConfig::new(port.clone(), DEFAULT_BAUD_RATE),
                read: ReadSettings::default(),
            }
        }
    };

    if let Some(port) = &cli.port {
        resolved.connection.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        resolved.connection.baud_rate = baud;
    }
    resolved.connection.validate()?;
    Ok(resolved)
}

fn print_response(response: Option<Vec<u8>>) {
    match response {
        Some(bytes) => println!("{}", hex::encode_upper(bytes)),
        None => println!("(no response)"),
    }
}

pub fn execute(cli: Cli) -> anyhow::Result<()> {
    if let Action::Ports = cli.command {
        for port in serial::discover_ports()? {
            match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => println!("{}\t{:04x}:{:04x}", port.port_name, vid, pid),
                _ => println!("{}", port.port_name),
            }
        }
        return Ok(());
    }

    let resolved = resolve_config(&cli)?;
    let mut connection = SerialConnection::new().with_settings(resolved.read);
    connection
        .configure(resolved.connection.clone())
        .with_context(|| format!("could not open {}", resolved.connection.port))?;

    match cli.command {
        Action::Ports => {}
        Action::Send(payload) => {
            let bytes = parse_hex(&payload.hex)?;
            connection.send_message(Some(bytes.as_slice()))?;
            log::info!("Sent {} byte(s)", bytes.len());
        }
        Action::Command {
            payload,
            timeout_ms,
            demark_ms,
        } => {
            let bytes = parse_hex(&payload.hex)?;
            let timeout = Duration::from_millis(timeout_ms);
            let response = match demark_ms {
                Some(demark) => connection.send_command_demarcated(
                    Some(bytes.as_slice()),
                    timeout,
                    Duration::from_millis(demark),
                )?,
                None => connection.send_command(Some(bytes.as_slice()), timeout)?,
            };
            print_response(response);
        }
        Action::Flush => print_response(connection.flush_buffer()?),
    }

    let report = connection.close()?;
    if !report.is_clean() {
        log::warn!("{} stream(s) failed to release cleanly", report.failures.len());
    }
    Ok(())
}
