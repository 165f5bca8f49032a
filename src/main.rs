//! C6 supervisor: opens the RTU bus once, shares it between the Modbus TCP and
//! HTTP/JSON listeners, and tears both down on interrupt.

mod client;
mod codec;
mod config;
mod error;
mod http_server;
mod tcp_server;
mod transceiver;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use client::Client;
use config::Config;
use transceiver::Transceiver;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Config::parse();
    log::info!("opening serial port {} at {} bps", config.serial_path, config.baud_rate);

    let port = open_serial_port(&config.serial_path, config.baud_rate, Duration::from_millis(50))
        .with_context(|| format!("failed to open serial port {}", config.serial_path))?;

    let transceiver = Arc::new(Transceiver::new(port, config.transceiver_config()));
    let client = Arc::new(Client::new(transceiver));

    let tcp_listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
        .await
        .with_context(|| format!("failed to bind Modbus TCP port {}", config.tcp_port))?;
    let http_listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed to bind HTTP port {}", config.http_port))?;

    log::info!("Modbus TCP server listening on port {}", config.tcp_port);
    log::info!("HTTP/JSON server listening on port {}", config.http_port);

    let tcp_task = tokio::spawn(tcp_server::serve(tcp_listener, client.clone()));
    let http_task = tokio::spawn(http_server::serve(http_listener, client.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt, shutting down both listeners");
        }
        result = tcp_task => {
            if let Err(e) = result {
                log::error!("Modbus TCP server task failed: {e}");
            }
        }
        result = http_task => {
            if let Err(e) = result {
                log::error!("HTTP server task failed: {e}");
            }
        }
    }

    Ok(())
}

/// On Unix, opens the native handle and marks it exclusive so a second instance of
/// this gateway cannot silently steal the same bus out from under this one.
fn open_serial_port(path: &str, baud_rate: u32, timeout: Duration) -> serialport::Result<Box<dyn serialport::SerialPort>> {
    let builder = serialport::new(path, baud_rate).timeout(timeout);

    #[cfg(unix)]
    {
        use serialport::TTYPort;
        let mut handle: TTYPort = builder.open_native()?;
        handle.set_exclusive(true)?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder.open()
    }
}
