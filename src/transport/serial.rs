//! Serial port transport (8N1, no flow control).
//!
//! `serialport` is blocking, so every call hands the port to a blocking task and
//! takes it back when the call finishes.

use super::{Transport, TransportError};
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

const OPEN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub device: String,
    pub baud_rate: u32,
}

pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    device: String,
}

impl SerialTransport {
    async fn with_port<R, F>(&mut self, op: F) -> Result<R, TransportError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Box<dyn SerialPort>) -> Result<R, TransportError> + Send + 'static,
    {
        let mut port = self.port.take().ok_or(TransportError::IoFault)?;
        let joined = tokio::task::spawn_blocking(move || {
            let result = op(&mut port);
            (port, result)
        })
        .await;

        match joined {
            Ok((port, result)) => {
                self.port = Some(port);
                result
            }
            Err(err) => {
                // The port went down with the blocking task
                warn!("Serial task for {} failed: {}", self.device, err);
                Err(TransportError::IoFault)
            }
        }
    }
}

fn map_serial_error(err: &serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => TransportError::NotFound,
        serialport::ErrorKind::Io(kind) => std::io::Error::from(kind).into(),
        _ => TransportError::IoFault,
    }
}

impl Transport for SerialTransport {
    type Config = SerialSettings;

    async fn open(config: &SerialSettings) -> Result<Self, TransportError> {
        let settings = config.clone();
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(&settings.device, settings.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(OPEN_TIMEOUT)
                .open()
        })
        .await
        .map_err(|_| TransportError::IoFault)?;

        // Unix ports are opened with TIOCEXCL, so a second open fails here
        let port = opened.map_err(|err| {
            warn!("Failed to open {}: {}", config.device, err);
            map_serial_error(&err)
        })?;

        info!("Opened {} at {} baud", config.device, config.baud_rate);
        Ok(Self {
            port: Some(port),
            device: config.device.clone(),
        })
    }

    async fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let frame = bytes.to_vec();
        self.with_port(move |port| {
            port.set_timeout(timeout).map_err(|e| map_serial_error(&e))?;
            port.write_all(&frame)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn read(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.with_port(move |port| {
            port.set_timeout(timeout).map_err(|e| map_serial_error(&e))?;
            let mut buf = vec![0u8; len];
            port.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.with_port(|port| port.clear(ClearBuffer::Input).map_err(|e| map_serial_error(&e)))
            .await
    }

    async fn set_baud_rate(&mut self, bits_per_second: u32) -> Result<(), TransportError> {
        debug!("Switching {} to {} baud", self.device, bits_per_second);
        self.with_port(move |port| {
            port.set_baud_rate(bits_per_second)
                .map_err(|e| map_serial_error(&e))
        })
        .await
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed {}", self.device);
        }
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.device)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
