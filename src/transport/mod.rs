//! Byte transports to the robot.
//!
//! A transport moves raw bytes and nothing more. It never interprets frames and
//! is only ever driven by the dispatcher, one call at a time.

pub mod serial;
pub mod sim;

pub use serial::{SerialSettings, SerialTransport};
pub use sim::{SimConfig, SimRobot, SimTransport};

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub trait Transport: Send + Sized + 'static {
    type Config: Clone + Send + Sync + 'static;

    /// Acquires the device exclusively. A second open of the same device must fail
    /// while the first handle is alive.
    fn open(config: &Self::Config) -> impl Future<Output = Result<Self, TransportError>> + Send;

    fn write(
        &mut self,
        bytes: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Reads exactly `len` bytes or fails with `Timeout`.
    fn read(
        &mut self,
        len: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Drops any buffered input so the next read starts on a frame boundary.
    fn discard_input(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Switches the host side of the link after a Baud command went out.
    fn set_baud_rate(
        &mut self,
        _bits_per_second: u32,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        async { Ok(()) }
    }

    /// Releases the device. Further calls fail with `IoFault`.
    fn close(&mut self);

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum TransportError {
    #[error("device not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("timed out")]
    Timeout,
    #[error("I/O fault")]
    IoFault,
}

impl TransportError {
    /// Timeouts and I/O faults may clear on their own; a missing device or
    /// missing permissions will not.
    pub fn is_retryable(self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::IoFault)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TransportError::NotFound,
            std::io::ErrorKind::PermissionDenied => TransportError::PermissionDenied,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => TransportError::Timeout,
            _ => TransportError::IoFault,
        }
    }
}
