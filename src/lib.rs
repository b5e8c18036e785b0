//! # oibus
//!
//! Communication core between a block-programming front end and an iRobot Roomba
//! (or Create 2) speaking the Open Interface over a serial link.
//!
//! ## Features
//!
//! - **Wire codec**: every OI command frame and sensor packet, big-endian and length-checked
//! - **Mode tracking**: Off/Passive/Safe/Full with a legality table checked before each write
//! - **Serialized dispatch**: one task owns the port, enforces spacing, retries transient faults
//! - **Telemetry**: subscription-driven polling with a latest-value cache and staleness flags
//! - **Bridge**: JSON request/response adapter for the Scratch extension
//!
//! ## Quick Start
//!
//! ```no_run
//! use oibus::codec::Command;
//! use oibus::config::TelemetryConfig;
//! use oibus::connection::Connection;
//! use oibus::dispatcher::DispatchSettings;
//! use oibus::mode::RobotMode;
//! use oibus::transport::{SimConfig, SimTransport};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = Connection::open::<SimTransport>(
//!     SimConfig::new(),
//!     DispatchSettings::default(),
//!     &TelemetryConfig::default(),
//! )
//! .await?;
//!
//! connection.execute(Command::SetMode(RobotMode::Safe)).await?;
//! connection.execute(Command::direct_drive(200, 200)).await?;
//! connection.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`codec`] - Command encoding and sensor packet decoding
//! - [`mode`] - Robot mode state machine and command legality
//! - [`transport`] - Serial and simulated byte transports
//! - [`dispatcher`] - Single-writer command queue
//! - [`telemetry`] - Sensor polling and snapshot
//! - [`connection`] - Wires the above together for one robot
//! - [`bridge`] - Block request adapter
//! - [`config`] - JSON configuration

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]

pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod mode;
pub mod telemetry;
pub mod transport;

// Re-export main public types for convenience
pub use codec::{Command, PacketId, SensorPacket};
pub use connection::Connection;
pub use dispatcher::{CommandOutcome, DispatchError};
pub use mode::{LinkState, RobotMode};
