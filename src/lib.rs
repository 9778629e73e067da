//! # Meter Modbus Sim - Modbus RTU Utility Meter Simulator
//!
//! A Modbus RTU slave that impersonates a combined electricity/water meter on
//! a serial bus. A master polls it like real hardware: it reads the energy and
//! water counters and the live electrical readings, reads the device identity,
//! and can clear the counters with a reset command.
//!
//! ## Features
//!
//! - **🔌 RTU over any channel**: serial ports through `tokio-serial`, or any
//!   `AsyncRead + AsyncWrite` pipe for testing
//! - **🛡️ Strict framing**: CRC-16/MODBUS validation, 3.5 character silence
//!   detection, unit id filtering with an optional answer-all mode
//! - **📈 Live readings**: voltage, current, power and flow drift on a timer while
//!   the energy and water counters accumulate
//! - **🔒 Consistent snapshots**: each register group is published in one locked
//!   write, so a master never reads half an update
//! - **📊 Statistics**: frame, exception and checksum counters
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meter_modbus_sim::{
//!     open_serial, MeterSimulator, ModbusRegisterBank, ModbusRtuServer, ModbusRtuServerConfig,
//!     ModbusServer, SerialConfig, SimulationDriver,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let serial = SerialConfig {
//!         port: "/dev/ttyUSB0".to_string(),
//!         ..Default::default()
//!     };
//!     let port = open_serial(&serial)?;
//!
//!     let bank = Arc::new(ModbusRegisterBank::new());
//!     let simulator = MeterSimulator::new(bank.clone(), Duration::from_secs(1))?;
//!     let driver = SimulationDriver::spawn(simulator);
//!
//!     let mut server = ModbusRtuServer::with_config(ModbusRtuServerConfig::default(), port, bank);
//!     server.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     driver.stop().await;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐          ┌─────────────────┐
//! │  Serial Port /  │          │   Simulation    │
//! │  duplex channel │          │     Driver      │
//! └─────────────────┘          └─────────────────┘
//!          │                            │ tick
//! ┌─────────────────┐                   │
//! │  Frame Reader   │                   │
//! │  + RTU Codec    │                   │
//! └─────────────────┘                   │
//!          │                            │
//! ┌─────────────────┐          ┌─────────────────┐
//! │   Dispatcher    │◄────────►│ Register Bank   │
//! └─────────────────┘          └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Serial line parameters and RTU timing
pub mod transport;

/// RTU frame encoding, decoding and reassembly
pub mod codec;

/// Request execution against the register store
pub mod dispatcher;

/// Modbus RTU slave server
pub mod server;

/// Thread-safe register storage
pub mod register_bank;

/// Meter model and periodic driver
pub mod simulation;

/// Startup configuration
pub mod config;

/// Validation and formatting helpers
pub mod utils;

/// Bus traffic logging
pub mod logging;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use protocol::{ModbusException, ModbusFunction, ModbusRequest, ModbusResponse};
pub use transport::{open_serial, SerialConfig};
pub use codec::{FrameOutcome, IgnoreReason, RtuCodec, RtuFrameReader};
pub use dispatcher::RequestDispatcher;
pub use server::{ModbusRtuServer, ModbusRtuServerConfig, ModbusServer, ServerState, ServerStats};
pub use register_bank::{BankCapacities, ModbusRegisterBank, RegisterBankStats, RegisterKind};
pub use simulation::{MeterSimulator, MeterState, SimulationDriver};
pub use config::SimulatorConfig;
pub use logging::{CallbackLogger, FrameDirection, LogCallback, LogLevel, LoggingMode};

/// Unit id answered when none is configured
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Maximum number of coils or discrete inputs in one read request
pub const MAX_COILS_PER_READ: u16 = 2000;

/// Maximum number of coils in one write request
pub const MAX_COILS_PER_WRITE: u16 = 1968;

/// Maximum number of registers in one read request
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Maximum number of registers in one write request
pub const MAX_REGISTERS_PER_WRITE: u16 = 123;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Meter Modbus Sim v{} - Modbus RTU utility meter simulator", VERSION)
}
