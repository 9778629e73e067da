//! # Error Handling
//!
//! Error types shared by every layer of the simulator: the serial transport,
//! the RTU frame codec, the register store and the configuration loader.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: serial port read/write failures, channel closed
//! - **Connection Errors**: the serial port cannot be opened
//!
//! A transport error terminates the slave server loop; it is never retried
//! internally.
//!
//! ### Protocol Errors
//! - **Frame Errors**: truncated or oversized RTU frames
//! - **CRC Errors**: checksum mismatch, the frame is dropped without a reply
//! - **Invalid Function**: unsupported function codes
//!
//! ### Data Errors
//! - **Address Out Of Range**: register store bounds violations
//! - **Invalid Data**: malformed values
//!
//! ### System Errors
//! - **Configuration Errors**: invalid startup configuration
//! - **Internal Errors**: poisoned locks and other unexpected conditions
//!
//! Protocol outcomes that a slave answers with an exception response
//! (illegal function, illegal data address, illegal data value) are not
//! errors: they travel as [`crate::protocol::ModbusException`] values.
//!
//! ```rust
//! use meter_modbus_sim::ModbusError;
//!
//! let err = ModbusError::io("channel closed");
//! assert!(err.is_transport_error());
//!
//! let err = ModbusError::crc_mismatch(0x1234, 0x5678);
//! assert!(err.is_protocol_error());
//! ```

use thiserror::Error;

use crate::register_bank::RegisterKind;

/// Result type alias for simulator operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Simulator error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors (serial port, in-memory channel)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// The serial port could not be opened or is gone.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Invalid function code
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Register store bounds violation
    ///
    /// Raised when `address + count` exceeds the capacity of the bank. The
    /// store is left untouched.
    #[error("Address out of range: {bank} start={address}, count={count}, capacity={capacity}")]
    AddressOutOfRange {
        bank: RegisterKind,
        address: u16,
        count: usize,
        capacity: usize,
    },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// CRC validation failure
    ///
    /// `expected` is the checksum computed over the received bytes, `actual`
    /// the one carried by the frame.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Frame parsing errors
    ///
    /// # Examples
    /// - RTU frame shorter than address + function + CRC
    /// - RTU frame longer than 256 bytes
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an out-of-range error for a register bank access
    pub fn address_out_of_range(bank: RegisterKind, address: u16, count: usize, capacity: usize) -> Self {
        Self::AddressOutOfRange {
            bank,
            address,
            count,
            capacity,
        }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is a channel/transport issue
    ///
    /// Transport errors end the slave server loop. Everything else is handled
    /// per frame.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Connection { .. })
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFunction { .. } | Self::Frame { .. } | Self::CrcMismatch { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from serial port errors
impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(err.to_string())
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::io("serial port unplugged");
        assert!(err.is_transport_error());
        assert!(!err.is_protocol_error());

        let err = ModbusError::connection("/dev/ttyUSB9: no such device");
        assert!(err.is_transport_error());

        // configuration mistakes are reported at startup, not as bus failures
        let err = ModbusError::configuration("tick interval must be non-zero");
        assert!(!err.is_transport_error());
        assert!(!err.is_protocol_error());

        let err = ModbusError::crc_mismatch(0x1234, 0x5678);
        assert!(err.is_protocol_error());
        assert!(!err.is_transport_error());

        let err = ModbusError::address_out_of_range(RegisterKind::HoldingRegister, 250, 10, 256);
        assert!(!err.is_transport_error());
        assert!(!err.is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let err = ModbusError::address_out_of_range(RegisterKind::InputRegister, 120, 16, 128);
        let msg = err.to_string();
        assert!(msg.contains("Input Register"));
        assert!(msg.contains("capacity=128"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: ModbusError = io.into();
        assert!(matches!(err, ModbusError::Io { .. }));
    }
}
