//! # Serial Transport
//!
//! The slave talks to its master over a byte-duplex channel. In production
//! that channel is an RS-485 serial port opened through `tokio-serial`; the
//! server itself only requires `AsyncRead + AsyncWrite`, so tests plug in an
//! in-memory `tokio::io::duplex` pipe instead.
//!
//! This module owns the serial line parameters (baud rate, data bits, parity,
//! stop bits), opening the port, and the RTU character timing derived from
//! the baud rate.
//!
//! ```rust,no_run
//! use meter_modbus_sim::transport::{open_serial, SerialConfig};
//!
//! # fn example() -> meter_modbus_sim::ModbusResult<()> {
//! let config = SerialConfig {
//!     port: "/dev/ttyUSB0".to_string(),
//!     baud_rate: 9600,
//!     ..Default::default()
//! };
//! let port = open_serial(&config)?;
//! # drop(port);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// Bits on the wire per RTU character (start + 8 data + parity/stop + stop)
const BITS_PER_CHARACTER: u64 = 11;

/// Fixed inter-frame gap used above 19200 baud
const MIN_FRAME_GAP_US: u64 = 1750;

/// Serial data bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Seven,
    Eight,
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Serial stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

impl DataBits {
    /// Parse the numeric form used on the command line (7 or 8)
    pub fn from_count(bits: u8) -> ModbusResult<Self> {
        match bits {
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(ModbusError::configuration(format!("Unsupported data bits: {} (must be 7 or 8)", other))),
        }
    }
}

impl Parity {
    /// Parse the single-letter form used on the command line (N, E or O)
    pub fn from_letter(letter: &str) -> ModbusResult<Self> {
        match letter.to_ascii_uppercase().as_str() {
            "N" => Ok(Parity::None),
            "E" => Ok(Parity::Even),
            "O" => Ok(Parity::Odd),
            other => Err(ModbusError::configuration(format!("Unsupported parity: {} (must be N, E or O)", other))),
        }
    }

    fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

impl StopBits {
    /// Parse the numeric form used on the command line (1 or 2)
    pub fn from_count(bits: u8) -> ModbusResult<Self> {
        match bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(ModbusError::configuration(format!("Unsupported stop bits: {} (must be 1 or 2)", other))),
        }
    }
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Serial line configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name/path, e.g. `/dev/ttyUSB0` or `COM5`
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl SerialConfig {
    /// Minimum silence between two RTU frames at this baud rate
    pub fn frame_gap(&self) -> Duration {
        frame_gap(self.baud_rate)
    }
}

impl fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data_bits = match self.data_bits {
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        let stop_bits = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        write!(
            f,
            "{} @ {} {}{}{}",
            self.port,
            self.baud_rate,
            data_bits,
            self.parity.letter(),
            stop_bits
        )
    }
}

/// Open the serial port described by `config`
///
/// Failure here is fatal for the simulator: it is reported once by the caller
/// and the process exits.
pub fn open_serial(config: &SerialConfig) -> ModbusResult<tokio_serial::SerialStream> {
    if config.port.is_empty() {
        return Err(ModbusError::configuration("Serial port name is empty"));
    }

    let builder = tokio_serial::new(&config.port, config.baud_rate)
        .data_bits(config.data_bits.into())
        .stop_bits(config.stop_bits.into())
        .parity(config.parity.into());

    tokio_serial::SerialStream::open(&builder)
        .map_err(|e| ModbusError::connection(format!("Failed to open serial port {}: {}", config.port, e)))
}

/// Time to transmit one RTU character at `baud_rate`
pub fn character_time(baud_rate: u32) -> Duration {
    let baud = u64::from(baud_rate.max(1));
    Duration::from_micros(BITS_PER_CHARACTER * 1_000_000 / baud)
}

/// Silence that separates two RTU frames (3.5 character times)
///
/// Above 19200 baud the Modbus serial line guide fixes the gap at 1.75 ms.
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate > 19_200 {
        return Duration::from_micros(MIN_FRAME_GAP_US);
    }
    let char_time_us = character_time(baud_rate).as_micros() as u64;
    Duration::from_micros(char_time_us * 35 / 10)
}
