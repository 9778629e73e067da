use std::fmt;
use std::sync::Arc;

use crate::protocol::{ModbusException, ModbusFunction, COIL_ON, EXCEPTION_FLAG};
use crate::utils::format::bytes_to_hex;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw frame bytes only
    Raw,
    /// Show interpreted frame fields
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Direction of a frame relative to this slave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// Received from the master
    Rx,
    /// Sent to the master
    Tx,
}

impl fmt::Display for FrameDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameDirection::Rx => f.write_str("RX"),
            FrameDirection::Tx => f.write_str("TX"),
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger for bus traffic, independent of the `log` facade
///
/// The server hands every received and transmitted frame to
/// [`CallbackLogger::log_frame`]; what happens to the text is up to the
/// callback.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console(mode: LoggingMode) -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level.as_str(), message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::with_mode(Some(callback), LogLevel::Debug, mode)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log one complete RTU frame
    pub fn log_frame(&self, direction: FrameDirection, frame: &[u8]) {
        if !self.should_log(LogLevel::Info) {
            return;
        }

        let raw = || format!("{} ({} bytes): {}", direction, frame.len(), bytes_to_hex(frame));
        let interpreted = || format!("{} {}", direction, interpret_frame(direction, frame));

        match self.mode {
            LoggingMode::Raw => self.log(LogLevel::Info, &raw()),
            LoggingMode::Interpreted => self.log(LogLevel::Info, &interpreted()),
            LoggingMode::Both => {
                self.log(LogLevel::Info, &interpreted());
                self.log(LogLevel::Debug, &raw());
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Describe an RTU frame field by field
///
/// Requests are read from the master's point of view (RX), responses from
/// ours (TX). The CRC is not checked here.
pub fn interpret_frame(direction: FrameDirection, frame: &[u8]) -> String {
    if frame.len() < 4 {
        return format!("Truncated frame: {}", hex::encode(frame));
    }

    let slave_id = frame[0];
    let function_code = frame[1];
    let data = &frame[2..frame.len() - 2];

    if function_code & EXCEPTION_FLAG != 0 {
        let exception = data
            .first()
            .and_then(|&code| ModbusException::from_u8(code))
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("Unknown exception: {}", hex::encode(data)));
        return format!(
            "Slave: {}, Function: 0x{:02X}, Exception: {}",
            slave_id, function_code, exception
        );
    }

    let function_name = ModbusFunction::from_u8(function_code)
        .map(|f| f.name())
        .unwrap_or("Unknown Function");
    let details = match direction {
        FrameDirection::Rx => interpret_request_data(function_code, data),
        FrameDirection::Tx => interpret_response_data(function_code, data),
    };

    format!(
        "Slave: {}, Function: {} (0x{:02X}), {}",
        slave_id, function_name, function_code, details
    )
}

fn word_at(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn interpret_request_data(function_code: u8, data: &[u8]) -> String {
    match (function_code, word_at(data, 0), word_at(data, 2)) {
        (0x01..=0x04, Some(address), Some(quantity)) => {
            format!("Address: {}, Quantity: {}", address, quantity)
        }
        (0x05, Some(address), Some(value)) => {
            format!("Address: {}, Value: 0x{:04X} ({})", address, value, if value == COIL_ON { "ON" } else { "OFF" })
        }
        (0x06, Some(address), Some(value)) => {
            format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
        }
        (0x0F | 0x10, Some(address), Some(quantity)) => {
            format!(
                "Address: {}, Quantity: {}, Values: {}",
                address,
                quantity,
                hex::encode(data.get(5..).unwrap_or_default())
            )
        }
        _ => format!("Data: {}", hex::encode(data)),
    }
}

fn interpret_response_data(function_code: u8, data: &[u8]) -> String {
    if data.is_empty() {
        return "No data".to_string();
    }

    match function_code {
        0x01 | 0x02 => {
            let byte_count = data[0];
            let bits: Vec<bool> = data[1..]
                .iter()
                .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
                .collect();
            format!("Byte count: {}, Bits: {:?}", byte_count, &bits[..bits.len().min(16)])
        }
        0x03 | 0x04 => {
            let byte_count = data[0];
            let registers: Vec<u16> = data[1..]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            format!("Byte count: {}, Registers: {:?}", byte_count, &registers[..registers.len().min(8)])
        }
        // single writes echo the request
        0x05 | 0x06 => interpret_request_data(function_code, data),
        0x0F | 0x10 => match (word_at(data, 0), word_at(data, 2)) {
            (Some(address), Some(quantity)) => format!("Address: {}, Quantity: {}", address, quantity),
            _ => format!("Data: {}", hex::encode(data)),
        },
        _ => format!("Data: {}", hex::encode(data)),
    }
}
