//! # Simulator Configuration
//!
//! Startup configuration for the meter simulator. Values come from
//! [`SimulatorConfig::default`], optionally replaced by a JSON file, then
//! overridden by command line flags in the binary. The result is validated
//! once before anything is opened; there is no runtime reconfiguration.
//!
//! ```json
//! {
//!   "unit_id": 1,
//!   "single": false,
//!   "serial": { "port": "/dev/ttyUSB0", "baud_rate": 9600, "parity": "None" },
//!   "tick_interval_ms": 1000,
//!   "auto_update": true
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::register_bank::BankCapacities;
use crate::simulation::registers;
use crate::transport::SerialConfig;
use crate::utils::validation;

/// Complete simulator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Unit id this slave answers to (1-247)
    pub unit_id: u8,
    /// Answer every unit id, echoing the id of the request
    pub single: bool,
    pub serial: SerialConfig,
    pub capacities: BankCapacities,
    /// Simulation cadence in milliseconds
    pub tick_interval_ms: u64,
    /// Run the simulation driver; when false the registers hold the initial snapshot
    pub auto_update: bool,
    /// Dump every frame through the packet logger
    pub log_packets: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            unit_id: crate::DEFAULT_UNIT_ID,
            single: false,
            serial: SerialConfig::default(),
            capacities: BankCapacities::default(),
            tick_interval_ms: 1000,
            auto_update: true,
            log_packets: false,
        }
    }
}

impl SimulatorConfig {
    /// Load a configuration from a JSON file
    ///
    /// Missing fields keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Check every value before the simulator starts
    pub fn validate(&self) -> ModbusResult<()> {
        validation::validate_slave_id(self.unit_id)
            .map_err(|e| ModbusError::configuration(e.to_string()))?;

        if self.serial.baud_rate == 0 {
            return Err(ModbusError::configuration("Baud rate must be greater than 0"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ModbusError::configuration("Tick interval must be greater than 0"));
        }

        let capacities = &self.capacities;
        if capacities.discrete_inputs == 0
            || capacities.coils == 0
            || capacities.input_registers == 0
            || capacities.holding_registers == 0
        {
            return Err(ModbusError::configuration("Register bank capacities must be non-zero"));
        }
        if capacities.input_registers < registers::MIN_INPUT_REGISTERS {
            return Err(ModbusError::configuration(format!(
                "Input register bank too small for the meter map: {} (need {})",
                capacities.input_registers,
                registers::MIN_INPUT_REGISTERS
            )));
        }
        if capacities.holding_registers < registers::MIN_HOLDING_REGISTERS {
            return Err(ModbusError::configuration(format!(
                "Holding register bank too small for the meter map: {} (need {})",
                capacities.holding_registers,
                registers::MIN_HOLDING_REGISTERS
            )));
        }
        // addresses on the wire are 16-bit
        let max_capacity = u16::MAX as usize + 1;
        if [
            capacities.discrete_inputs,
            capacities.coils,
            capacities.input_registers,
            capacities.holding_registers,
        ]
        .iter()
        .any(|&c| c > max_capacity)
        {
            return Err(ModbusError::configuration(format!(
                "Register bank capacities must not exceed {}",
                max_capacity
            )));
        }

        Ok(())
    }
}
