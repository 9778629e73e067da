//! # Meter Simulation
//!
//! Emulates the drifting readings of a combined energy/water meter and
//! projects them into the register store once per tick.
//!
//! ## Register Map
//!
//! | Bank | Address | Meaning |
//! |------|---------|---------|
//! | Input | 0-1 | Energy (Wh), u32, high word first |
//! | Input | 2-3 | Water (L), u32, high word first |
//! | Input | 4 | Voltage x 10 |
//! | Input | 5 | Current x 100 |
//! | Input | 6 | Power (W) |
//! | Input | 7 | Flow (L/min) x 10 |
//! | Holding | 100-101 | Serial number, u32 |
//! | Holding | 102 | Firmware version x 100 |
//! | Holding | 103 | Status flags |
//! | Holding | 104 | Reset command, write 0xA5A5 to zero the accumulators |
//!
//! Each tick writes the input block and the identity block with one store
//! write each, so a master never reads a half-updated group.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::ModbusResult;
use crate::protocol::data_utils;
use crate::register_bank::ModbusRegisterBank;

/// Fixed register addresses of the simulated meter
pub mod registers {
    pub const IR_ENERGY: u16 = 0;
    pub const IR_WATER: u16 = 2;
    pub const IR_VOLTAGE: u16 = 4;
    pub const IR_CURRENT: u16 = 5;
    pub const IR_POWER: u16 = 6;
    pub const IR_FLOW: u16 = 7;
    /// Input registers written per tick, starting at `IR_ENERGY`
    pub const IR_BLOCK_LEN: usize = 8;

    pub const HR_SERIAL: u16 = 100;
    pub const HR_FW_VERSION: u16 = 102;
    pub const HR_FLAGS: u16 = 103;
    /// Holding registers written per tick, starting at `HR_SERIAL`
    pub const HR_IDENTITY_LEN: usize = 4;
    pub const HR_RESET: u16 = 104;

    /// Value a master writes to `HR_RESET` to zero energy and water
    pub const RESET_COMMAND: u16 = 0xA5A5;

    /// Smallest input register bank that holds the map
    pub const MIN_INPUT_REGISTERS: usize = IR_BLOCK_LEN;
    /// Smallest holding register bank that holds the map
    pub const MIN_HOLDING_REGISTERS: usize = HR_RESET as usize + 1;
}

const VOLTAGE_RANGE: (f64, f64) = (200.0, 250.0);
const CURRENT_RANGE: (f64, f64) = (0.0, 15.0);
const FLOW_RANGE: (f64, f64) = (0.0, 80.0);
const VOLTAGE_STEP: f64 = 0.3;
const CURRENT_STEP: f64 = 0.05;
const FLOW_STEP: f64 = 0.4;

/// Physical quantities of the simulated meter
#[derive(Debug, Clone, PartialEq)]
pub struct MeterState {
    pub energy_wh: f64,
    pub water_l: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: u32,
    pub flow_lpm: f64,
    pub serial_number: u32,
    /// Firmware version x 100 (123 = v1.23)
    pub firmware_version: u16,
    /// bit0 = OK
    pub flags: u16,
}

impl Default for MeterState {
    fn default() -> Self {
        Self {
            energy_wh: 12_345.0,
            water_l: 67_890.0,
            voltage_v: 230.5,
            current_a: 1.23,
            power_w: 284,
            flow_lpm: 8.4,
            serial_number: 0x0123_4567,
            firmware_version: 123,
            flags: 0x0001,
        }
    }
}

impl MeterState {
    /// Energy counter as exposed on the bus
    pub fn energy_counter(&self) -> u32 {
        saturating_u32(self.energy_wh)
    }

    /// Water counter as exposed on the bus
    pub fn water_counter(&self) -> u32 {
        saturating_u32(self.water_l)
    }

    /// Input registers 0-7
    pub fn input_registers(&self) -> [u16; registers::IR_BLOCK_LEN] {
        let [energy_hi, energy_lo] = data_utils::u32_to_registers(self.energy_counter());
        let [water_hi, water_lo] = data_utils::u32_to_registers(self.water_counter());
        [
            energy_hi,
            energy_lo,
            water_hi,
            water_lo,
            scaled(self.voltage_v, 10.0),
            scaled(self.current_a, 100.0),
            self.power_w.min(u16::MAX as u32) as u16,
            scaled(self.flow_lpm, 10.0),
        ]
    }

    /// Holding registers 100-103
    pub fn identity_registers(&self) -> [u16; registers::HR_IDENTITY_LEN] {
        let [serial_hi, serial_lo] = data_utils::u32_to_registers(self.serial_number);
        [serial_hi, serial_lo, self.firmware_version, self.flags]
    }

    /// Pull every quantity back inside its valid range
    fn clamp(&mut self) {
        self.voltage_v = clamp_finite(self.voltage_v, VOLTAGE_RANGE);
        self.current_a = clamp_finite(self.current_a, CURRENT_RANGE);
        self.flow_lpm = clamp_finite(self.flow_lpm, FLOW_RANGE);
        self.energy_wh = clamp_finite(self.energy_wh, (0.0, u32::MAX as f64));
        self.water_l = clamp_finite(self.water_l, (0.0, u32::MAX as f64));
    }
}

/// NaN goes to the lower bound, infinities to the nearest bound
fn clamp_finite(value: f64, (min, max): (f64, f64)) -> f64 {
    if value.is_nan() {
        min
    } else {
        value.clamp(min, max)
    }
}

fn saturating_u32(value: f64) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= u32::MAX as f64 {
        u32::MAX
    } else {
        value as u32
    }
}

fn scaled(value: f64, factor: f64) -> u16 {
    let raw = (value * factor).round();
    if raw.is_nan() || raw <= 0.0 {
        0
    } else if raw >= u16::MAX as f64 {
        u16::MAX
    } else {
        raw as u16
    }
}

/// Meter model bound to a register store
#[derive(Debug)]
pub struct MeterSimulator {
    register_bank: Arc<ModbusRegisterBank>,
    state: MeterState,
    tick_interval: Duration,
    rng: StdRng,
}

impl MeterSimulator {
    /// Create the simulator and publish the initial snapshot
    pub fn new(register_bank: Arc<ModbusRegisterBank>, tick_interval: Duration) -> ModbusResult<Self> {
        Self::with_rng(register_bank, tick_interval, StdRng::from_entropy())
    }

    /// Same as [`MeterSimulator::new`] with a reproducible random sequence
    pub fn with_seed(register_bank: Arc<ModbusRegisterBank>, tick_interval: Duration, seed: u64) -> ModbusResult<Self> {
        Self::with_rng(register_bank, tick_interval, StdRng::seed_from_u64(seed))
    }

    fn with_rng(register_bank: Arc<ModbusRegisterBank>, tick_interval: Duration, rng: StdRng) -> ModbusResult<Self> {
        let simulator = Self {
            register_bank,
            state: MeterState::default(),
            tick_interval,
            rng,
        };
        simulator.write_snapshot()?;
        Ok(simulator)
    }

    pub fn state(&self) -> &MeterState {
        &self.state
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Advance the meter by one tick and publish the result
    pub fn tick(&mut self) -> ModbusResult<()> {
        let dt = self.tick_interval.as_secs_f64();

        self.state.voltage_v += self.rng.gen_range(-VOLTAGE_STEP..=VOLTAGE_STEP);
        self.state.current_a += self.rng.gen_range(-CURRENT_STEP..=CURRENT_STEP);
        self.state.flow_lpm += self.rng.gen_range(-FLOW_STEP..=FLOW_STEP);
        self.state.clamp();

        self.state.power_w = saturating_u32((self.state.voltage_v * self.state.current_a).trunc());
        self.state.energy_wh += (self.state.power_w as f64 * dt / 3600.0).max(0.0);
        self.state.water_l += (self.state.flow_lpm * dt / 60.0).max(0.0);
        self.state.clamp();

        let reset = self.take_reset_command()?;
        self.write_snapshot()?;
        if reset {
            // cleared only once the zeroed counters are visible
            self.register_bank.write_holding_registers(registers::HR_RESET, &[0])?;
            info!("Reset command received, energy and water counters cleared");
        }

        debug!(
            "Meter tick: {:.1}V {:.2}A {}W {:.1}L/min, energy={}Wh water={}L",
            self.state.voltage_v,
            self.state.current_a,
            self.state.power_w,
            self.state.flow_lpm,
            self.state.energy_counter(),
            self.state.water_counter()
        );
        Ok(())
    }

    /// Zero the accumulators if a master wrote the reset command
    ///
    /// Returns whether a reset happened. The command register is left as is;
    /// the caller clears it after publishing.
    fn take_reset_command(&mut self) -> ModbusResult<bool> {
        let command = self.register_bank.read_holding_registers(registers::HR_RESET, 1)?;
        if command.first() != Some(&registers::RESET_COMMAND) {
            return Ok(false);
        }

        self.state.energy_wh = 0.0;
        self.state.water_l = 0.0;
        Ok(true)
    }

    fn write_snapshot(&self) -> ModbusResult<()> {
        self.register_bank
            .write_input_registers(registers::IR_ENERGY, &self.state.input_registers())?;
        self.register_bank
            .write_holding_registers(registers::HR_SERIAL, &self.state.identity_registers())?;
        Ok(())
    }
}

/// Background task ticking a [`MeterSimulator`]
///
/// The task runs until [`SimulationDriver::stop`] signals it and joins it.
#[derive(Debug)]
pub struct SimulationDriver {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl SimulationDriver {
    /// Start ticking on the current tokio runtime
    pub fn spawn(mut simulator: MeterSimulator) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let period = simulator.tick_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick of an interval completes immediately
            ticker.tick().await;

            info!("Meter simulation started (tick every {:?})", period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Shutdown signal received by meter simulation");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = simulator.tick() {
                            warn!("Meter tick failed: {}", e);
                        }
                    }
                }
            }
            info!("Meter simulation stopped");
        });

        Self { shutdown_tx, handle }
    }

    /// Signal the task and wait until it has finished its last tick
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            error!("Meter simulation task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_bank::BankCapacities;
    use std::sync::mpsc;

    fn bank() -> Arc<ModbusRegisterBank> {
        Arc::new(ModbusRegisterBank::with_capacities(BankCapacities::default()))
    }

    fn energy_and_water(bank: &ModbusRegisterBank) -> (u32, u32) {
        let regs = bank.read_input_registers(registers::IR_ENERGY, 4).unwrap();
        (
            data_utils::registers_to_u32(&regs[0..2]).unwrap(),
            data_utils::registers_to_u32(&regs[2..4]).unwrap(),
        )
    }

    #[test]
    fn test_initial_snapshot() {
        let bank = bank();
        let _simulator = MeterSimulator::with_seed(bank.clone(), Duration::from_secs(1), 7).unwrap();

        assert_eq!(
            bank.read_input_registers(0, 8).unwrap(),
            vec![0, 12_345, 1, 2_354, 2305, 123, 284, 84]
        );
        assert_eq!(
            bank.read_holding_registers(registers::HR_SERIAL, 5).unwrap(),
            vec![0x0123, 0x4567, 123, 0x0001, 0]
        );
    }

    #[test]
    fn test_tick_keeps_readings_in_range() {
        let bank = bank();
        let mut simulator = MeterSimulator::with_seed(bank.clone(), Duration::from_secs(1), 42).unwrap();

        let mut last_energy = simulator.state().energy_counter();
        for _ in 0..5_000 {
            simulator.tick().unwrap();
            let state = simulator.state();
            assert!((200.0..=250.0).contains(&state.voltage_v));
            assert!((0.0..=15.0).contains(&state.current_a));
            assert!((0.0..=80.0).contains(&state.flow_lpm));
            assert_eq!(state.power_w, (state.voltage_v * state.current_a) as u32);
            assert!(state.energy_counter() >= last_energy);
            last_energy = state.energy_counter();
        }

        let regs = bank.read_input_registers(0, 8).unwrap();
        let state = simulator.state();
        assert_eq!(regs[registers::IR_POWER as usize], state.power_w as u16);
        assert_eq!(regs[registers::IR_VOLTAGE as usize], (state.voltage_v * 10.0).round() as u16);
        assert_eq!(energy_and_water(&bank), (state.energy_counter(), state.water_counter()));
    }

    #[test]
    fn test_energy_accumulates_per_second() {
        let bank = bank();
        let mut simulator = MeterSimulator::with_seed(bank.clone(), Duration::from_secs(3600), 1).unwrap();
        let before = simulator.state().energy_wh;

        // one simulated hour adds the whole power figure in Wh
        simulator.tick().unwrap();
        let state = simulator.state();
        assert!((state.energy_wh - before - state.power_w as f64).abs() < 1e-6);
    }

    #[test]
    fn test_reset_command() {
        let bank = bank();
        let mut simulator = MeterSimulator::with_seed(bank.clone(), Duration::from_secs(1), 3).unwrap();
        simulator.tick().unwrap();
        assert_ne!(energy_and_water(&bank), (0, 0));

        bank.write_holding_registers(registers::HR_RESET, &[registers::RESET_COMMAND]).unwrap();
        simulator.tick().unwrap();

        assert_eq!(energy_and_water(&bank), (0, 0));
        assert_eq!(bank.read_holding_registers(registers::HR_RESET, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_cleared_command_means_counters_are_published() {
        let bank = bank();
        let mut simulator = MeterSimulator::with_seed(bank.clone(), Duration::from_secs(3600), 11).unwrap();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel::<Vec<u16>>();

        std::thread::scope(|scope| {
            let master_bank = bank.clone();
            scope.spawn(move || {
                // a master polling 104 until it drops back to zero
                for () in go_rx {
                    while master_bank.read_holding_registers(registers::HR_RESET, 1).unwrap()[0] != 0 {
                        std::hint::spin_loop();
                    }
                    seen_tx
                        .send(master_bank.read_input_registers(registers::IR_ENERGY, 4).unwrap())
                        .unwrap();
                }
            });

            for round in 0..200 {
                simulator.tick().unwrap();
                bank.write_holding_registers(registers::HR_RESET, &[registers::RESET_COMMAND]).unwrap();
                go_tx.send(()).unwrap();
                simulator.tick().unwrap();
                assert_eq!(seen_rx.recv().unwrap(), vec![0, 0, 0, 0], "stale counters in round {}", round);
            }
            drop(go_tx);
        });
    }

    #[test]
    fn test_other_values_do_not_reset() {
        let bank = bank();
        let mut simulator = MeterSimulator::with_seed(bank.clone(), Duration::from_secs(1), 3).unwrap();

        bank.write_holding_registers(registers::HR_RESET, &[0x1234]).unwrap();
        simulator.tick().unwrap();

        assert!(energy_and_water(&bank).0 >= 12_345);
        assert_eq!(bank.read_holding_registers(registers::HR_RESET, 1).unwrap(), vec![0x1234]);
    }

    #[test]
    fn test_anomalies_are_clamped() {
        let mut state = MeterState {
            voltage_v: f64::NAN,
            current_a: f64::INFINITY,
            flow_lpm: -3.0,
            energy_wh: 1e12,
            water_l: f64::NEG_INFINITY,
            ..Default::default()
        };
        state.clamp();

        assert_eq!(state.voltage_v, 200.0);
        assert_eq!(state.current_a, 15.0);
        assert_eq!(state.flow_lpm, 0.0);
        assert_eq!(state.energy_counter(), u32::MAX);
        assert_eq!(state.water_counter(), 0);
    }

    #[test]
    fn test_store_too_small_is_reported() {
        let bank = Arc::new(ModbusRegisterBank::with_capacities(BankCapacities {
            holding_registers: 50,
            ..Default::default()
        }));
        assert!(MeterSimulator::new(bank, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_driver_services_reset_and_stops() {
        let bank = bank();
        let simulator = MeterSimulator::with_seed(bank.clone(), Duration::from_millis(10), 9).unwrap();
        let driver = SimulationDriver::spawn(simulator);

        bank.write_holding_registers(registers::HR_RESET, &[registers::RESET_COMMAND]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bank.read_holding_registers(registers::HR_RESET, 1).unwrap(), vec![0]);
        assert!(!driver.is_finished());

        driver.stop().await;

        // no more writes after stop
        bank.write_input_registers(0, &[0xFFFF]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bank.read_input_registers(0, 1).unwrap(), vec![0xFFFF]);
    }
}
