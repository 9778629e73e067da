/// Register store for the simulated slave
///
/// This module provides thread-safe, fixed-capacity storage for the four
/// Modbus banks: coils, discrete inputs, holding registers and input registers.
/// Every access is range-checked against the bank capacity; an out-of-range
/// request fails with `AddressOutOfRange` and never touches the cells.
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// The four Modbus register banks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterKind {
    /// 1-bit, read-only for a master
    DiscreteInput,
    /// 1-bit, read/write for a master
    Coil,
    /// 16-bit, read-only for a master
    InputRegister,
    /// 16-bit, read/write for a master
    HoldingRegister,
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterKind::DiscreteInput => "Discrete Input",
            RegisterKind::Coil => "Coil",
            RegisterKind::InputRegister => "Input Register",
            RegisterKind::HoldingRegister => "Holding Register",
        };
        f.write_str(name)
    }
}

/// Capacity of each bank, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BankCapacities {
    pub discrete_inputs: usize,
    pub coils: usize,
    pub input_registers: usize,
    pub holding_registers: usize,
}

impl Default for BankCapacities {
    fn default() -> Self {
        Self {
            discrete_inputs: 16,
            coils: 16,
            input_registers: 128,
            holding_registers: 256,
        }
    }
}

/// One bank: a fixed-size array of cells behind its own lock
#[derive(Debug)]
struct Bank<T> {
    kind: RegisterKind,
    cells: RwLock<Vec<T>>,
}

impl<T: Copy + Default> Bank<T> {
    fn new(kind: RegisterKind, capacity: usize) -> Self {
        Self {
            kind,
            cells: RwLock::new(vec![T::default(); capacity]),
        }
    }

    fn capacity(&self) -> usize {
        match self.cells.read() {
            Ok(cells) => cells.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn check_range(&self, address: u16, count: usize, capacity: usize) -> ModbusResult<std::ops::Range<usize>> {
        let start = address as usize;
        match start.checked_add(count) {
            Some(end) if end <= capacity => Ok(start..end),
            _ => Err(ModbusError::address_out_of_range(self.kind, address, count, capacity)),
        }
    }

    fn read(&self, address: u16, count: usize) -> ModbusResult<Vec<T>> {
        let cells = self
            .cells
            .read()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {} bank", self.kind)))?;
        let range = self.check_range(address, count, cells.len())?;
        Ok(cells[range].to_vec())
    }

    fn write(&self, address: u16, values: &[T]) -> ModbusResult<()> {
        let mut cells = self
            .cells
            .write()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {} bank", self.kind)))?;
        let range = self.check_range(address, values.len(), cells.len())?;
        cells[range].copy_from_slice(values);
        Ok(())
    }
}

/// Register store holding coils, discrete inputs, holding registers and input registers
///
/// Each bank sits behind its own `RwLock`, held only for the duration of a
/// single read or write. A single `write` call is therefore indivisible: a
/// concurrent reader sees either all of it or none of it. All addressing is
/// 0-based.
///
/// The store does not enforce access classes; whether a master may write a
/// bank is decided by the function code in the dispatcher.
#[derive(Debug)]
pub struct ModbusRegisterBank {
    discrete_inputs: Bank<bool>,
    coils: Bank<bool>,
    input_registers: Bank<u16>,
    holding_registers: Bank<u16>,
}

impl ModbusRegisterBank {
    /// Create a register store with the default capacities
    pub fn new() -> Self {
        Self::with_capacities(BankCapacities::default())
    }

    /// Create a register store with explicit capacities, all cells zeroed
    pub fn with_capacities(capacities: BankCapacities) -> Self {
        Self {
            discrete_inputs: Bank::new(RegisterKind::DiscreteInput, capacities.discrete_inputs),
            coils: Bank::new(RegisterKind::Coil, capacities.coils),
            input_registers: Bank::new(RegisterKind::InputRegister, capacities.input_registers),
            holding_registers: Bank::new(RegisterKind::HoldingRegister, capacities.holding_registers),
        }
    }

    /// Number of cells in a bank
    pub fn capacity(&self, kind: RegisterKind) -> usize {
        match kind {
            RegisterKind::DiscreteInput => self.discrete_inputs.capacity(),
            RegisterKind::Coil => self.coils.capacity(),
            RegisterKind::InputRegister => self.input_registers.capacity(),
            RegisterKind::HoldingRegister => self.holding_registers.capacity(),
        }
    }

    /// Read `count` cells of any bank as 16-bit values
    ///
    /// Bit banks yield 0 or 1 per cell. The returned vector is a copy.
    pub fn read(&self, kind: RegisterKind, address: u16, count: usize) -> ModbusResult<Vec<u16>> {
        match kind {
            RegisterKind::DiscreteInput => Ok(bits_to_words(&self.discrete_inputs.read(address, count)?)),
            RegisterKind::Coil => Ok(bits_to_words(&self.coils.read(address, count)?)),
            RegisterKind::InputRegister => self.input_registers.read(address, count),
            RegisterKind::HoldingRegister => self.holding_registers.read(address, count),
        }
    }

    /// Overwrite consecutive cells of any bank
    ///
    /// For bit banks any non-zero value stores `true`.
    pub fn write(&self, kind: RegisterKind, address: u16, values: &[u16]) -> ModbusResult<()> {
        match kind {
            RegisterKind::DiscreteInput => self.discrete_inputs.write(address, &words_to_bits(values)),
            RegisterKind::Coil => self.coils.write(address, &words_to_bits(values)),
            RegisterKind::InputRegister => self.input_registers.write(address, values),
            RegisterKind::HoldingRegister => self.holding_registers.write(address, values),
        }
    }

    /// Read coils starting at address
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.coils.read(address, quantity as usize)
    }

    /// Write consecutive coils
    pub fn write_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        self.coils.write(address, values)
    }

    /// Read discrete inputs starting at address
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.discrete_inputs.read(address, quantity as usize)
    }

    /// Set discrete inputs (server side only)
    pub fn write_discrete_inputs(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        self.discrete_inputs.write(address, values)
    }

    /// Read holding registers starting at address
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.holding_registers.read(address, quantity as usize)
    }

    /// Write consecutive holding registers
    pub fn write_holding_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        self.holding_registers.write(address, values)
    }

    /// Read input registers starting at address
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.input_registers.read(address, quantity as usize)
    }

    /// Set input registers (server side only)
    pub fn write_input_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        self.input_registers.write(address, values)
    }

    /// Get register bank statistics
    pub fn get_stats(&self) -> RegisterBankStats {
        RegisterBankStats {
            coils_count: self.coils.capacity(),
            discrete_inputs_count: self.discrete_inputs.capacity(),
            holding_registers_count: self.holding_registers.capacity(),
            input_registers_count: self.input_registers.capacity(),
        }
    }
}

impl Default for ModbusRegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Register bank statistics (cell counts per bank)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBankStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
}

fn bits_to_words(bits: &[bool]) -> Vec<u16> {
    bits.iter().map(|&bit| bit as u16).collect()
}

fn words_to_bits(words: &[u16]) -> Vec<bool> {
    words.iter().map(|&word| word != 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn small_bank() -> ModbusRegisterBank {
        ModbusRegisterBank::with_capacities(BankCapacities {
            discrete_inputs: 16,
            coils: 16,
            input_registers: 8,
            holding_registers: 32,
        })
    }

    #[test]
    fn test_coil_operations() {
        let bank = small_bank();

        bank.write_coils(10, &[true]).unwrap();
        assert_eq!(bank.read_coils(10, 1).unwrap(), vec![true]);

        bank.write_coils(3, &[true, false, true]).unwrap();
        assert_eq!(bank.read_coils(3, 3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_register_operations() {
        let bank = small_bank();

        bank.write_holding_registers(5, &[42]).unwrap();
        assert_eq!(bank.read_holding_registers(5, 1).unwrap(), vec![42]);

        bank.write_holding_registers(20, &[100, 200, 300]).unwrap();
        assert_eq!(bank.read_holding_registers(20, 3).unwrap(), vec![100, 200, 300]);
    }

    #[test]
    fn test_read_after_write_every_valid_range() {
        let bank = small_bank();
        let capacity = bank.capacity(RegisterKind::HoldingRegister);

        for address in 0..capacity {
            for count in 1..=(capacity - address) {
                let values: Vec<u16> = (0..count).map(|i| (address * 100 + i) as u16).collect();
                bank.write(RegisterKind::HoldingRegister, address as u16, &values).unwrap();
                let read = bank.read(RegisterKind::HoldingRegister, address as u16, count).unwrap();
                assert_eq!(read, values, "address={} count={}", address, count);
            }
        }
    }

    #[test]
    fn test_out_of_range_leaves_store_untouched() {
        let bank = small_bank();
        bank.write_input_registers(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let err = bank.write(RegisterKind::InputRegister, 6, &[9, 9, 9]).unwrap_err();
        assert!(matches!(
            err,
            ModbusError::AddressOutOfRange { bank: RegisterKind::InputRegister, address: 6, count: 3, capacity: 8 }
        ));
        assert!(bank.read(RegisterKind::InputRegister, 7, 2).is_err());
        assert!(bank.read(RegisterKind::InputRegister, 8, 1).is_err());
        assert_eq!(bank.read_input_registers(0, 8).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);

        assert!(bank.write_coils(15, &[true, true]).is_err());
        assert_eq!(bank.read_coils(0, 16).unwrap(), vec![false; 16]);

        // address + count overflowing u16 is still just out of range
        assert!(bank.read(RegisterKind::HoldingRegister, u16::MAX, 2).is_err());
    }

    #[test]
    fn test_bit_banks_through_generic_access() {
        let bank = small_bank();
        bank.write(RegisterKind::DiscreteInput, 2, &[1, 0, 7]).unwrap();
        assert_eq!(bank.read_discrete_inputs(2, 3).unwrap(), vec![true, false, true]);
        assert_eq!(bank.read(RegisterKind::DiscreteInput, 2, 3).unwrap(), vec![1, 0, 1]);
    }

    #[test]
    fn test_repeated_access_is_idempotent() {
        let bank = small_bank();
        bank.write_holding_registers(4, &[0xBEEF, 0xCAFE]).unwrap();
        let first = bank.read_holding_registers(4, 2).unwrap();
        let second = bank.read_holding_registers(4, 2).unwrap();
        assert_eq!(first, second);

        for _ in 0..3 {
            bank.write_holding_registers(4, &[0x1111, 0x2222]).unwrap();
        }
        assert_eq!(bank.read_holding_registers(4, 2).unwrap(), vec![0x1111, 0x2222]);
    }

    #[test]
    fn test_zero_count_access() {
        let bank = small_bank();
        assert_eq!(bank.read(RegisterKind::HoldingRegister, 32, 0).unwrap(), Vec::<u16>::new());
        assert!(bank.write(RegisterKind::Coil, 16, &[]).is_ok());
        assert!(bank.read(RegisterKind::InputRegister, 9, 0).is_err());
    }

    #[test]
    fn test_stats_report_capacities() {
        let stats = ModbusRegisterBank::new().get_stats();
        assert_eq!(stats.discrete_inputs_count, 16);
        assert_eq!(stats.coils_count, 16);
        assert_eq!(stats.input_registers_count, 128);
        assert_eq!(stats.holding_registers_count, 256);
    }

    #[test]
    fn test_concurrent_writes_are_never_torn() {
        let bank = Arc::new(small_bank());
        let writer = {
            let bank = bank.clone();
            std::thread::spawn(move || {
                for i in 0..2000u16 {
                    bank.write_holding_registers(0, &[i, i, i, i]).unwrap();
                }
            })
        };

        for _ in 0..2000 {
            let snapshot = bank.read_holding_registers(0, 4).unwrap();
            assert!(snapshot.iter().all(|&v| v == snapshot[0]), "torn read: {:?}", snapshot);
        }
        writer.join().unwrap();
    }
}
