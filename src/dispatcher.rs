/// Request dispatcher
///
/// Maps decoded requests onto register store operations. The function code
/// decides which bank is touched and whether it may be written, so the store
/// itself stays agnostic of access classes.
use std::sync::Arc;

use log::{debug, error};

use crate::error::ModbusError;
use crate::protocol::{data_utils, ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, COIL_OFF, COIL_ON};
use crate::register_bank::{ModbusRegisterBank, RegisterKind};
use crate::{MAX_COILS_PER_READ, MAX_COILS_PER_WRITE, MAX_REGISTERS_PER_READ, MAX_REGISTERS_PER_WRITE};

type HandlerResult = Result<Vec<u8>, ModbusException>;

/// Executes requests against a shared register store
#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    register_bank: Arc<ModbusRegisterBank>,
}

impl RequestDispatcher {
    pub fn new(register_bank: Arc<ModbusRegisterBank>) -> Self {
        Self { register_bank }
    }

    pub fn register_bank(&self) -> &Arc<ModbusRegisterBank> {
        &self.register_bank
    }

    /// Execute a request and build its response
    ///
    /// Never fails: every problem becomes an exception response, and an
    /// exception response never carries partial data.
    pub fn dispatch(&self, request: &ModbusRequest) -> ModbusResponse {
        let result = match request.function {
            ModbusFunction::ReadCoils => self.handle_read_bits(request, RegisterKind::Coil),
            ModbusFunction::ReadDiscreteInputs => self.handle_read_bits(request, RegisterKind::DiscreteInput),
            ModbusFunction::ReadHoldingRegisters => self.handle_read_registers(request, RegisterKind::HoldingRegister),
            ModbusFunction::ReadInputRegisters => self.handle_read_registers(request, RegisterKind::InputRegister),
            ModbusFunction::WriteSingleCoil => self.handle_write_single_coil(request),
            ModbusFunction::WriteSingleRegister => self.handle_write_single_register(request),
            ModbusFunction::WriteMultipleCoils => self.handle_write_multiple_coils(request),
            ModbusFunction::WriteMultipleRegisters => self.handle_write_multiple_registers(request),
        };

        match result {
            Ok(data) => ModbusResponse::new_success(request.slave_id, request.function, data),
            Err(exception) => {
                debug!(
                    "{} @ {} x{} rejected: {:?}",
                    request.function, request.address, request.quantity, exception
                );
                ModbusResponse::new_exception(request.slave_id, request.function.to_u8(), exception)
            }
        }
    }

    /// Read coils (0x01) / discrete inputs (0x02)
    fn handle_read_bits(&self, request: &ModbusRequest, kind: RegisterKind) -> HandlerResult {
        check_quantity(request.quantity, MAX_COILS_PER_READ)?;
        self.check_range(kind, request.address, request.quantity)?;

        let bits = match kind {
            RegisterKind::Coil => self.register_bank.read_coils(request.address, request.quantity),
            _ => self.register_bank.read_discrete_inputs(request.address, request.quantity),
        }
        .map_err(store_exception)?;

        let packed = data_utils::pack_bits(&bits);
        let mut response = Vec::with_capacity(1 + packed.len());
        response.push(packed.len() as u8);
        response.extend_from_slice(&packed);
        Ok(response)
    }

    /// Read holding registers (0x03) / input registers (0x04)
    fn handle_read_registers(&self, request: &ModbusRequest, kind: RegisterKind) -> HandlerResult {
        check_quantity(request.quantity, MAX_REGISTERS_PER_READ)?;
        self.check_range(kind, request.address, request.quantity)?;

        let registers = match kind {
            RegisterKind::HoldingRegister => self.register_bank.read_holding_registers(request.address, request.quantity),
            _ => self.register_bank.read_input_registers(request.address, request.quantity),
        }
        .map_err(store_exception)?;

        let bytes = data_utils::registers_to_bytes(&registers);
        let mut response = Vec::with_capacity(1 + bytes.len());
        response.push(bytes.len() as u8);
        response.extend_from_slice(&bytes);
        Ok(response)
    }

    /// Write single coil (0x05)
    fn handle_write_single_coil(&self, request: &ModbusRequest) -> HandlerResult {
        let value = request.single_value().ok_or(ModbusException::IllegalDataValue)?;
        let coil_value = match value {
            COIL_OFF => false,
            COIL_ON => true,
            _ => return Err(ModbusException::IllegalDataValue),
        };
        self.check_range(RegisterKind::Coil, request.address, 1)?;

        self.register_bank
            .write_coils(request.address, &[coil_value])
            .map_err(store_exception)?;

        Ok(echo_single(request.address, value))
    }

    /// Write single register (0x06)
    fn handle_write_single_register(&self, request: &ModbusRequest) -> HandlerResult {
        let value = request.single_value().ok_or(ModbusException::IllegalDataValue)?;
        self.check_range(RegisterKind::HoldingRegister, request.address, 1)?;

        self.register_bank
            .write_holding_registers(request.address, &[value])
            .map_err(store_exception)?;

        Ok(echo_single(request.address, value))
    }

    /// Write multiple coils (0x0F)
    fn handle_write_multiple_coils(&self, request: &ModbusRequest) -> HandlerResult {
        check_quantity(request.quantity, MAX_COILS_PER_WRITE)?;
        if request.data.len() != (request.quantity as usize).div_ceil(8) {
            return Err(ModbusException::IllegalDataValue);
        }
        self.check_range(RegisterKind::Coil, request.address, request.quantity)?;

        let coils = data_utils::unpack_bits(&request.data, request.quantity as usize);
        self.register_bank
            .write_coils(request.address, &coils)
            .map_err(store_exception)?;

        Ok(echo_range(request.address, request.quantity))
    }

    /// Write multiple registers (0x10)
    fn handle_write_multiple_registers(&self, request: &ModbusRequest) -> HandlerResult {
        check_quantity(request.quantity, MAX_REGISTERS_PER_WRITE)?;
        if request.data.len() != request.quantity as usize * 2 {
            return Err(ModbusException::IllegalDataValue);
        }
        self.check_range(RegisterKind::HoldingRegister, request.address, request.quantity)?;

        let registers = data_utils::bytes_to_registers(&request.data).map_err(|_| ModbusException::IllegalDataValue)?;
        self.register_bank
            .write_holding_registers(request.address, &registers)
            .map_err(store_exception)?;

        Ok(echo_range(request.address, request.quantity))
    }

    fn check_range(&self, kind: RegisterKind, address: u16, quantity: u16) -> Result<(), ModbusException> {
        let end = address as usize + quantity as usize;
        if end > self.register_bank.capacity(kind) {
            return Err(ModbusException::IllegalDataAddress);
        }
        Ok(())
    }
}

fn check_quantity(quantity: u16, max: u16) -> Result<(), ModbusException> {
    if quantity == 0 || quantity > max {
        return Err(ModbusException::IllegalDataValue);
    }
    Ok(())
}

/// Map a store failure that slipped past the range pre-check
fn store_exception(err: ModbusError) -> ModbusException {
    match err {
        ModbusError::AddressOutOfRange { .. } => ModbusException::IllegalDataAddress,
        other => {
            error!("Register store failure: {}", other);
            ModbusException::ServerDeviceFailure
        }
    }
}

fn echo_single(address: u16, value: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(4);
    data.extend_from_slice(&address.to_be_bytes());
    data.extend_from_slice(&value.to_be_bytes());
    data
}

fn echo_range(address: u16, quantity: u16) -> Vec<u8> {
    echo_single(address, quantity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_bank::BankCapacities;

    fn dispatcher() -> RequestDispatcher {
        RequestDispatcher::new(Arc::new(ModbusRegisterBank::with_capacities(BankCapacities::default())))
    }

    fn exception_of(response: &ModbusResponse) -> Option<ModbusException> {
        assert!(response.exception.is_none() || response.data.is_empty());
        response.exception
    }

    #[test]
    fn test_read_holding_registers() {
        let dispatcher = dispatcher();
        dispatcher
            .register_bank()
            .write_holding_registers(100, &[0x0123, 0x4567, 123, 1])
            .unwrap();

        let response = dispatcher.dispatch(&ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 100, 4));
        assert_eq!(response.function_code, 0x03);
        assert_eq!(response.parse_registers().unwrap(), vec![0x0123, 0x4567, 123, 1]);
        assert_eq!(response.data[0], 8);
    }

    #[test]
    fn test_read_quantity_bounds() {
        let dispatcher = dispatcher();
        for quantity in [0u16, 126] {
            let response = dispatcher.dispatch(&ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, quantity));
            assert_eq!(exception_of(&response), Some(ModbusException::IllegalDataValue));
        }

        let response = dispatcher.dispatch(&ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 125));
        assert_eq!(exception_of(&response), None);

        let response = dispatcher.dispatch(&ModbusRequest::new_read(1, ModbusFunction::ReadCoils, 0, 2001));
        assert_eq!(exception_of(&response), Some(ModbusException::IllegalDataValue));
    }

    #[test]
    fn test_read_beyond_capacity() {
        let dispatcher = dispatcher();
        let response = dispatcher.dispatch(&ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 120, 9));
        assert_eq!(exception_of(&response), Some(ModbusException::IllegalDataAddress));

        let response = dispatcher.dispatch(&ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 120, 8));
        assert_eq!(exception_of(&response), None);

        let response = dispatcher.dispatch(&ModbusRequest::new_read(1, ModbusFunction::ReadDiscreteInputs, 10, 7));
        assert_eq!(exception_of(&response), Some(ModbusException::IllegalDataAddress));
    }

    #[test]
    fn test_read_coils_packs_bits() {
        let dispatcher = dispatcher();
        dispatcher
            .register_bank()
            .write_coils(0, &[true, false, true, false, false, false, false, false, true])
            .unwrap();

        let response = dispatcher.dispatch(&ModbusRequest::new_read(1, ModbusFunction::ReadCoils, 0, 9));
        assert_eq!(response.data, vec![2, 0b0000_0101, 0b0000_0001]);
    }

    #[test]
    fn test_write_single_coil() {
        let dispatcher = dispatcher();
        let request = ModbusRequest::new_write_single_coil(1, 4, true);
        let response = dispatcher.dispatch(&request);
        assert_eq!(response.data, vec![0x00, 0x04, 0xFF, 0x00]);
        assert_eq!(dispatcher.register_bank().read_coils(4, 1).unwrap(), vec![true]);

        let mut bad = request.clone();
        bad.data = vec![0x12, 0x34];
        let response = dispatcher.dispatch(&bad);
        assert_eq!(exception_of(&response), Some(ModbusException::IllegalDataValue));
        assert_eq!(dispatcher.register_bank().read_coils(4, 1).unwrap(), vec![true]);
    }

    #[test]
    fn test_write_single_register_echoes_request() {
        let dispatcher = dispatcher();
        let response = dispatcher.dispatch(&ModbusRequest::new_write_single_register(1, 104, 0xA5A5));
        assert_eq!(response.data, vec![0x00, 0x68, 0xA5, 0xA5]);
        assert_eq!(dispatcher.register_bank().read_holding_registers(104, 1).unwrap(), vec![0xA5A5]);

        let response = dispatcher.dispatch(&ModbusRequest::new_write_single_register(1, 256, 1));
        assert_eq!(exception_of(&response), Some(ModbusException::IllegalDataAddress));
    }

    #[test]
    fn test_write_multiple_registers() {
        let dispatcher = dispatcher();
        let response = dispatcher.dispatch(&ModbusRequest::new_write_multiple_registers(1, 10, &[1, 2, 3]));
        assert_eq!(response.data, vec![0x00, 0x0A, 0x00, 0x03]);
        assert_eq!(dispatcher.register_bank().read_holding_registers(10, 3).unwrap(), vec![1, 2, 3]);

        let too_many = vec![0u16; 124];
        let response = dispatcher.dispatch(&ModbusRequest::new_write_multiple_registers(1, 0, &too_many));
        assert_eq!(exception_of(&response), Some(ModbusException::IllegalDataValue));

        let mut short = ModbusRequest::new_write_multiple_registers(1, 0, &[1, 2]);
        short.quantity = 3;
        let response = dispatcher.dispatch(&short);
        assert_eq!(exception_of(&response), Some(ModbusException::IllegalDataValue));

        let response = dispatcher.dispatch(&ModbusRequest::new_write_multiple_registers(1, 255, &[1, 2]));
        assert_eq!(exception_of(&response), Some(ModbusException::IllegalDataAddress));
        assert_eq!(dispatcher.register_bank().read_holding_registers(255, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_write_multiple_coils() {
        let dispatcher = dispatcher();
        let values = [true, true, false, true, false, false, false, false, false, true];
        let response = dispatcher.dispatch(&ModbusRequest::new_write_multiple_coils(1, 2, &values));
        assert_eq!(response.data, vec![0x00, 0x02, 0x00, 0x0A]);
        assert_eq!(dispatcher.register_bank().read_coils(2, 10).unwrap(), values.to_vec());

        let response = dispatcher.dispatch(&ModbusRequest::new_write_multiple_coils(1, 10, &values));
        assert_eq!(exception_of(&response), Some(ModbusException::IllegalDataAddress));
    }

    #[test]
    fn test_input_banks_are_not_master_writable() {
        // no write function code maps onto discrete inputs or input registers
        let dispatcher = dispatcher();
        dispatcher.dispatch(&ModbusRequest::new_write_multiple_registers(1, 0, &[9, 9]));
        assert_eq!(dispatcher.register_bank().read_input_registers(0, 2).unwrap(), vec![0, 0]);
    }
}
