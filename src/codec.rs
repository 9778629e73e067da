//! # RTU Frame Codec
//!
//! Converts the raw byte stream of a serial line into validated Modbus
//! requests, and responses back into bytes.
//!
//! ## Frame Layout
//!
//! ```text
//! ┌──────────┬──────────┬─────────────────┬──────────────────────┐
//! │ slave: 1 │ func: 1  │ payload: N      │ crc16: 2 (LE)        │
//! └──────────┴──────────┴─────────────────┴──────────────────────┘
//! ```
//!
//! The CRC is CRC-16/MODBUS (reflected polynomial 0xA001, init 0xFFFF) over
//! every byte before it, transmitted low byte first.
//!
//! ## Framing
//!
//! [`RtuFrameReader`] accumulates bytes until either a 3.5 character silence
//! elapses or the length implied by the function code has arrived and its
//! CRC checks out.
//!
//! ## Decode Outcomes
//!
//! [`RtuCodec::decode_request`] never conflates "stay silent" with "answer
//! with an exception": it returns a [`FrameOutcome`] that is either a request
//! to dispatch, an exception response to send, or a reason to ignore the
//! frame.

use std::fmt;
use std::time::Duration;

use crc::{Crc, CRC_16_MODBUS};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{
    ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId, EXCEPTION_FLAG,
};
use crate::MAX_RTU_FRAME_SIZE;

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Slave id + function code + CRC
const MIN_FRAME_SIZE: usize = 4;

/// Calculate the CRC of an RTU frame body
pub fn calculate_crc(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC to a frame body, low byte first
fn seal(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = calculate_crc(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// A checksum-validated RTU frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub slave_id: SlaveId,
    pub function_code: u8,
    pub payload: Vec<u8>,
    pub crc: u16,
}

impl RtuFrame {
    /// Split a raw frame into its fields, verifying the CRC
    pub fn decode(bytes: &[u8]) -> ModbusResult<Self> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(ModbusError::frame(format!("RTU frame too short: {} bytes", bytes.len())));
        }
        if bytes.len() > MAX_RTU_FRAME_SIZE {
            return Err(ModbusError::frame(format!("RTU frame too large: {} bytes", bytes.len())));
        }

        let body_len = bytes.len() - 2;
        let received_crc = u16::from_le_bytes([bytes[body_len], bytes[body_len + 1]]);
        let calculated_crc = calculate_crc(&bytes[..body_len]);
        if received_crc != calculated_crc {
            return Err(ModbusError::crc_mismatch(calculated_crc, received_crc));
        }

        Ok(Self {
            slave_id: bytes[0],
            function_code: bytes[1],
            payload: bytes[2..body_len].to_vec(),
            crc: received_crc,
        })
    }
}

/// Length of a complete request frame, if the function code declares one
///
/// Returns `None` when the length cannot be known yet (too few bytes) or at
/// all (unknown function code); such frames end at the silence gap.
pub fn expected_request_length(buffer: &[u8]) -> Option<usize> {
    let function_code = *buffer.get(1)?;
    match function_code {
        0x01..=0x06 => Some(8),
        0x0F | 0x10 => buffer.get(6).map(|&byte_count| 9 + byte_count as usize),
        _ => None,
    }
}

/// Encode a request into an RTU frame (master side)
///
/// A write-multiple payload must fit the one byte count field and the RTU
/// frame limit; a larger one is a frame error, never a truncated frame.
pub fn encode_request(request: &ModbusRequest) -> ModbusResult<Vec<u8>> {
    let mut frame = Vec::with_capacity(9 + request.data.len());
    frame.push(request.slave_id);
    frame.push(request.function.to_u8());
    frame.extend_from_slice(&request.address.to_be_bytes());

    match request.function {
        ModbusFunction::ReadCoils
        | ModbusFunction::ReadDiscreteInputs
        | ModbusFunction::ReadHoldingRegisters
        | ModbusFunction::ReadInputRegisters => {
            frame.extend_from_slice(&request.quantity.to_be_bytes());
        }
        ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
            let value = request.single_value().unwrap_or_default();
            frame.extend_from_slice(&value.to_be_bytes());
        }
        ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
            let byte_count = u8::try_from(request.data.len())
                .ok()
                .filter(|_| frame.len() + 3 + request.data.len() + 2 <= MAX_RTU_FRAME_SIZE)
                .ok_or_else(|| {
                    ModbusError::frame(format!(
                        "{} payload of {} bytes does not fit in an RTU frame",
                        request.function,
                        request.data.len()
                    ))
                })?;
            frame.extend_from_slice(&request.quantity.to_be_bytes());
            frame.push(byte_count);
            frame.extend_from_slice(&request.data);
        }
    }

    Ok(seal(frame))
}

/// Encode a response into an RTU frame
///
/// Exception responses carry the function code with its high bit set and the
/// exception code as the only payload byte.
pub fn encode_response(response: &ModbusResponse) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + response.data.len());
    frame.push(response.slave_id);
    frame.push(response.wire_function_code());
    match response.exception {
        Some(exception) => frame.push(exception.to_u8()),
        None => frame.extend_from_slice(&response.data),
    }
    seal(frame)
}

/// Decode a response frame (master side)
pub fn decode_response(bytes: &[u8]) -> ModbusResult<ModbusResponse> {
    let frame = RtuFrame::decode(bytes)?;

    if frame.function_code & EXCEPTION_FLAG != 0 {
        let code = *frame
            .payload
            .first()
            .ok_or_else(|| ModbusError::frame("Invalid exception response"))?;
        let exception = ModbusException::from_u8(code)
            .ok_or_else(|| ModbusError::frame(format!("Unknown exception code 0x{:02X}", code)))?;
        return Ok(ModbusResponse::new_exception(frame.slave_id, frame.function_code, exception));
    }

    let function = ModbusFunction::from_u8(frame.function_code)?;
    Ok(ModbusResponse::new_success(frame.slave_id, function, frame.payload))
}

/// Why a received frame gets no reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// CRC did not match; the frame may be corrupt in any field
    ChecksumMismatch { expected: u16, actual: u16 },
    /// Valid frame for another unit on the bus
    NotAddressedToMe { slave_id: SlaveId },
    /// Too short, too long, or payload too short for its function code
    Malformed { message: String },
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (expected {:04X}, got {:04X})", expected, actual)
            }
            IgnoreReason::NotAddressedToMe { slave_id } => write!(f, "addressed to unit {}", slave_id),
            IgnoreReason::Malformed { message } => write!(f, "malformed frame: {}", message),
        }
    }
}

/// Result of decoding one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Well-formed request for this unit
    Request(ModbusRequest),
    /// Well-formed frame that must be answered with this exception
    Exception(ModbusResponse),
    /// No reply at all
    Ignore(IgnoreReason),
}

/// Request decoder bound to a unit id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtuCodec {
    unit_id: SlaveId,
    single: bool,
}

impl RtuCodec {
    /// Create a codec answering to `unit_id`
    ///
    /// In `single` mode every unit id is accepted.
    pub fn new(unit_id: SlaveId, single: bool) -> Self {
        Self { unit_id, single }
    }

    /// Decode an inbound request frame
    pub fn decode_request(&self, bytes: &[u8]) -> FrameOutcome {
        let frame = match RtuFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(ModbusError::CrcMismatch { expected, actual }) => {
                return FrameOutcome::Ignore(IgnoreReason::ChecksumMismatch { expected, actual });
            }
            Err(e) => {
                return FrameOutcome::Ignore(IgnoreReason::Malformed { message: e.to_string() });
            }
        };

        if !self.single && frame.slave_id != self.unit_id {
            return FrameOutcome::Ignore(IgnoreReason::NotAddressedToMe { slave_id: frame.slave_id });
        }

        let function = match ModbusFunction::from_u8(frame.function_code) {
            Ok(function) => function,
            Err(_) => {
                return FrameOutcome::Exception(ModbusResponse::new_exception(
                    frame.slave_id,
                    frame.function_code,
                    ModbusException::IllegalFunction,
                ));
            }
        };

        let payload = &frame.payload;
        let malformed = |message: &str| {
            FrameOutcome::Ignore(IgnoreReason::Malformed {
                message: format!("{}: {}", function.name(), message),
            })
        };

        if function.is_read_function()
            || matches!(function, ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister)
        {
            if payload.len() != 4 {
                return malformed("payload must be 4 bytes");
            }
        } else {
            if payload.len() < 5 {
                return malformed("payload shorter than header");
            }
            if payload.len() - 5 != payload[4] as usize {
                return FrameOutcome::Exception(ModbusResponse::new_exception(
                    frame.slave_id,
                    frame.function_code,
                    ModbusException::IllegalDataValue,
                ));
            }
        }

        let address = u16::from_be_bytes([payload[0], payload[1]]);
        let field = u16::from_be_bytes([payload[2], payload[3]]);
        let request = match function {
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => ModbusRequest {
                slave_id: frame.slave_id,
                function,
                address,
                quantity: 1,
                data: payload[2..4].to_vec(),
            },
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => ModbusRequest {
                slave_id: frame.slave_id,
                function,
                address,
                quantity: field,
                data: payload[5..].to_vec(),
            },
            _ => ModbusRequest::new_read(frame.slave_id, function, address, field),
        };

        FrameOutcome::Request(request)
    }
}

/// Reassembles RTU frames from a byte stream
///
/// Partial reads are buffered across calls, so `read_frame` may be cancelled
/// (e.g. inside `tokio::select!`) without losing bytes.
#[derive(Debug)]
pub struct RtuFrameReader {
    frame_gap: Duration,
    buffer: Vec<u8>,
}

impl RtuFrameReader {
    /// Create a reader that ends frames after `frame_gap` of silence
    pub fn new(frame_gap: Duration) -> Self {
        Self {
            frame_gap,
            buffer: Vec::with_capacity(MAX_RTU_FRAME_SIZE),
        }
    }

    /// Wait until at least one byte of the next frame is buffered
    ///
    /// Blocks without limit on an idle line and returns at once if bytes are
    /// left over from the previous read. Safe to cancel.
    pub async fn wait_for_data<R>(&mut self, reader: &mut R) -> ModbusResult<()>
    where
        R: AsyncRead + Unpin,
    {
        if !self.buffer.is_empty() {
            return Ok(());
        }

        let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| ModbusError::io(format!("Serial read error: {}", e)))?;
        if n == 0 {
            return Err(ModbusError::io("Channel closed"));
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Wait for the next complete frame
    ///
    /// Blocks without limit until the first byte arrives. A closed channel or a
    /// read failure is a transport error; an oversized frame is discarded with a
    /// frame error.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> ModbusResult<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        self.wait_for_data(reader).await?;

        let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];
        loop {
            if let Some(len) = self.complete_frame_len() {
                let rest = self.buffer.split_off(len);
                return Ok(std::mem::replace(&mut self.buffer, rest));
            }

            if self.buffer.len() > MAX_RTU_FRAME_SIZE {
                self.buffer.clear();
                return Err(ModbusError::frame("RTU frame too large"));
            }

            match timeout(self.frame_gap, reader.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ModbusError::io("Channel closed")),
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(ModbusError::io(format!("Serial read error: {}", e))),
                // Silence gap: whatever arrived is the frame
                Err(_) => return Ok(std::mem::take(&mut self.buffer)),
            }
        }
    }

    fn complete_frame_len(&self) -> Option<usize> {
        let len = expected_request_length(&self.buffer)?;
        if len < MIN_FRAME_SIZE || self.buffer.len() < len {
            return None;
        }
        let body = &self.buffer[..len - 2];
        let crc = u16::from_le_bytes([self.buffer[len - 2], self.buffer[len - 1]]);
        (calculate_crc(body) == crc).then_some(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn codec() -> RtuCodec {
        RtuCodec::new(1, false)
    }

    #[test]
    fn test_crc_known_vectors() {
        // 01 03 00 00 00 02 C4 0B on the wire
        assert_eq!(calculate_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
        assert_eq!(calculate_crc(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]), 0x0B98);
        assert_eq!(calculate_crc(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_encode_read_request() {
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 2);
        assert_eq!(encode_request(&request).unwrap(), vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[test]
    fn test_request_round_trip() {
        let requests = vec![
            ModbusRequest::new_read(1, ModbusFunction::ReadCoils, 3, 10),
            ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 0, 8),
            ModbusRequest::new_write_single_coil(1, 7, true),
            ModbusRequest::new_write_single_register(1, 104, 0xA5A5),
            ModbusRequest::new_write_multiple_coils(1, 0, &[true, false, true, true, false, false, true, false, true]),
            ModbusRequest::new_write_multiple_registers(1, 100, &[0x0123, 0x4567, 200]),
        ];

        for request in requests {
            let bytes = encode_request(&request).unwrap();
            assert_eq!(expected_request_length(&bytes), Some(bytes.len()));
            assert_eq!(codec().decode_request(&bytes), FrameOutcome::Request(request));
        }
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        // 123 registers is the largest write that fits in 256 bytes
        let largest = ModbusRequest::new_write_multiple_registers(1, 0, &[0xBEEF; 123]);
        let bytes = encode_request(&largest).unwrap();
        assert_eq!(bytes.len(), 255);
        assert_eq!(bytes[6], 246);

        let too_long = ModbusRequest::new_write_multiple_registers(1, 0, &[0xBEEF; 124]);
        assert!(matches!(encode_request(&too_long), Err(ModbusError::Frame { .. })));

        // a byte count above 255 must not wrap around
        let wrapping = ModbusRequest::new_write_multiple_registers(1, 0, &[0xBEEF; 130]);
        assert!(matches!(encode_request(&wrapping), Err(ModbusError::Frame { .. })));

        let coils = ModbusRequest::new_write_multiple_coils(1, 0, &[true; 2100]);
        assert!(encode_request(&coils).is_err());
    }

    #[test]
    fn test_corrupted_byte_is_rejected() {
        let request = ModbusRequest::new_write_multiple_registers(1, 100, &[1, 2, 3]);
        let bytes = encode_request(&request).unwrap();

        for index in 0..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[index] ^= 0x01;
            match codec().decode_request(&corrupted) {
                FrameOutcome::Ignore(IgnoreReason::ChecksumMismatch { .. }) => {}
                other => panic!("byte {} corrupted but decoded as {:?}", index, other),
            }
        }
    }

    #[test]
    fn test_other_unit_is_ignored() {
        let bytes = encode_request(&ModbusRequest::new_read(2, ModbusFunction::ReadHoldingRegisters, 0, 1)).unwrap();
        assert_eq!(
            codec().decode_request(&bytes),
            FrameOutcome::Ignore(IgnoreReason::NotAddressedToMe { slave_id: 2 })
        );

        // single mode serves any unit id
        let single = RtuCodec::new(1, true);
        assert!(matches!(single.decode_request(&bytes), FrameOutcome::Request(r) if r.slave_id == 2));
    }

    #[test]
    fn test_unknown_function_is_illegal_function() {
        let bytes = seal(vec![0x01, 0x08, 0x00, 0x00, 0x12, 0x34]);
        match codec().decode_request(&bytes) {
            FrameOutcome::Exception(response) => {
                assert_eq!(response.exception, Some(ModbusException::IllegalFunction));
                assert_eq!(encode_response(&response), seal(vec![0x01, 0x88, 0x01]));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payloads() {
        // read with a truncated payload
        let bytes = seal(vec![0x01, 0x03, 0x00, 0x00, 0x00]);
        assert!(matches!(
            codec().decode_request(&bytes),
            FrameOutcome::Ignore(IgnoreReason::Malformed { .. })
        ));

        // byte count disagrees with the data that follows
        let bytes = seal(vec![0x01, 0x10, 0x00, 0x00, 0x00, 0x01, 0x04, 0x00, 0x01]);
        assert!(matches!(
            codec().decode_request(&bytes),
            FrameOutcome::Exception(ModbusResponse { exception: Some(ModbusException::IllegalDataValue), .. })
        ));

        assert!(matches!(
            codec().decode_request(&[0x01, 0x03]),
            FrameOutcome::Ignore(IgnoreReason::Malformed { .. })
        ));
    }

    #[test]
    fn test_response_encoding() {
        let response = ModbusResponse::new_success(1, ModbusFunction::ReadHoldingRegisters, vec![0x04, 0x00, 0x0A, 0x00, 0x0B]);
        let bytes = encode_response(&response);
        assert_eq!(&bytes[..7], &[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B]);
        assert_eq!(decode_response(&bytes).unwrap(), response);

        let exception = ModbusResponse::new_exception(1, 0x03, ModbusException::IllegalDataAddress);
        let bytes = encode_response(&exception);
        assert_eq!(bytes.len(), 5);
        assert_eq!(bytes[1], 0x83);
        assert_eq!(decode_response(&bytes).unwrap(), exception);
    }

    #[tokio::test]
    async fn test_reader_splits_back_to_back_frames() {
        let first = encode_request(&ModbusRequest::new_read(1, ModbusFunction::ReadCoils, 0, 8)).unwrap();
        let second = encode_request(&ModbusRequest::new_write_multiple_registers(1, 0, &[7, 8])).unwrap();

        let (mut master, mut slave) = tokio::io::duplex(256);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        master.write_all(&stream).await.unwrap();

        let mut reader = RtuFrameReader::new(Duration::from_millis(5));
        assert_eq!(reader.read_frame(&mut slave).await.unwrap(), first);
        assert_eq!(reader.read_frame(&mut slave).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_reader_reassembles_partial_reads() {
        let frame = encode_request(&ModbusRequest::new_write_multiple_registers(1, 100, &[1, 2, 3, 4])).unwrap();
        let (mut master, mut slave) = tokio::io::duplex(256);

        let writer = {
            let frame = frame.clone();
            tokio::spawn(async move {
                for piece in frame.chunks(3) {
                    master.write_all(piece).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                master
            })
        };

        let mut reader = RtuFrameReader::new(Duration::from_millis(50));
        assert_eq!(reader.read_frame(&mut slave).await.unwrap(), frame);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_reader_ends_unknown_frames_on_silence() {
        let frame = seal(vec![0x01, 0x2B, 0x0E, 0x01, 0x00]);
        let (mut master, mut slave) = tokio::io::duplex(256);
        master.write_all(&frame).await.unwrap();

        let mut reader = RtuFrameReader::new(Duration::from_millis(5));
        assert_eq!(reader.read_frame(&mut slave).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_reader_reports_closed_channel() {
        let (master, mut slave) = tokio::io::duplex(16);
        drop(master);

        let mut reader = RtuFrameReader::new(Duration::from_millis(5));
        let err = reader.read_frame(&mut slave).await.unwrap_err();
        assert!(err.is_transport_error());
    }
}
