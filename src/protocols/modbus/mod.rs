//! Modbus TCP server.
//!
//! Holding and input registers expose the same scaled analog points; coils
//! and discrete inputs expose breaker positions. See [`crate::points`] for the
//! address layout.

mod codec;
mod server;

pub use codec::{decode_request, encode_response, split_frame, MbapHeader, Request, Response};
pub use server::ModbusServer;

use crate::error::CommandError;

pub const MBAP_HEADER_LEN: usize = 7;
/// Largest MBAP length field: unit id plus a 253 byte PDU
pub const MAX_MBAP_LENGTH: usize = 254;
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl TryFrom<u8> for FunctionCode {
    type Error = ExceptionCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x01 => FunctionCode::ReadCoils,
            0x02 => FunctionCode::ReadDiscreteInputs,
            0x03 => FunctionCode::ReadHoldingRegisters,
            0x04 => FunctionCode::ReadInputRegisters,
            0x05 => FunctionCode::WriteSingleCoil,
            0x06 => FunctionCode::WriteSingleRegister,
            0x0F => FunctionCode::WriteMultipleCoils,
            0x10 => FunctionCode::WriteMultipleRegisters,
            _ => return Err(ExceptionCode::IllegalFunction),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    ServerDeviceBusy = 0x06,
}

impl From<&CommandError> for ExceptionCode {
    fn from(err: &CommandError) -> Self {
        match err {
            CommandError::UnknownTarget { .. } => ExceptionCode::IllegalDataAddress,
            CommandError::OutOfRange { .. } | CommandError::NotFinite { .. } => {
                ExceptionCode::IllegalDataValue
            }
            CommandError::TargetBusy(_)
            | CommandError::QueueFull(_)
            | CommandError::TopologyChanged => ExceptionCode::ServerDeviceBusy,
            CommandError::Engine(_) => ExceptionCode::ServerDeviceFailure,
        }
    }
}
