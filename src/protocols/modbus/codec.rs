use byteorder::{BigEndian, ByteOrder};

use super::{
    ExceptionCode, FunctionCode, MAX_MBAP_LENGTH, MAX_READ_BITS, MAX_READ_REGISTERS,
    MAX_WRITE_BITS, MAX_WRITE_REGISTERS, MBAP_HEADER_LEN,
};
use crate::error::ProtocolDecodeError;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count following the length field, unit id included
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolDecodeError> {
        if buf.len() < MBAP_HEADER_LEN {
            return Err(ProtocolDecodeError::Truncated {
                needed: MBAP_HEADER_LEN,
                actual: buf.len(),
            });
        }
        let header = MbapHeader {
            transaction_id: BigEndian::read_u16(&buf[0..2]),
            protocol_id: BigEndian::read_u16(&buf[2..4]),
            length: BigEndian::read_u16(&buf[4..6]),
            unit_id: buf[6],
        };
        if header.protocol_id != 0 {
            return Err(ProtocolDecodeError::ProtocolId(header.protocol_id));
        }
        let length = usize::from(header.length);
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(ProtocolDecodeError::InvalidLength(length));
        }
        Ok(header)
    }

    /// Total frame size on the wire
    pub fn frame_len(&self) -> usize {
        MBAP_HEADER_LEN - 1 + usize::from(self.length)
    }
}

/// Find the first complete frame in `buf`.
///
/// Returns the header and the frame's total length, `None` while more bytes
/// are needed, and an error when the header cannot be a Modbus TCP header.
pub fn split_frame(buf: &[u8]) -> Result<Option<(MbapHeader, usize)>, ProtocolDecodeError> {
    if buf.len() < MBAP_HEADER_LEN {
        return Ok(None);
    }
    let header = MbapHeader::parse(buf)?;
    let len = header.frame_len();
    if buf.len() < len {
        return Ok(None);
    }
    Ok(Some((header, len)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bits { function: FunctionCode, values: Vec<bool> },
    Registers { function: FunctionCode, values: Vec<u16> },
    WriteSingle { function: FunctionCode, address: u16, value: u16 },
    WriteMultiple { function: FunctionCode, address: u16, quantity: u16 },
    Exception { function: u8, code: ExceptionCode },
}

/// Decode a request PDU (function code first)
pub fn decode_request(pdu: &[u8]) -> Result<Request, ExceptionCode> {
    let (&code, body) = pdu.split_first().ok_or(ExceptionCode::IllegalDataValue)?;
    let function = FunctionCode::try_from(code)?;

    let fixed = |body: &[u8]| -> Result<(u16, u16), ExceptionCode> {
        if body.len() != 4 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        Ok((BigEndian::read_u16(&body[0..2]), BigEndian::read_u16(&body[2..4])))
    };
    let quantity_within = |quantity: u16, max: u16| {
        if quantity == 0 || quantity > max {
            Err(ExceptionCode::IllegalDataValue)
        } else {
            Ok(quantity)
        }
    };

    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let (address, quantity) = fixed(body)?;
            let quantity = quantity_within(quantity, MAX_READ_BITS)?;
            Ok(if function == FunctionCode::ReadCoils {
                Request::ReadCoils { address, quantity }
            } else {
                Request::ReadDiscreteInputs { address, quantity }
            })
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let (address, quantity) = fixed(body)?;
            let quantity = quantity_within(quantity, MAX_READ_REGISTERS)?;
            Ok(if function == FunctionCode::ReadHoldingRegisters {
                Request::ReadHoldingRegisters { address, quantity }
            } else {
                Request::ReadInputRegisters { address, quantity }
            })
        }
        FunctionCode::WriteSingleCoil => {
            let (address, raw) = fixed(body)?;
            let value = match raw {
                COIL_ON => true,
                COIL_OFF => false,
                _ => return Err(ExceptionCode::IllegalDataValue),
            };
            Ok(Request::WriteSingleCoil { address, value })
        }
        FunctionCode::WriteSingleRegister => {
            let (address, value) = fixed(body)?;
            Ok(Request::WriteSingleRegister { address, value })
        }
        FunctionCode::WriteMultipleCoils => {
            let (address, quantity, data) = multiple_header(body)?;
            let quantity = quantity_within(quantity, MAX_WRITE_BITS)?;
            if data.len() != usize::from(quantity).div_ceil(8) {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let values = (0..usize::from(quantity))
                .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
                .collect();
            Ok(Request::WriteMultipleCoils { address, values })
        }
        FunctionCode::WriteMultipleRegisters => {
            let (address, quantity, data) = multiple_header(body)?;
            let quantity = quantity_within(quantity, MAX_WRITE_REGISTERS)?;
            if data.len() != usize::from(quantity) * 2 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let values = data.chunks_exact(2).map(BigEndian::read_u16).collect();
            Ok(Request::WriteMultipleRegisters { address, values })
        }
    }
}

/// Address, quantity and data bytes of FC 15/16; the byte count must match
fn multiple_header(body: &[u8]) -> Result<(u16, u16, &[u8]), ExceptionCode> {
    if body.len() < 5 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let address = BigEndian::read_u16(&body[0..2]);
    let quantity = BigEndian::read_u16(&body[2..4]);
    let byte_count = usize::from(body[4]);
    let data = &body[5..];
    if data.len() != byte_count {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((address, quantity, data))
}

/// Encode a full MBAP frame echoing the request's transaction and unit ids
pub fn encode_response(request: &MbapHeader, response: &Response) -> Vec<u8> {
    let mut pdu: Vec<u8> = Vec::with_capacity(8);
    match response {
        Response::Bits { function, values } => {
            pdu.push(*function as u8);
            let mut packed = vec![0u8; values.len().div_ceil(8)];
            for (i, _) in values.iter().enumerate().filter(|(_, on)| **on) {
                packed[i / 8] |= 1 << (i % 8);
            }
            pdu.push(packed.len() as u8);
            pdu.extend_from_slice(&packed);
        }
        Response::Registers { function, values } => {
            pdu.push(*function as u8);
            pdu.push((values.len() * 2) as u8);
            for value in values {
                put_u16(&mut pdu, *value);
            }
        }
        Response::WriteSingle {
            function,
            address,
            value,
        } => {
            pdu.push(*function as u8);
            put_u16(&mut pdu, *address);
            put_u16(&mut pdu, *value);
        }
        Response::WriteMultiple {
            function,
            address,
            quantity,
        } => {
            pdu.push(*function as u8);
            put_u16(&mut pdu, *address);
            put_u16(&mut pdu, *quantity);
        }
        Response::Exception { function, code } => {
            pdu.push(function | 0x80);
            pdu.push(*code as u8);
        }
    }

    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    put_u16(&mut frame, request.transaction_id);
    put_u16(&mut frame, 0);
    put_u16(&mut frame, pdu.len() as u16 + 1);
    frame.push(request.unit_id);
    frame.extend_from_slice(&pdu);
    frame
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    let mut word = [0u8; 2];
    BigEndian::write_u16(&mut word, value);
    buf.extend_from_slice(&word);
}

pub(super) fn coil_word(value: bool) -> u16 {
    if value {
        COIL_ON
    } else {
        COIL_OFF
    }
}
