//! FT3 link frames.

use super::crc;
use crate::error::ProtocolDecodeError;

pub const START: [u8; 2] = [0x05, 0x64];
/// Start octets, length, control, destination, source and header CRC
pub const HEADER_LEN: usize = 10;
pub const BLOCK_LEN: usize = 16;
/// LEN field counts control and both addresses
const LEN_OVERHEAD: usize = 5;
pub const MAX_USER_DATA: usize = 250;

pub const DIR: u8 = 0x80;
pub const PRM: u8 = 0x40;
pub const FCB: u8 = 0x20;
pub const FCV: u8 = 0x10;
const FUNCTION_MASK: u8 = 0x0F;

/// Lowest destination accepted as broadcast
pub const BROADCAST_MIN: u16 = 0xFFFD;

/// Link function codes
pub mod function {
    pub const RESET_LINK_STATES: u8 = 0;
    pub const TEST_LINK_STATES: u8 = 2;
    pub const CONFIRMED_USER_DATA: u8 = 3;
    pub const UNCONFIRMED_USER_DATA: u8 = 4;
    pub const REQUEST_LINK_STATUS: u8 = 9;

    pub const ACK: u8 = 0;
    pub const NACK: u8 = 1;
    pub const LINK_STATUS: u8 = 11;
    pub const NOT_SUPPORTED: u8 = 15;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFrame {
    pub control: u8,
    pub destination: u16,
    pub source: u16,
    pub data: Vec<u8>,
}

/// Outcome of scanning a receive buffer for one frame
#[derive(Debug, PartialEq, Eq)]
pub enum LinkParse {
    Frame(LinkFrame, usize),
    /// Drop this many bytes and keep scanning
    Skip(usize, ProtocolDecodeError),
    Incomplete,
}

impl LinkFrame {
    pub fn new(control: u8, destination: u16, source: u16, data: Vec<u8>) -> Self {
        Self {
            control,
            destination,
            source,
            data,
        }
    }

    pub fn function(&self) -> u8 {
        self.control & FUNCTION_MASK
    }

    pub fn is_primary(&self) -> bool {
        self.control & PRM != 0
    }

    pub fn fcb(&self) -> bool {
        self.control & FCB != 0
    }

    pub fn fcv(&self) -> bool {
        self.control & FCV != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination >= BROADCAST_MIN
    }

    pub fn encode(&self) -> Vec<u8> {
        let data = &self.data[..self.data.len().min(MAX_USER_DATA)];
        let blocks = data.len().div_ceil(BLOCK_LEN);
        let mut out = Vec::with_capacity(HEADER_LEN + data.len() + 2 * blocks);

        out.extend_from_slice(&START);
        out.push((LEN_OVERHEAD + data.len()) as u8);
        out.push(self.control);
        out.extend_from_slice(&self.destination.to_le_bytes());
        out.extend_from_slice(&self.source.to_le_bytes());
        let header = out.clone();
        crc::push_crc(&mut out, &header);

        for block in data.chunks(BLOCK_LEN) {
            out.extend_from_slice(block);
            crc::push_crc(&mut out, block);
        }
        out
    }
}

/// Total frame size for a LEN field value
pub fn frame_len(len_field: u8) -> usize {
    let data = usize::from(len_field).saturating_sub(LEN_OVERHEAD);
    HEADER_LEN + data + 2 * data.div_ceil(BLOCK_LEN)
}

/// Scan the front of `buf` for one frame
pub fn parse_frame(buf: &[u8]) -> LinkParse {
    if buf.len() < START.len() {
        return LinkParse::Incomplete;
    }
    if buf[..2] != START {
        return LinkParse::Skip(1, ProtocolDecodeError::BadStart);
    }
    if buf.len() < HEADER_LEN {
        return LinkParse::Incomplete;
    }
    if !crc::check(&buf[..8], &buf[8..10]) {
        return LinkParse::Skip(1, ProtocolDecodeError::Crc);
    }
    let len_field = buf[2];
    if usize::from(len_field) < LEN_OVERHEAD {
        return LinkParse::Skip(HEADER_LEN, ProtocolDecodeError::InvalidLength(len_field.into()));
    }

    let total = frame_len(len_field);
    if buf.len() < total {
        return LinkParse::Incomplete;
    }

    let data_len = usize::from(len_field) - LEN_OVERHEAD;
    let mut data = Vec::with_capacity(data_len);
    let mut pos = HEADER_LEN;
    let mut remaining = data_len;
    while remaining > 0 {
        let n = remaining.min(BLOCK_LEN);
        let block = &buf[pos..pos + n];
        if !crc::check(block, &buf[pos + n..pos + n + 2]) {
            return LinkParse::Skip(total, ProtocolDecodeError::Crc);
        }
        data.extend_from_slice(block);
        pos += n + 2;
        remaining -= n;
    }

    let frame = LinkFrame {
        control: buf[3],
        destination: u16::from_le_bytes([buf[4], buf[5]]),
        source: u16::from_le_bytes([buf[6], buf[7]]),
        data,
    };
    LinkParse::Frame(frame, total)
}
