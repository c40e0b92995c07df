//! Application layer: request parsing and response encoding.

use byteorder::{LittleEndian, ReadBytesExt};

use super::ControlStatus;
use crate::error::ProtocolDecodeError;

const FIR: u8 = 0x80;
const FIN: u8 = 0x40;
const CON: u8 = 0x20;
const UNS: u8 = 0x10;
const SEQ_MASK: u8 = 0x0F;

pub const APP_HEADER_LEN: usize = 2;
pub const RESPONSE_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    Confirm = 0,
    Read = 1,
    Write = 2,
    Select = 3,
    Operate = 4,
    DirectOperate = 5,
    DirectOperateNoResponse = 6,
    EnableUnsolicited = 20,
    DisableUnsolicited = 21,
    Response = 129,
    UnsolicitedResponse = 130,
}

impl FunctionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => FunctionCode::Confirm,
            1 => FunctionCode::Read,
            2 => FunctionCode::Write,
            3 => FunctionCode::Select,
            4 => FunctionCode::Operate,
            5 => FunctionCode::DirectOperate,
            6 => FunctionCode::DirectOperateNoResponse,
            20 => FunctionCode::EnableUnsolicited,
            21 => FunctionCode::DisableUnsolicited,
            129 => FunctionCode::Response,
            130 => FunctionCode::UnsolicitedResponse,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppControl {
    pub fir: bool,
    pub fin: bool,
    pub con: bool,
    pub uns: bool,
    pub seq: u8,
}

impl AppControl {
    pub fn parse(byte: u8) -> Self {
        Self {
            fir: byte & FIR != 0,
            fin: byte & FIN != 0,
            con: byte & CON != 0,
            uns: byte & UNS != 0,
            seq: byte & SEQ_MASK,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = self.seq & SEQ_MASK;
        if self.fir {
            byte |= FIR;
        }
        if self.fin {
            byte |= FIN;
        }
        if self.con {
            byte |= CON;
        }
        if self.uns {
            byte |= UNS;
        }
        byte
    }

    /// Single-fragment solicited response
    pub fn response(seq: u8) -> Self {
        Self {
            fir: true,
            fin: true,
            con: false,
            uns: false,
            seq,
        }
    }

    pub fn unsolicited(seq: u8) -> Self {
        Self {
            fir: true,
            fin: true,
            con: true,
            uns: true,
            seq,
        }
    }
}

pub fn next_seq(seq: u8) -> u8 {
    (seq + 1) & SEQ_MASK
}

/// Internal indications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Iin {
    pub iin1: u8,
    pub iin2: u8,
}

pub mod iin1 {
    pub const ALL_STATIONS: u8 = 0x01;
    pub const CLASS_1_EVENTS: u8 = 0x02;
    pub const CLASS_2_EVENTS: u8 = 0x04;
    pub const CLASS_3_EVENTS: u8 = 0x08;
    pub const DEVICE_TROUBLE: u8 = 0x40;
    pub const DEVICE_RESTART: u8 = 0x80;
}

pub mod iin2 {
    pub const NO_FUNC_CODE_SUPPORT: u8 = 0x01;
    pub const OBJECT_UNKNOWN: u8 = 0x02;
    pub const PARAMETER_ERROR: u8 = 0x04;
    pub const EVENT_BUFFER_OVERFLOW: u8 = 0x08;
}

impl Iin {
    /// IIN2 bit reported for a request that failed to parse
    pub fn from_decode_error(err: &ProtocolDecodeError) -> Self {
        let iin2 = match err {
            ProtocolDecodeError::UnknownObject { .. } => iin2::OBJECT_UNKNOWN,
            _ => iin2::PARAMETER_ERROR,
        };
        Self { iin1: 0, iin2 }
    }
}

impl std::ops::BitOrAssign for Iin {
    fn bitor_assign(&mut self, rhs: Self) {
        self.iin1 |= rhs.iin1;
        self.iin2 |= rhs.iin2;
    }
}

/// Object quality flags
pub mod flags {
    pub const ONLINE: u8 = 0x01;
    pub const OVER_RANGE: u8 = 0x20;
    pub const STATE: u8 = 0x80;
}

pub mod qualifier {
    pub const RANGE_8: u8 = 0x00;
    pub const RANGE_16: u8 = 0x01;
    pub const ALL: u8 = 0x06;
    pub const COUNT_8: u8 = 0x07;
    pub const COUNT_16: u8 = 0x08;
    pub const INDEX_8: u8 = 0x17;
    pub const INDEX_16: u8 = 0x28;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Range {
    All,
    StartStop { start: u16, stop: u16 },
    Count(u16),
    Indices(Vec<u16>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub group: u8,
    pub variation: u8,
    pub range: Range,
}

/// Parsed request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub control: AppControl,
    pub function: u8,
    pub objects: &'a [u8],
}

pub fn parse_request(apdu: &[u8]) -> Result<Request<'_>, ProtocolDecodeError> {
    if apdu.len() < APP_HEADER_LEN {
        return Err(ProtocolDecodeError::Truncated {
            needed: APP_HEADER_LEN,
            actual: apdu.len(),
        });
    }
    Ok(Request {
        control: AppControl::parse(apdu[0]),
        function: apdu[1],
        objects: &apdu[APP_HEADER_LEN..],
    })
}

fn truncated(_: std::io::Error) -> ProtocolDecodeError {
    ProtocolDecodeError::Malformed("object header truncated")
}

fn read_start_stop(rd: &mut &[u8], wide: bool) -> Result<(u16, u16), ProtocolDecodeError> {
    let (start, stop) = if wide {
        (
            rd.read_u16::<LittleEndian>().map_err(truncated)?,
            rd.read_u16::<LittleEndian>().map_err(truncated)?,
        )
    } else {
        (
            u16::from(rd.read_u8().map_err(truncated)?),
            u16::from(rd.read_u8().map_err(truncated)?),
        )
    };
    if stop < start {
        return Err(ProtocolDecodeError::Malformed("range stop before start"));
    }
    Ok((start, stop))
}

fn read_count(rd: &mut &[u8], wide: bool) -> Result<u16, ProtocolDecodeError> {
    if wide {
        rd.read_u16::<LittleEndian>().map_err(truncated)
    } else {
        rd.read_u8().map(u16::from).map_err(truncated)
    }
}

fn read_index(rd: &mut &[u8], wide: bool) -> Result<u16, ProtocolDecodeError> {
    read_count(rd, wide)
}

/// Object headers of a request that carries no object data (READ, class masks)
pub fn parse_headers(body: &[u8]) -> Result<Vec<ObjectHeader>, ProtocolDecodeError> {
    let mut rd = body;
    let mut headers = Vec::new();
    while !rd.is_empty() {
        let group = rd.read_u8().map_err(truncated)?;
        let variation = rd.read_u8().map_err(truncated)?;
        let qualifier = rd.read_u8().map_err(truncated)?;
        let range = match qualifier {
            qualifier::RANGE_8 | qualifier::RANGE_16 => {
                let (start, stop) = read_start_stop(&mut rd, qualifier == qualifier::RANGE_16)?;
                Range::StartStop { start, stop }
            }
            qualifier::ALL => Range::All,
            qualifier::COUNT_8 | qualifier::COUNT_16 => {
                Range::Count(read_count(&mut rd, qualifier == qualifier::COUNT_16)?)
            }
            qualifier::INDEX_8 | qualifier::INDEX_16 => {
                let wide = qualifier == qualifier::INDEX_16;
                let count = read_count(&mut rd, wide)?;
                let indices = (0..count)
                    .map(|_| read_index(&mut rd, wide))
                    .collect::<Result<Vec<_>, _>>()?;
                Range::Indices(indices)
            }
            other => return Err(ProtocolDecodeError::Qualifier(other)),
        };
        headers.push(ObjectHeader {
            group,
            variation,
            range,
        });
    }
    Ok(headers)
}

/// Control relay output block (g12v1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crob {
    pub code: u8,
    pub count: u8,
    pub on_ms: u32,
    pub off_ms: u32,
}

pub mod crob {
    pub const PULSE_ON: u8 = 0x01;
    pub const LATCH_ON: u8 = 0x03;
    pub const LATCH_OFF: u8 = 0x04;
    pub const CLOSE: u8 = 0x40;
    pub const TRIP: u8 = 0x80;
}

impl Crob {
    /// Breaker position requested by this operation
    pub fn breaker_closed(&self) -> Result<bool, ControlStatus> {
        if self.count == 0 {
            return Err(ControlStatus::FormatError);
        }
        // queue and clear bits are not supported
        if self.code & 0x30 != 0 {
            return Err(ControlStatus::NotSupported);
        }
        match (self.code & 0xC0, self.code & 0x0F) {
            (crob::CLOSE, crob::PULSE_ON) | (0, crob::LATCH_ON) => Ok(true),
            (crob::TRIP, crob::PULSE_ON) | (0, crob::LATCH_OFF) => Ok(false),
            _ => Err(ControlStatus::NotSupported),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    Crob(Crob),
    Analog(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlItem {
    pub index: u16,
    pub control: Control,
    /// Object bytes without the trailing status octet
    raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlHeader {
    pub group: u8,
    pub variation: u8,
    pub qualifier: u8,
    pub items: Vec<ControlItem>,
}

/// Object size including the status octet
fn control_size(group: u8, variation: u8) -> Result<usize, ProtocolDecodeError> {
    match (group, variation) {
        (12, 1) => Ok(11),
        (41, 1) => Ok(5),
        (41, 2) => Ok(3),
        (41, 3) => Ok(5),
        (41, 4) => Ok(9),
        _ => Err(ProtocolDecodeError::UnknownObject { group, variation }),
    }
}

fn decode_control(group: u8, variation: u8, mut raw: &[u8]) -> Result<Control, ProtocolDecodeError> {
    let rd = &mut raw;
    Ok(match (group, variation) {
        (12, 1) => Control::Crob(Crob {
            code: rd.read_u8().map_err(truncated)?,
            count: rd.read_u8().map_err(truncated)?,
            on_ms: rd.read_u32::<LittleEndian>().map_err(truncated)?,
            off_ms: rd.read_u32::<LittleEndian>().map_err(truncated)?,
        }),
        (41, 1) => Control::Analog(f64::from(rd.read_i32::<LittleEndian>().map_err(truncated)?)),
        (41, 2) => Control::Analog(f64::from(rd.read_i16::<LittleEndian>().map_err(truncated)?)),
        (41, 3) => Control::Analog(f64::from(rd.read_f32::<LittleEndian>().map_err(truncated)?)),
        (41, 4) => Control::Analog(rd.read_f64::<LittleEndian>().map_err(truncated)?),
        _ => return Err(ProtocolDecodeError::UnknownObject { group, variation }),
    })
}

/// Object headers of SELECT, OPERATE and DIRECT_OPERATE requests
pub fn parse_controls(body: &[u8]) -> Result<Vec<ControlHeader>, ProtocolDecodeError> {
    let mut rd = body;
    let mut headers = Vec::new();
    while !rd.is_empty() {
        let group = rd.read_u8().map_err(truncated)?;
        let variation = rd.read_u8().map_err(truncated)?;
        let qualifier = rd.read_u8().map_err(truncated)?;
        let size = control_size(group, variation)?;

        let indices: Vec<Option<u16>> = match qualifier {
            qualifier::INDEX_8 | qualifier::INDEX_16 => {
                let count = read_count(&mut rd, qualifier == qualifier::INDEX_16)?;
                vec![None; usize::from(count)]
            }
            qualifier::RANGE_8 | qualifier::RANGE_16 => {
                let (start, stop) = read_start_stop(&mut rd, qualifier == qualifier::RANGE_16)?;
                (start..=stop).map(Some).collect()
            }
            other => return Err(ProtocolDecodeError::Qualifier(other)),
        };

        let mut items = Vec::with_capacity(indices.len());
        for index in indices {
            let index = match index {
                Some(index) => index,
                None => read_index(&mut rd, qualifier == qualifier::INDEX_16)?,
            };
            if rd.len() < size {
                return Err(ProtocolDecodeError::Malformed("control object truncated"));
            }
            let (object, rest) = rd.split_at(size);
            rd = rest;
            let raw = object[..size - 1].to_vec();
            items.push(ControlItem {
                index,
                control: decode_control(group, variation, &raw)?,
                raw,
            });
        }
        headers.push(ControlHeader {
            group,
            variation,
            qualifier,
            items,
        });
    }
    Ok(headers)
}

/// Index/value pairs of a WRITE to g80v1
pub fn parse_iin_write(body: &[u8]) -> Result<Vec<(u16, bool)>, ProtocolDecodeError> {
    let mut rd = body;
    let mut bits = Vec::new();
    while !rd.is_empty() {
        let group = rd.read_u8().map_err(truncated)?;
        let variation = rd.read_u8().map_err(truncated)?;
        let qualifier = rd.read_u8().map_err(truncated)?;
        if (group, variation) != (80, 1) {
            return Err(ProtocolDecodeError::UnknownObject { group, variation });
        }
        let (start, stop) = match qualifier {
            qualifier::RANGE_8 | qualifier::RANGE_16 => {
                read_start_stop(&mut rd, qualifier == qualifier::RANGE_16)?
            }
            other => return Err(ProtocolDecodeError::Qualifier(other)),
        };
        let count = usize::from(stop - start) + 1;
        let packed = count.div_ceil(8);
        if rd.len() < packed {
            return Err(ProtocolDecodeError::Malformed("packed bits truncated"));
        }
        let (data, rest) = rd.split_at(packed);
        rd = rest;
        for offset in 0..count {
            let on = data[offset / 8] & (1 << (offset % 8)) != 0;
            bits.push((start + offset as u16, on));
        }
    }
    Ok(bits)
}

/// Largest application fragment sent to a master
pub const MAX_RESPONSE_FRAGMENT: usize = 2048;

/// Objects under one header, kept apart so a response can be split
#[derive(Debug)]
enum Block {
    /// Contiguous objects from `start`, qualifier 0x01
    Range {
        group: u8,
        variation: u8,
        start: u16,
        size: usize,
        data: Vec<u8>,
    },
    /// Objects each prefixed by a 16-bit index, qualifier 0x28
    Indexed {
        group: u8,
        variation: u8,
        size: usize,
        data: Vec<u8>,
    },
    /// Headers and objects that go out as written
    Raw(Vec<u8>),
}

impl Block {
    fn data_mut(&mut self) -> &mut Vec<u8> {
        match self {
            Block::Range { data, .. } | Block::Indexed { data, .. } | Block::Raw(data) => data,
        }
    }

    fn header_len(&self) -> usize {
        match self {
            Block::Range { .. } => 7,
            Block::Indexed { .. } => 5,
            Block::Raw(_) => 0,
        }
    }

    /// Bytes per object, index prefix included
    fn unit_len(&self) -> usize {
        match self {
            Block::Range { size, .. } => (*size).max(1),
            Block::Indexed { size, .. } => size + 2,
            Block::Raw(data) => data.len().max(1),
        }
    }

    fn count(&self) -> usize {
        match self {
            Block::Range { data, .. } | Block::Indexed { data, .. } => data.len() / self.unit_len(),
            Block::Raw(data) => usize::from(!data.is_empty()),
        }
    }

    /// Encode objects `first..first + n` under their own header
    fn encode(&self, first: usize, n: usize, out: &mut Vec<u8>) {
        let unit = self.unit_len();
        match self {
            Block::Range {
                group,
                variation,
                start,
                data,
                ..
            } => {
                let from = start.wrapping_add(first as u16);
                out.extend_from_slice(&[*group, *variation, qualifier::RANGE_16]);
                out.extend_from_slice(&from.to_le_bytes());
                out.extend_from_slice(&from.wrapping_add(n as u16 - 1).to_le_bytes());
                out.extend_from_slice(&data[first * unit..(first + n) * unit]);
            }
            Block::Indexed {
                group,
                variation,
                data,
                ..
            } => {
                out.extend_from_slice(&[*group, *variation, qualifier::INDEX_16]);
                out.extend_from_slice(&(n as u16).to_le_bytes());
                out.extend_from_slice(&data[first * unit..(first + n) * unit]);
            }
            Block::Raw(data) => out.extend_from_slice(data),
        }
    }
}

/// Builds a response. Objects are appended to the most recent header.
#[derive(Debug)]
pub struct ResponseWriter {
    control: AppControl,
    function: FunctionCode,
    iin: Iin,
    blocks: Vec<Block>,
}

impl ResponseWriter {
    pub fn new(control: AppControl, function: FunctionCode) -> Self {
        Self {
            control,
            function,
            iin: Iin::default(),
            blocks: Vec::new(),
        }
    }

    pub fn set_iin(&mut self, iin: Iin) {
        self.iin = iin;
    }

    pub fn request_confirm(&mut self) {
        self.control.con = true;
    }

    pub fn has_objects(&self) -> bool {
        self.blocks.iter().any(|b| b.count() > 0)
    }

    /// Header for a contiguous run of `size`-byte objects starting at `start`
    pub fn range_header(&mut self, group: u8, variation: u8, start: u16, size: usize) {
        self.blocks.push(Block::Range {
            group,
            variation,
            start,
            size,
            data: Vec::new(),
        });
    }

    /// Header for index-prefixed objects; write each index with [`Self::u16`]
    pub fn indexed_header(&mut self, group: u8, variation: u8, size: usize) {
        self.blocks.push(Block::Indexed {
            group,
            variation,
            size,
            data: Vec::new(),
        });
    }

    fn data(&mut self) -> &mut Vec<u8> {
        if self.blocks.is_empty() {
            self.blocks.push(Block::Raw(Vec::new()));
        }
        let last = self.blocks.len() - 1;
        self.blocks[last].data_mut()
    }

    pub fn u8(&mut self, value: u8) {
        self.data().push(value);
    }

    pub fn u16(&mut self, value: u16) {
        self.data().extend_from_slice(&value.to_le_bytes());
    }

    pub fn i32(&mut self, value: i32) {
        self.data().extend_from_slice(&value.to_le_bytes());
    }

    pub fn f32(&mut self, value: f32) {
        self.data().extend_from_slice(&value.to_le_bytes());
    }

    /// Echo control headers with a status per item, in request order
    pub fn control_echo(&mut self, headers: &[ControlHeader], statuses: &[ControlStatus]) {
        let mut out = Vec::new();
        let mut statuses = statuses.iter();
        for header in headers {
            out.extend_from_slice(&[header.group, header.variation, header.qualifier]);
            let first = header.items.first().map(|i| i.index).unwrap_or_default();
            let last = header.items.last().map(|i| i.index).unwrap_or_default();
            let count = header.items.len();
            match header.qualifier {
                qualifier::INDEX_8 => out.push(count as u8),
                qualifier::INDEX_16 => out.extend_from_slice(&(count as u16).to_le_bytes()),
                qualifier::RANGE_8 => out.extend_from_slice(&[first as u8, last as u8]),
                _ => {
                    out.extend_from_slice(&first.to_le_bytes());
                    out.extend_from_slice(&last.to_le_bytes());
                }
            }
            for item in &header.items {
                match header.qualifier {
                    qualifier::INDEX_8 => out.push(item.index as u8),
                    qualifier::INDEX_16 => out.extend_from_slice(&item.index.to_le_bytes()),
                    _ => {}
                }
                out.extend_from_slice(&item.raw);
                let status = statuses.next().copied().unwrap_or(ControlStatus::NotSupported);
                out.push(status as u8);
            }
        }
        self.blocks.push(Block::Raw(out));
    }

    fn header(&self, control: AppControl) -> [u8; RESPONSE_HEADER_LEN] {
        [control.to_byte(), self.function as u8, self.iin.iin1, self.iin.iin2]
    }

    /// The whole response as one fragment
    pub fn finish(self) -> Vec<u8> {
        let mut out = self.header(self.control).to_vec();
        for block in self.blocks.iter().filter(|b| b.count() > 0) {
            block.encode(0, block.count(), &mut out);
        }
        out
    }

    /// Split the response into fragments of at most `max` bytes.
    ///
    /// Headers are repeated with adjusted ranges and counts where a run of
    /// objects crosses a fragment boundary. Every fragment but the last asks
    /// for confirmation, and sequence numbers advance per fragment.
    pub fn into_fragments(self, max: usize) -> Vec<Vec<u8>> {
        let body_max = max.saturating_sub(RESPONSE_HEADER_LEN).max(1);
        let mut bodies: Vec<Vec<u8>> = Vec::new();
        let mut current = Vec::new();

        for block in &self.blocks {
            let (count, unit, header) = (block.count(), block.unit_len(), block.header_len());
            let mut next = 0;
            while next < count {
                let room = body_max.saturating_sub(current.len());
                let fits = room.saturating_sub(header) / unit;
                if fits == 0 {
                    if current.is_empty() {
                        // oversized object goes out alone
                        block.encode(next, 1, &mut current);
                        next += 1;
                    } else {
                        bodies.push(std::mem::take(&mut current));
                    }
                    continue;
                }
                let n = fits.min(count - next);
                block.encode(next, n, &mut current);
                next += n;
            }
        }
        if !current.is_empty() || bodies.is_empty() {
            bodies.push(current);
        }

        let last = bodies.len() - 1;
        let mut seq = self.control.seq;
        bodies
            .into_iter()
            .enumerate()
            .map(|(i, body)| {
                let control = AppControl {
                    fir: i == 0,
                    fin: i == last,
                    con: self.control.con || i != last,
                    uns: self.control.uns,
                    seq,
                };
                seq = next_seq(seq);
                let mut fragment = self.header(control).to_vec();
                fragment.extend(body);
                fragment
            })
            .collect()
    }
}
