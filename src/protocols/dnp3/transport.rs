//! Transport function: one header octet per link frame.

use tracing::trace;

pub const FIN: u8 = 0x80;
pub const FIR: u8 = 0x40;
const SEQ_MASK: u8 = 0x3F;
/// Link user data minus the transport header
pub const MAX_SEGMENT_PAYLOAD: usize = 249;
/// Largest request fragment accepted from a master
pub const MAX_FRAGMENT: usize = 2048;

/// Rebuilds application fragments from transport segments
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    last_seq: Option<u8>,
}

impl Reassembler {
    /// Feed one segment, returning a complete fragment once FIN arrives
    pub fn push(&mut self, segment: &[u8]) -> Option<Vec<u8>> {
        let (&header, payload) = segment.split_first()?;
        let seq = header & SEQ_MASK;

        if header & FIR != 0 {
            self.buffer.clear();
        } else {
            match self.last_seq {
                Some(last) if (last + 1) & SEQ_MASK == seq => {}
                _ => {
                    trace!(seq, "out of sequence transport segment dropped");
                    self.reset();
                    return None;
                }
            }
        }

        if self.buffer.len() + payload.len() > MAX_FRAGMENT {
            trace!("oversized fragment dropped");
            self.reset();
            return None;
        }
        self.buffer.extend_from_slice(payload);
        self.last_seq = Some(seq);

        if header & FIN != 0 {
            self.last_seq = None;
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_seq = None;
    }
}

/// Split a fragment into transport segments starting at `seq`.
///
/// Returns the segments and the next sequence number to use.
pub fn segment(fragment: &[u8], seq: u8) -> (Vec<Vec<u8>>, u8) {
    let mut seq = seq & SEQ_MASK;
    if fragment.is_empty() {
        return (vec![vec![FIR | FIN | seq]], (seq + 1) & SEQ_MASK);
    }

    let chunks: Vec<&[u8]> = fragment.chunks(MAX_SEGMENT_PAYLOAD).collect();
    let last = chunks.len() - 1;
    let mut segments = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        let mut header = seq;
        if i == 0 {
            header |= FIR;
        }
        if i == last {
            header |= FIN;
        }
        let mut out = Vec::with_capacity(chunk.len() + 1);
        out.push(header);
        out.extend_from_slice(chunk);
        segments.push(out);
        seq = (seq + 1) & SEQ_MASK;
    }
    (segments, seq)
}
