//! Byte <-> septet framing and payload fragmentation.
//!
//! The replicated cells only carry short strings reliably when every
//! character stays inside the 7-bit range, so payload bytes are packed seven
//! at a time into eight 7-bit characters (56 bits exactly). A fixed six
//! character header rides ahead of the data: 14-bit sequence number, 14-bit
//! total payload length, 7-bit fragment index, 7-bit fragment count.

use log::warn;
use thiserror::Error;

use crate::wrapping_number::{sequence_less_than, SEQUENCE_MODULUS};

/// Septet characters consumed by the frame header.
pub const HEADER_CHARS: usize = 6;

const SEPTET_MASK: u64 = 0x7f;

/// Errors produced while framing or parsing transmissions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramerError {
    /// Payload cannot be represented by the header's length/index widths
    #[error("payload of {len} bytes exceeds the framable maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    /// Transmission shorter than the fixed header
    #[error("transmission of {len} chars is shorter than the {HEADER_CHARS} char header")]
    TruncatedFrame { len: usize },
    /// A character outside the 7-bit range appeared on the medium
    #[error("non-septet symbol {code:#x} in transmission")]
    InvalidSymbol { code: u32 },
    /// Data section is not a whole number of 8-character groups
    #[error("data section of {len} chars is not a multiple of 8")]
    RaggedData { len: usize },
}

/// Largest payload the 14-bit length header can describe.
pub const MAX_TOTAL_PAYLOAD: usize = (SEQUENCE_MODULUS - 1) as usize;

const MAX_FRAGMENT_COUNT: usize = 127;

/// Septet data capacity of one channel transmission, given the capacity of a
/// single replicated cell. Data characters come in groups of eight, so the
/// spare remainder after the header is left unused.
pub fn max_fragment_payload(cell_capacity: usize) -> usize {
    ((cell_capacity * 2 - HEADER_CHARS) / 8) * 7
}

/// Packs bytes into 7-bit characters, 7 bytes -> 8 characters per group.
/// The final partial group is padded with zero bytes; the frame header's
/// total length lets the receiver strip the padding.
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() / 7 * 8 + 8);
    for group in data.chunks(7) {
        let mut pack: u64 = 0;
        for i in 0..7 {
            pack = (pack << 8) | u64::from(*group.get(i).unwrap_or(&0));
        }
        for shift in [49u32, 42, 35, 28, 21, 14, 7, 0] {
            let septet = ((pack >> shift) & SEPTET_MASK) as u8;
            out.push(char::from(septet));
        }
    }
    out
}

/// Inverse of [`encode`]: 8 characters -> 7 bytes per group.
pub fn decode(chars: &str) -> Result<Vec<u8>, FramerError> {
    let mut septets = Vec::with_capacity(chars.len());
    for c in chars.chars() {
        let code = c as u32;
        if code > 0x7f {
            return Err(FramerError::InvalidSymbol { code });
        }
        septets.push(code as u64);
    }
    if septets.len() % 8 != 0 {
        return Err(FramerError::RaggedData { len: septets.len() });
    }
    let mut out = Vec::with_capacity(septets.len() / 8 * 7);
    for group in septets.chunks(8) {
        let mut pack: u64 = 0;
        for septet in group {
            pack = (pack << 7) | septet;
        }
        for shift in [48u32, 40, 32, 24, 16, 8, 0] {
            out.push(((pack >> shift) & 0xff) as u8);
        }
    }
    Ok(out)
}

/// One transmissible unit: header fields plus a slice of the logical payload.
/// All fragments of a payload share a sequence number; `count == 1` means
/// the payload was never fragmented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u16,
    pub index: u8,
    pub count: u8,
    pub total_len: u16,
    pub data: Vec<u8>,
}

impl Frame {
    /// Renders the frame as header + encoded data characters, ready to be
    /// split across a channel's cell pair.
    pub fn to_chars(&self) -> String {
        let mut out = String::with_capacity(HEADER_CHARS + self.data.len() / 7 * 8 + 8);
        out.push(char::from(((self.seq >> 7) & 0x7f) as u8));
        out.push(char::from((self.seq & 0x7f) as u8));
        out.push(char::from(((self.total_len >> 7) & 0x7f) as u8));
        out.push(char::from((self.total_len & 0x7f) as u8));
        out.push(char::from(self.index & 0x7f));
        out.push(char::from(self.count & 0x7f));
        out.push_str(&encode(&self.data));
        out
    }

    /// Parses a raw transmission back into a frame. The data section keeps
    /// its zero padding; reassembly strips it using the total length.
    pub fn from_chars(chars: &str) -> Result<Self, FramerError> {
        let mut septets = [0u16; HEADER_CHARS];
        let mut iter = chars.chars();
        for slot in septets.iter_mut() {
            let Some(c) = iter.next() else {
                return Err(FramerError::TruncatedFrame { len: chars.len() });
            };
            let code = c as u32;
            if code > 0x7f {
                return Err(FramerError::InvalidSymbol { code });
            }
            *slot = code as u16;
        }
        // header chars are all single-byte, slicing is safe
        let data = decode(&chars[HEADER_CHARS..])?;
        Ok(Self {
            seq: (septets[0] << 7) | septets[1],
            total_len: (septets[2] << 7) | septets[3],
            index: septets[4] as u8,
            count: septets[5] as u8,
            data,
        })
    }
}

/// Splits a payload into frames of at most `max_payload` bytes, all carrying
/// the given sequence number. `max_payload` must be a multiple of 7 so that
/// every non-final fragment encodes without padding.
pub fn fragment(seq: u16, data: &[u8], max_payload: usize) -> Result<Vec<Frame>, FramerError> {
    debug_assert!(max_payload > 0 && max_payload % 7 == 0);
    if data.len() > MAX_TOTAL_PAYLOAD {
        return Err(FramerError::PayloadTooLarge {
            len: data.len(),
            max: MAX_TOTAL_PAYLOAD,
        });
    }
    let count = data.len().div_ceil(max_payload).max(1);
    if count > MAX_FRAGMENT_COUNT {
        return Err(FramerError::PayloadTooLarge {
            len: data.len(),
            max: MAX_FRAGMENT_COUNT * max_payload,
        });
    }
    let mut frames = Vec::with_capacity(count);
    if data.is_empty() {
        frames.push(Frame {
            seq,
            index: 0,
            count: 1,
            total_len: 0,
            data: Vec::new(),
        });
        return Ok(frames);
    }
    for (index, chunk) in data.chunks(max_payload).enumerate() {
        frames.push(Frame {
            seq,
            index: index as u8,
            count: count as u8,
            total_len: data.len() as u16,
            data: chunk.to_vec(),
        });
    }
    Ok(frames)
}

struct ReassemblySlot {
    seq: u16,
    active: bool,
    complete: bool,
    count: usize,
    total_len: usize,
    received: usize,
    parts: Vec<Option<Box<[u8]>>>,
}

impl ReassemblySlot {
    fn empty() -> Self {
        Self {
            seq: 0,
            active: false,
            complete: false,
            count: 0,
            total_len: 0,
            received: 0,
            parts: Vec::new(),
        }
    }

    fn reset_for(&mut self, frame: &Frame) {
        self.seq = frame.seq;
        self.active = true;
        self.complete = false;
        self.count = frame.count as usize;
        self.total_len = frame.total_len as usize;
        self.received = 0;
        self.parts = vec![None; self.count];
    }
}

/// Reassembles fragmented payloads arriving out of order across channels.
///
/// A fixed pool of slots tracks in-progress sequences, one slot claimed per
/// sequence number. When every slot is busy and a newer sequence arrives,
/// the stalest in-progress sequence is discarded; that loss is accepted by
/// design, the transport is best effort.
pub struct Reassembler {
    slots: Vec<ReassemblySlot>,
}

impl Reassembler {
    pub fn new(slot_count: usize) -> Self {
        let mut slots = Vec::with_capacity(slot_count.max(1));
        for _ in 0..slot_count.max(1) {
            slots.push(ReassemblySlot::empty());
        }
        Self { slots }
    }

    /// Feeds one frame in; returns the whole payload exactly once, when the
    /// final missing fragment for its sequence arrives. Duplicate fragments
    /// and fragments of already-delivered sequences are dropped.
    pub fn feed(&mut self, frame: Frame) -> Option<Vec<u8>> {
        if frame.count == 0 || frame.index >= frame.count {
            warn!(
                "dropping malformed frame: index {} of {}",
                frame.index, frame.count
            );
            return None;
        }
        let slot_idx = self.claim_slot(&frame);
        let slot = &mut self.slots[slot_idx];
        if slot.complete {
            // whole payload already delivered, this is a straggler
            return None;
        }
        if frame.count as usize != slot.count || frame.total_len as usize != slot.total_len {
            warn!(
                "fragment header mismatch on seq {}: restarting reassembly",
                frame.seq
            );
            slot.reset_for(&frame);
        }
        let slot = &mut self.slots[slot_idx];
        let index = frame.index as usize;
        if slot.parts[index].is_some() {
            return None;
        }
        slot.parts[index] = Some(frame.data.into_boxed_slice());
        slot.received += 1;
        if slot.received < slot.count {
            return None;
        }

        // every index observed: join and strip the final group's padding
        slot.complete = true;
        let mut payload = Vec::with_capacity(slot.total_len);
        for part in &mut slot.parts {
            if let Some(bytes) = part.take() {
                payload.extend_from_slice(&bytes);
            }
        }
        payload.truncate(slot.total_len);
        Some(payload)
    }

    fn claim_slot(&mut self, frame: &Frame) -> usize {
        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.active && s.seq == frame.seq)
        {
            return idx;
        }
        let idx = match self.slots.iter().position(|s| !s.active || s.complete) {
            Some(idx) => idx,
            None => {
                // all slots mid-reassembly: evict the stalest sequence
                let mut oldest = 0;
                for i in 1..self.slots.len() {
                    if sequence_less_than(self.slots[i].seq, self.slots[oldest].seq) {
                        oldest = i;
                    }
                }
                warn!(
                    "discarding partial payload seq {} for newer seq {}",
                    self.slots[oldest].seq, frame.seq
                );
                oldest
            }
        };
        self.slots[idx].reset_for(frame);
        idx
    }
}
