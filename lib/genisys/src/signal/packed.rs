use crate::shared::{WireError, WireResult};
use crate::signal::{ControlSet, IndicationSet, SignalSet, SignalValue};
use crate::wire::codec::{ControlCodec, IndicationDecoder};

/// Number of payload bytes carrying `len` bit-packed positions.
#[inline]
pub fn packed_len(len: usize) -> usize {
    (len + 7) / 8
}

/// Default wire binding: position `i` is bit `i % 8` of byte `i / 8`,
/// little-endian within the byte. A set bit is TRUE, an absent bit is FALSE,
/// so a decoded set is always fully materialized. Padding bits in the final
/// byte are masked off; a payload longer than the capacity is a defect.
fn decode_packed<K>(payload: &[u8], capacity: usize) -> WireResult<SignalSet<K>> {
    if payload.len() > packed_len(capacity) {
        return Err(WireError::PayloadOverrun);
    }

    let mut set = SignalSet::all_false(capacity);

    for position in 0..capacity {
        let byte = position / 8;

        if byte >= payload.len() {
            break;
        }

        if payload[byte] & (1 << (position % 8)) != 0 {
            set.set(position, SignalValue::True);
        }
    }

    Ok(set)
}

fn encode_packed<K>(set: &SignalSet<K>) -> Vec<u8> {
    let mut bytes = vec![0u8; packed_len(set.len())];

    for position in 0..set.len() {
        if set.get(position) == SignalValue::True {
            bytes[position / 8] |= 1 << (position % 8);
        }
    }

    bytes
}

/// Bit-packed indication payload decoder sized to the indication catalog.
pub struct PackedIndicationDecoder {
    capacity: usize,
}

impl PackedIndicationDecoder {
    #[inline]
    pub fn new(capacity: usize) -> PackedIndicationDecoder {
        PackedIndicationDecoder { capacity }
    }
}

impl IndicationDecoder for PackedIndicationDecoder {
    fn decode(&self, payload: &[u8]) -> WireResult<IndicationSet> {
        decode_packed(payload, self.capacity)
    }
}

/// Bit-packed control payload codec sized to the control catalog.
pub struct PackedControlCodec {
    capacity: usize,
}

impl PackedControlCodec {
    #[inline]
    pub fn new(capacity: usize) -> PackedControlCodec {
        PackedControlCodec { capacity }
    }
}

impl ControlCodec for PackedControlCodec {
    fn encode(&self, controls: &ControlSet) -> Vec<u8> {
        encode_packed(controls)
    }

    fn decode(&self, payload: &[u8]) -> WireResult<ControlSet> {
        decode_packed(payload, self.capacity)
    }
}
