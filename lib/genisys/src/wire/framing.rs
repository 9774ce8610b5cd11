use crate::shared::{WireError, WireResult};
use crate::wire::message::{crc_rule, CrcRule};
use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, Table, CRC_16_ARC};

/// Escape marker. Any body byte in `0xF0-0xFF` travels as the two-byte
/// sequence `{0xF0, value - 0xF0}` so that headers and the terminator stay
/// unique on the wire.
pub const ESCAPE: u8 = 0xF0;

/// End-of-frame marker, outside the CRC and never escaped.
pub const TERMINATOR: u8 = 0xF6;

const WIRE_CRC: Crc<u16, Table<1>> = Crc::<u16, Table<1>>::new(&CRC_16_ARC);

/// A validated wire frame. Constructed only by `decode` after framing and CRC
/// checks pass; the semantic codec consumes it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub header: u8,
    pub station: u8,
    pub payload: Vec<u8>,
    pub crc_present: bool,
}

/// True for bytes in the header range `0xF1-0xFE`, excluding the terminator.
#[inline]
pub fn is_header(byte: u8) -> bool {
    byte >= 0xF1 && byte <= 0xFE && byte != TERMINATOR
}

/// CRC-16/ARC over the unescaped body (header, station, payload).
#[inline]
pub fn checksum(body: &[u8]) -> u16 {
    WIRE_CRC.checksum(body)
}

/// Applies byte stuffing to `data`, appending to `out`.
pub fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &byte in data {
        if byte >= ESCAPE {
            out.push(ESCAPE);
            out.push(byte - ESCAPE);
        } else {
            out.push(byte);
        }
    }
}

/// Reverses byte stuffing. An escape byte with nothing after it is a framing
/// defect.
pub fn unescape(data: &[u8]) -> WireResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter();

    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            match bytes.next() {
                Some(&low) => out.push(ESCAPE.wrapping_add(low)),
                None => return Err(WireError::DanglingEscape),
            }
        } else {
            out.push(byte);
        }
    }

    Ok(out)
}

/// Builds wire-ready bytes: literal header, escaped station/payload/CRC,
/// terminator. The CRC is appended big-endian before escaping.
pub fn encode(header: u8, station: u8, payload: &[u8], with_crc: bool) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 4);
    body.push(header);
    body.push(station);
    body.extend_from_slice(payload);

    if with_crc {
        let mut crc_bytes = [0u8; 2];
        BigEndian::write_u16(&mut crc_bytes, checksum(&body));
        body.extend_from_slice(&crc_bytes);
    }

    let mut wire = Vec::with_capacity(body.len() * 2 + 1);
    wire.push(header);
    escape_into(&body[1..], &mut wire);
    wire.push(TERMINATOR);

    wire
}

/// Decodes one datagram into at most one frame. Leading bytes before the
/// first header are ignored; everything else must parse exactly.
pub fn decode(datagram: &[u8]) -> WireResult<Frame> {
    let start = datagram
        .iter()
        .position(|&byte| is_header(byte))
        .ok_or(WireError::MissingHeader)?;

    let framed = &datagram[start..];
    let end = framed
        .iter()
        .position(|&byte| byte == TERMINATOR)
        .ok_or(WireError::MissingTerminator)?;

    let body = unescape(&framed[..end])?;

    if body.len() < 2 {
        return Err(WireError::Truncated);
    }

    let header = body[0];
    let rule = crc_rule(header).ok_or(WireError::UnknownHeader(header))?;

    let (content, crc_present) = match rule {
        CrcRule::Forbidden => {
            if body.len() != 2 {
                return Err(WireError::UnexpectedCrc);
            }
            (&body[..], false)
        }
        CrcRule::Required => (verify_and_strip(&body)?, true),
        CrcRule::Optional => {
            if body.len() == 2 {
                (&body[..], false)
            } else {
                (verify_and_strip(&body)?, true)
            }
        }
    };

    Ok(Frame {
        header,
        station: content[1],
        payload: content[2..].to_vec(),
        crc_present,
    })
}

/// Validates the trailing big-endian CRC and returns the body without it.
fn verify_and_strip(body: &[u8]) -> WireResult<&[u8]> {
    if body.len() < 4 {
        return Err(WireError::CrcMissing);
    }

    let split = body.len() - 2;
    let received = BigEndian::read_u16(&body[split..]);

    if checksum(&body[..split]) != received {
        return Err(WireError::CrcMismatch);
    }

    Ok(&body[..split])
}
