use serde_derive::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

pub type WireResult<T> = Result<T, WireError>;

/// Reasons a datagram is discarded before it reaches the protocol state
/// machine. Every variant results in a silent drop: no event is emitted and
/// the defect is surfaced through observability only.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WireError {
    MissingHeader,
    MissingTerminator,
    DanglingEscape,
    Truncated,
    CrcMissing,
    CrcMismatch,
    UnexpectedCrc,
    UnknownHeader(u8),
    UnexpectedPayload,
    PayloadOverrun,
    ReservedStation,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::MissingHeader => write!(f, "no header byte in datagram"),
            WireError::MissingTerminator => write!(f, "no terminator after header"),
            WireError::DanglingEscape => write!(f, "escape byte at end of body"),
            WireError::Truncated => write!(f, "body shorter than header and station"),
            WireError::CrcMissing => write!(f, "required CRC absent"),
            WireError::CrcMismatch => write!(f, "CRC verification failed"),
            WireError::UnexpectedCrc => write!(f, "trailing bytes on a CRC-free message"),
            WireError::UnknownHeader(header) => write!(f, "unknown header 0x{:02X}", header),
            WireError::UnexpectedPayload => write!(f, "payload on a payload-free message"),
            WireError::PayloadOverrun => write!(f, "payload exceeds configured signal capacity"),
            WireError::ReservedStation => write!(f, "station 0 is reserved"),
        }
    }
}

/// Error raised when constructing a `StationAddress` from the reserved
/// broadcast value 0.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReservedStation;

impl fmt::Display for ReservedStation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "station address 0 is reserved for broadcast")
    }
}

/// Address of a single slave on the link. Wraps one byte; 0 is the broadcast
/// address and is not representable, so per-slave targeting is always 1-255.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct StationAddress(u8);

impl StationAddress {
    #[inline]
    pub fn new(raw: u8) -> Option<StationAddress> {
        match raw {
            0 => None,
            raw => Some(StationAddress(raw)),
        }
    }

    #[inline]
    pub fn raw(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for StationAddress {
    type Error = ReservedStation;

    #[inline]
    fn try_from(raw: u8) -> Result<StationAddress, ReservedStation> {
        StationAddress::new(raw).ok_or(ReservedStation)
    }
}

impl From<StationAddress> for u8 {
    #[inline]
    fn from(station: StationAddress) -> u8 {
        station.0
    }
}

impl fmt::Display for StationAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
