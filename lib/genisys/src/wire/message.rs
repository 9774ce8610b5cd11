use crate::shared::StationAddress;
use crate::signal::{ControlSet, IndicationSet};

pub const HDR_ACKNOWLEDGE: u8 = 0xF1;
pub const HDR_INDICATION_DATA: u8 = 0xF2;
pub const HDR_CONTROL_CHECKBACK: u8 = 0xF3;
pub const HDR_ACKNOWLEDGE_AND_POLL: u8 = 0xFA;
pub const HDR_POLL: u8 = 0xFB;
pub const HDR_CONTROL_DATA: u8 = 0xFC;
pub const HDR_RECALL: u8 = 0xFD;
pub const HDR_EXECUTE_CONTROLS: u8 = 0xFE;

/// CRC expectation attached to a header. `Optional` exists only for polls,
/// where CRC presence doubles as the secure flag.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CrcRule {
    Forbidden,
    Required,
    Optional,
}

/// Flow direction on the half-duplex link.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    MasterToSlave,
    SlaveToMaster,
}

/// CRC rule for a header, or None for bytes in the framing range that map to
/// no known message.
#[inline]
pub fn crc_rule(header: u8) -> Option<CrcRule> {
    match header {
        HDR_ACKNOWLEDGE => Some(CrcRule::Forbidden),
        HDR_INDICATION_DATA
        | HDR_CONTROL_CHECKBACK
        | HDR_ACKNOWLEDGE_AND_POLL
        | HDR_CONTROL_DATA
        | HDR_RECALL
        | HDR_EXECUTE_CONTROLS => Some(CrcRule::Required),
        HDR_POLL => Some(CrcRule::Optional),
        _ => None,
    }
}

/// Typed protocol messages. Every message addresses a single station; the
/// direction is structural, not situational.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    Acknowledge {
        station: StationAddress,
    },
    IndicationData {
        station: StationAddress,
        indications: IndicationSet,
    },
    ControlCheckback {
        station: StationAddress,
        controls: ControlSet,
    },
    AcknowledgeAndPoll {
        station: StationAddress,
    },
    Poll {
        station: StationAddress,
        secure: bool,
    },
    ControlData {
        station: StationAddress,
        controls: ControlSet,
    },
    Recall {
        station: StationAddress,
    },
    ExecuteControls {
        station: StationAddress,
    },
}

impl Message {
    #[inline]
    pub fn station(&self) -> StationAddress {
        match self {
            Message::Acknowledge { station }
            | Message::IndicationData { station, .. }
            | Message::ControlCheckback { station, .. }
            | Message::AcknowledgeAndPoll { station }
            | Message::Poll { station, .. }
            | Message::ControlData { station, .. }
            | Message::Recall { station }
            | Message::ExecuteControls { station } => *station,
        }
    }

    #[inline]
    pub fn header(&self) -> u8 {
        match self {
            Message::Acknowledge { .. } => HDR_ACKNOWLEDGE,
            Message::IndicationData { .. } => HDR_INDICATION_DATA,
            Message::ControlCheckback { .. } => HDR_CONTROL_CHECKBACK,
            Message::AcknowledgeAndPoll { .. } => HDR_ACKNOWLEDGE_AND_POLL,
            Message::Poll { .. } => HDR_POLL,
            Message::ControlData { .. } => HDR_CONTROL_DATA,
            Message::Recall { .. } => HDR_RECALL,
            Message::ExecuteControls { .. } => HDR_EXECUTE_CONTROLS,
        }
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        match self {
            Message::Acknowledge { .. }
            | Message::IndicationData { .. }
            | Message::ControlCheckback { .. } => Direction::SlaveToMaster,
            Message::AcknowledgeAndPoll { .. }
            | Message::Poll { .. }
            | Message::ControlData { .. }
            | Message::Recall { .. }
            | Message::ExecuteControls { .. } => Direction::MasterToSlave,
        }
    }

    /// Short name for logging and observability.
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Acknowledge { .. } => "acknowledge",
            Message::IndicationData { .. } => "indication_data",
            Message::ControlCheckback { .. } => "control_checkback",
            Message::AcknowledgeAndPoll { .. } => "acknowledge_and_poll",
            Message::Poll { .. } => "poll",
            Message::ControlData { .. } => "control_data",
            Message::Recall { .. } => "recall",
            Message::ExecuteControls { .. } => "execute_controls",
        }
    }
}
