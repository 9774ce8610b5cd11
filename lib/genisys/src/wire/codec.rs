use crate::shared::{StationAddress, WireError, WireResult};
use crate::signal::{ControlSet, IndicationSet, PackedControlCodec, PackedIndicationDecoder};
use crate::wire::framing::{self, Frame};
use crate::wire::message::{
    CrcRule, Message, HDR_ACKNOWLEDGE, HDR_ACKNOWLEDGE_AND_POLL, HDR_CONTROL_CHECKBACK,
    HDR_CONTROL_DATA, HDR_EXECUTE_CONTROLS, HDR_INDICATION_DATA, HDR_POLL, HDR_RECALL,
};

/// Decodes indication payload bytes into a set. Injected so that sites with
/// non-standard indication layouts can substitute their own binding.
pub trait IndicationDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> WireResult<IndicationSet>;
}

/// Two-way codec for control payload bytes.
pub trait ControlCodec: Send + Sync {
    fn encode(&self, controls: &ControlSet) -> Vec<u8>;
    fn decode(&self, payload: &[u8]) -> WireResult<ControlSet>;
}

/// Translates validated frames to typed messages and back to wire bytes.
pub struct MessageCodec {
    indications: Box<dyn IndicationDecoder>,
    controls: Box<dyn ControlCodec>,
}

impl MessageCodec {
    #[inline]
    pub fn new(
        indications: Box<dyn IndicationDecoder>,
        controls: Box<dyn ControlCodec>,
    ) -> MessageCodec {
        MessageCodec {
            indications,
            controls,
        }
    }

    /// Codec with the default bit-packed payload binding sized to the two
    /// signal catalogs.
    #[inline]
    pub fn packed(control_count: usize, indication_count: usize) -> MessageCodec {
        MessageCodec::new(
            Box::new(PackedIndicationDecoder::new(indication_count)),
            Box::new(PackedControlCodec::new(control_count)),
        )
    }

    /// Decodes a whole datagram: framing first, then semantics.
    #[inline]
    pub fn decode_datagram(&self, datagram: &[u8]) -> WireResult<Message> {
        self.decode(&framing::decode(datagram)?)
    }

    /// Maps a validated frame to its message. Station 0 and payload-rule
    /// violations are semantic defects.
    pub fn decode(&self, frame: &Frame) -> WireResult<Message> {
        let station = StationAddress::new(frame.station).ok_or(WireError::ReservedStation)?;

        let message = match frame.header {
            HDR_ACKNOWLEDGE => {
                require_empty(frame)?;
                Message::Acknowledge { station }
            }
            HDR_INDICATION_DATA => Message::IndicationData {
                station,
                indications: self.indications.decode(&frame.payload)?,
            },
            HDR_CONTROL_CHECKBACK => Message::ControlCheckback {
                station,
                controls: self.controls.decode(&frame.payload)?,
            },
            HDR_ACKNOWLEDGE_AND_POLL => {
                require_empty(frame)?;
                Message::AcknowledgeAndPoll { station }
            }
            HDR_POLL => {
                require_empty(frame)?;
                Message::Poll {
                    station,
                    secure: frame.crc_present,
                }
            }
            HDR_CONTROL_DATA => Message::ControlData {
                station,
                controls: self.controls.decode(&frame.payload)?,
            },
            HDR_RECALL => {
                require_empty(frame)?;
                Message::Recall { station }
            }
            HDR_EXECUTE_CONTROLS => {
                require_empty(frame)?;
                Message::ExecuteControls { station }
            }
            header => return Err(WireError::UnknownHeader(header)),
        };

        Ok(message)
    }

    /// Encodes a message into wire-ready bytes, CRC per the header table.
    pub fn encode(&self, message: &Message) -> Vec<u8> {
        let station = message.station().raw();

        let (payload, with_crc) = match message {
            Message::Acknowledge { .. } => (Vec::new(), false),
            Message::IndicationData { indications, .. } => {
                (encode_indications(indications), true)
            }
            Message::ControlCheckback { controls, .. } => (self.controls.encode(controls), true),
            Message::AcknowledgeAndPoll { .. } => (Vec::new(), true),
            Message::Poll { secure, .. } => (Vec::new(), *secure),
            Message::ControlData { controls, .. } => (self.controls.encode(controls), true),
            Message::Recall { .. } => (Vec::new(), true),
            Message::ExecuteControls { .. } => (Vec::new(), true),
        };

        framing::encode(message.header(), station, &payload, with_crc)
    }
}

#[inline]
fn require_empty(frame: &Frame) -> WireResult<()> {
    if frame.payload.is_empty() {
        Ok(())
    } else {
        Err(WireError::UnexpectedPayload)
    }
}

/// Indication encoding mirrors the default control binding. The master only
/// emits this in loopback tests; production indications flow the other way.
fn encode_indications(indications: &IndicationSet) -> Vec<u8> {
    use crate::signal::SignalValue;

    let mut bytes = vec![0u8; (indications.len() + 7) / 8];

    for position in 0..indications.len() {
        if indications.get(position) == SignalValue::True {
            bytes[position / 8] |= 1 << (position % 8);
        }
    }

    bytes
}
