use crate::shared::StationAddress;
use crate::signal::ControlSet;
use crate::wire::message::Message;

/// Inputs to the reducer. `MessageReceived` is only ever constructed for
/// decoded, contextually legal messages; `ControlDeliveryDue` is internal,
/// posted by the executor's per-station coalescing timers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TransportUp {
        ts: u64,
    },
    TransportDown {
        ts: u64,
    },
    MessageReceived {
        ts: u64,
        station: StationAddress,
        message: Message,
    },
    ResponseTimeout {
        ts: u64,
        station: StationAddress,
    },
    ControlIntentChanged {
        ts: u64,
        delta: ControlSet,
        desired: ControlSet,
    },
    ControlDeliveryDue {
        ts: u64,
        station: StationAddress,
    },
}

impl Event {
    /// Wall-clock timestamp carried for observability.
    #[inline]
    pub fn ts(&self) -> u64 {
        match self {
            Event::TransportUp { ts }
            | Event::TransportDown { ts }
            | Event::MessageReceived { ts, .. }
            | Event::ResponseTimeout { ts, .. }
            | Event::ControlIntentChanged { ts, .. }
            | Event::ControlDeliveryDue { ts, .. } => *ts,
        }
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TransportUp { .. } => "transport_up",
            Event::TransportDown { .. } => "transport_down",
            Event::MessageReceived { .. } => "message_received",
            Event::ResponseTimeout { .. } => "response_timeout",
            Event::ControlIntentChanged { .. } => "control_intent_changed",
            Event::ControlDeliveryDue { .. } => "control_delivery_due",
        }
    }
}

/// Destination for events produced outside the controller loop: timer
/// callbacks and transport callbacks post here instead of re-entering the
/// reducer.
pub trait EventSink: Send + Sync {
    fn submit(&self, event: Event);
}
