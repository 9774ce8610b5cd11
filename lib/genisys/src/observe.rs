use crate::event::Event;
use crate::intent::Intents;
use crate::shared::{StationAddress, WireError};
use crate::state::ControllerState;
use ballast::logging::{self, Logger};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Everything the controller is willing to tell the outside world about its
/// inner life. Emission is best-effort and must never block the loop; the
/// reducer itself never emits.
#[derive(Debug, Clone)]
pub enum Observation {
    StateTransition {
        old: Arc<ControllerState>,
        new: Arc<ControllerState>,
        event: Event,
        intents: Intents,
    },
    MessageSent {
        station: StationAddress,
        kind: &'static str,
    },
    MessageReceived {
        station: StationAddress,
        kind: &'static str,
    },
    TransportUp,
    TransportDown,
    DatagramDropped {
        reason: WireError,
    },
    ContextualDrop {
        station: Option<StationAddress>,
        kind: &'static str,
    },
    Fatal {
        detail: String,
    },
}

pub trait ObserverSink: Send + Sync {
    fn observe(&self, observation: &Observation);
}

/// Sink that swallows everything.
pub struct NullObserver;

impl ObserverSink for NullObserver {
    #[inline]
    fn observe(&self, _observation: &Observation) {}
}

/// Sink that renders observations as structured log lines.
pub struct LogObserver {
    log: Logger,
}

impl LogObserver {
    #[inline]
    pub fn new(log: Logger) -> LogObserver {
        LogObserver { log }
    }
}

impl ObserverSink for LogObserver {
    fn observe(&self, observation: &Observation) {
        match observation {
            Observation::StateTransition {
                old,
                new,
                event,
                intents,
            } => {
                logging::debug!(self.log, "state transition";
                                "context" => "observe",
                                "event" => event.kind(),
                                "old_global" => ?old.global,
                                "new_global" => ?new.global,
                                "intents" => %intents);
            }
            Observation::MessageSent { station, kind } => {
                logging::debug!(self.log, "message sent";
                                "context" => "observe",
                                "station" => %station,
                                "message" => *kind);
            }
            Observation::MessageReceived { station, kind } => {
                logging::debug!(self.log, "message received";
                                "context" => "observe",
                                "station" => %station,
                                "message" => *kind);
            }
            Observation::TransportUp => {
                logging::info!(self.log, "transport up"; "context" => "observe");
            }
            Observation::TransportDown => {
                logging::warn!(self.log, "transport down"; "context" => "observe");
            }
            Observation::DatagramDropped { reason } => {
                logging::debug!(self.log, "datagram dropped";
                                "context" => "observe",
                                "reason" => %reason);
            }
            Observation::ContextualDrop { station, kind } => {
                logging::debug!(self.log, "contextually illegal message dropped";
                                "context" => "observe",
                                "station" => ?station.map(|s| s.raw()),
                                "message" => *kind);
            }
            Observation::Fatal { detail } => {
                logging::crit!(self.log, "fatal controller error";
                               "context" => "observe",
                               "detail" => detail.as_str());
            }
        }
    }
}

/// Sink that counts observations by class. Doubles as the cheap drop counter
/// required by the wire layer and as a test probe.
pub struct CountingObserver {
    pub transitions: AtomicU64,
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub dropped: AtomicU64,
    pub contextual: AtomicU64,
    pub fatal: AtomicU64,
}

impl CountingObserver {
    #[inline]
    pub fn new() -> CountingObserver {
        CountingObserver {
            transitions: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            contextual: AtomicU64::new(0),
            fatal: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

impl ObserverSink for CountingObserver {
    fn observe(&self, observation: &Observation) {
        let counter = match observation {
            Observation::StateTransition { .. } => &self.transitions,
            Observation::MessageSent { .. } => &self.sent,
            Observation::MessageReceived { .. } => &self.received,
            Observation::TransportUp | Observation::TransportDown => return,
            Observation::DatagramDropped { .. } => &self.dropped,
            Observation::ContextualDrop { .. } => &self.contextual,
            Observation::Fatal { .. } => &self.fatal,
        };

        counter.fetch_add(1, Ordering::SeqCst);
    }
}
