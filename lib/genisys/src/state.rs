use crate::shared::StationAddress;
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};

/// Per-slave lifecycle phase. `Failed` is terminal but recoverable: any valid
/// message from the slave puts it back into `Recall`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SlavePhase {
    Uninitialized,
    Recall,
    SendControls,
    Poll,
    Failed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SlaveState {
    pub phase: SlavePhase,
    pub acknowledgment_pending: bool,
    pub control_pending: bool,
    pub consecutive_failures: u32,
    pub last_transition_ts: u64,
}

impl SlaveState {
    #[inline]
    pub fn initial() -> SlaveState {
        SlaveState {
            phase: SlavePhase::Uninitialized,
            acknowledgment_pending: false,
            control_pending: false,
            consecutive_failures: 0,
            last_transition_ts: 0,
        }
    }

    /// The state every slave restarts from when the transport comes up.
    #[inline]
    pub fn recalling(ts: u64) -> SlaveState {
        SlaveState {
            phase: SlavePhase::Recall,
            acknowledgment_pending: false,
            control_pending: false,
            consecutive_failures: 0,
            last_transition_ts: ts,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GlobalState {
    TransportDown,
    Initializing,
    Running,
}

/// External projection of controller health.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkStatus {
    Connected,
    Degraded,
    Disconnected,
}

/// Immutable controller snapshot. The reducer produces a fresh value per
/// event; the runtime publishes the latest through a `StateCell`.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub global: GlobalState,
    pub slaves: HashMap<StationAddress, SlaveState>,
    pub ts: u64,
}

impl ControllerState {
    pub fn initial<I: IntoIterator<Item = StationAddress>>(stations: I) -> ControllerState {
        let slaves = stations
            .into_iter()
            .map(|station| (station, SlaveState::initial()))
            .collect();

        ControllerState {
            global: GlobalState::TransportDown,
            slaves,
            ts: 0,
        }
    }

    /// Fetches a slave's state. An unknown station is a programmer error.
    #[inline]
    pub fn slave(&self, station: StationAddress) -> &SlaveState {
        match self.slaves.get(&station) {
            Some(slave) => slave,
            None => panic!("Unknown station {}", station),
        }
    }

    /// Maps the snapshot onto the host-facing status.
    pub fn status(&self) -> LinkStatus {
        match self.global {
            GlobalState::TransportDown | GlobalState::Initializing => LinkStatus::Disconnected,
            GlobalState::Running => {
                let failed = self
                    .slaves
                    .values()
                    .filter(|slave| slave.phase == SlavePhase::Failed)
                    .count();

                if failed == 0 {
                    LinkStatus::Connected
                } else if failed == self.slaves.len() {
                    LinkStatus::Disconnected
                } else {
                    LinkStatus::Degraded
                }
            }
        }
    }
}

/// Holder for the latest published snapshot. The snapshot is replaced, never
/// mutated; the mutex provides the publication barrier for readers.
pub struct StateCell {
    current: Mutex<Arc<ControllerState>>,
}

impl StateCell {
    #[inline]
    pub fn new(initial: ControllerState) -> StateCell {
        StateCell {
            current: Mutex::new(Arc::new(initial)),
        }
    }

    #[inline]
    pub fn publish(&self, state: Arc<ControllerState>) {
        *self.current.lock().expect("State cell poisoned") = state;
    }

    #[inline]
    pub fn snapshot(&self) -> Arc<ControllerState> {
        self.current.lock().expect("State cell poisoned").clone()
    }
}
