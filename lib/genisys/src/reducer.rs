//! The protocol state machine. Every decision the master makes lives here,
//! as a pure transition over immutable snapshots: no I/O, no clocks, no
//! timers, no logging. The executor realizes whatever this function decides.

use crate::event::Event;
use crate::intent::{IntentKind, Intents};
use crate::shared::StationAddress;
use crate::state::{ControllerState, GlobalState, SlavePhase, SlaveState};
use crate::wire::message::Message;

pub struct Reducer {
    fail_threshold: u32,
}

impl Reducer {
    #[inline]
    pub fn new(fail_threshold: u32) -> Reducer {
        Reducer { fail_threshold }
    }

    /// Applies one event, returning the successor state and the intents the
    /// executor must realize. Two invocations on equal inputs yield equal
    /// results.
    pub fn reduce(&self, state: &ControllerState, event: &Event) -> (ControllerState, Intents) {
        match event {
            Event::TransportUp { ts } => self.transport_up(state, *ts),
            Event::TransportDown { ts } => self.transport_down(state, *ts),
            Event::MessageReceived {
                ts,
                station,
                message,
            } => self.message_received(state, *ts, *station, message),
            Event::ResponseTimeout { ts, station } => {
                self.response_timeout(state, *ts, *station)
            }
            Event::ControlIntentChanged { ts, .. } => self.control_intent_changed(state, *ts),
            Event::ControlDeliveryDue { ts, station } => {
                self.control_delivery_due(state, *ts, *station)
            }
        }
    }

    fn transport_up(&self, state: &ControllerState, ts: u64) -> (ControllerState, Intents) {
        let slaves = state
            .slaves
            .keys()
            .map(|&station| (station, SlaveState::recalling(ts)))
            .collect();

        let next = ControllerState {
            global: GlobalState::Initializing,
            slaves,
            ts,
        };

        (next, Intents::global(IntentKind::BeginInitialization))
    }

    fn transport_down(&self, state: &ControllerState, ts: u64) -> (ControllerState, Intents) {
        // Slaves retain identity and counters across an outage.
        let next = ControllerState {
            global: GlobalState::TransportDown,
            slaves: state.slaves.clone(),
            ts,
        };

        (next, Intents::global(IntentKind::SuspendAll))
    }

    fn message_received(
        &self,
        state: &ControllerState,
        ts: u64,
        station: StationAddress,
        message: &Message,
    ) -> (ControllerState, Intents) {
        let slave = *state.slave(station);

        let global = match state.global {
            GlobalState::Initializing => GlobalState::Running,
            global => global,
        };

        let (slave, intents) = match slave.phase {
            SlavePhase::Failed => {
                // Content is irrelevant: any valid message revives the slave.
                let revived = SlaveState {
                    phase: SlavePhase::Recall,
                    consecutive_failures: 0,
                    last_transition_ts: ts,
                    ..slave
                };

                (revived, Intents::targeted(IntentKind::SendRecall, station))
            }
            SlavePhase::Recall => match message {
                Message::IndicationData { .. } => {
                    let advanced = SlaveState {
                        phase: SlavePhase::SendControls,
                        acknowledgment_pending: true,
                        consecutive_failures: 0,
                        last_transition_ts: ts,
                        ..slave
                    };

                    (
                        advanced,
                        Intents::targeted(IntentKind::SendControls, station),
                    )
                }
                _ => {
                    // Not expected during recall; retain, but the contact
                    // still counts as semantic activity.
                    let retained = SlaveState {
                        consecutive_failures: 0,
                        ..slave
                    };

                    (retained, Intents::none())
                }
            },
            SlavePhase::SendControls => {
                let advanced = SlaveState {
                    phase: SlavePhase::Poll,
                    acknowledgment_pending: matches!(message, Message::IndicationData { .. }),
                    control_pending: false,
                    consecutive_failures: 0,
                    last_transition_ts: ts,
                };

                (advanced, Intents::targeted(IntentKind::PollNext, station))
            }
            SlavePhase::Poll => {
                let acknowledgment_pending = match message {
                    Message::Acknowledge { .. } => false,
                    Message::IndicationData { .. } => true,
                    _ => slave.acknowledgment_pending,
                };

                let polled = SlaveState {
                    acknowledgment_pending,
                    consecutive_failures: 0,
                    ..slave
                };

                (polled, Intents::targeted(IntentKind::PollNext, station))
            }
            SlavePhase::Uninitialized => {
                let retained = SlaveState {
                    consecutive_failures: 0,
                    ..slave
                };

                (retained, Intents::none())
            }
        };

        (replace(state, global, station, slave, ts), intents)
    }

    fn response_timeout(
        &self,
        state: &ControllerState,
        ts: u64,
        station: StationAddress,
    ) -> (ControllerState, Intents) {
        let slave = *state.slave(station);

        let (slave, intents) = match slave.phase {
            SlavePhase::Uninitialized => (slave, Intents::none()),
            SlavePhase::Recall => {
                // Recall retries never escalate.
                (slave, Intents::targeted(IntentKind::SendRecall, station))
            }
            SlavePhase::SendControls => {
                self.escalate(slave, station, ts, IntentKind::SendControls)
            }
            SlavePhase::Poll => self.escalate(slave, station, ts, IntentKind::RetryCurrent),
            SlavePhase::Failed => {
                // Periodic probe; the executor rate-limits it.
                (slave, Intents::targeted(IntentKind::SendRecall, station))
            }
        };

        (replace(state, state.global, station, slave, ts), intents)
    }

    /// Shared timeout handling for the two phases that count failures.
    fn escalate(
        &self,
        slave: SlaveState,
        station: StationAddress,
        ts: u64,
        retry: IntentKind,
    ) -> (SlaveState, Intents) {
        let failures = slave.consecutive_failures + 1;

        if failures >= self.fail_threshold {
            let failed = SlaveState {
                phase: SlavePhase::Failed,
                consecutive_failures: failures,
                last_transition_ts: ts,
                ..slave
            };

            (failed, Intents::targeted(IntentKind::SendRecall, station))
        } else {
            let counted = SlaveState {
                consecutive_failures: failures,
                ..slave
            };

            (counted, Intents::targeted(retry, station))
        }
    }

    fn control_intent_changed(
        &self,
        state: &ControllerState,
        ts: u64,
    ) -> (ControllerState, Intents) {
        let slaves = state
            .slaves
            .iter()
            .map(|(&station, slave)| {
                (
                    station,
                    SlaveState {
                        control_pending: true,
                        ..*slave
                    },
                )
            })
            .collect();

        let next = ControllerState {
            global: state.global,
            slaves,
            ts,
        };

        (next, Intents::global(IntentKind::ScheduleControlDelivery))
    }

    fn control_delivery_due(
        &self,
        state: &ControllerState,
        ts: u64,
        station: StationAddress,
    ) -> (ControllerState, Intents) {
        let slave = *state.slave(station);

        // Delivery only interrupts a polling slave. Anywhere else the pending
        // flag survives and delivery rides the normal lifecycle.
        if slave.phase != SlavePhase::Poll || !slave.control_pending {
            let next = ControllerState {
                global: state.global,
                slaves: state.slaves.clone(),
                ts,
            };

            return (next, Intents::none());
        }

        let delivering = SlaveState {
            phase: SlavePhase::SendControls,
            last_transition_ts: ts,
            ..slave
        };

        (
            replace(state, state.global, station, delivering, ts),
            Intents::targeted(IntentKind::SendControls, station),
        )
    }
}

/// Successor snapshot with one slave replaced.
fn replace(
    state: &ControllerState,
    global: GlobalState,
    station: StationAddress,
    slave: SlaveState,
    ts: u64,
) -> ControllerState {
    let mut slaves = state.slaves.clone();
    slaves.insert(station, slave);

    ControllerState { global, slaves, ts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{ControlSet, IndicationSet};

    const THRESHOLD: u32 = 3;

    fn station(raw: u8) -> StationAddress {
        StationAddress::new(raw).unwrap()
    }

    fn reducer() -> Reducer {
        Reducer::new(THRESHOLD)
    }

    fn initial(stations: &[u8]) -> ControllerState {
        ControllerState::initial(stations.iter().map(|&raw| station(raw)))
    }

    fn up(state: &ControllerState, ts: u64) -> (ControllerState, Intents) {
        reducer().reduce(state, &Event::TransportUp { ts })
    }

    fn received(
        state: &ControllerState,
        ts: u64,
        raw: u8,
        message: Message,
    ) -> (ControllerState, Intents) {
        reducer().reduce(
            state,
            &Event::MessageReceived {
                ts,
                station: station(raw),
                message,
            },
        )
    }

    fn timeout(state: &ControllerState, ts: u64, raw: u8) -> (ControllerState, Intents) {
        reducer().reduce(
            state,
            &Event::ResponseTimeout {
                ts,
                station: station(raw),
            },
        )
    }

    fn indications(raw: u8) -> Message {
        Message::IndicationData {
            station: station(raw),
            indications: IndicationSet::all_false(8),
        }
    }

    fn acknowledge(raw: u8) -> Message {
        Message::Acknowledge {
            station: station(raw),
        }
    }

    /// Drives a fresh two-station controller to the point where slave 1 is
    /// polling.
    fn polling_state() -> ControllerState {
        let state = initial(&[1, 2]);
        let (state, _) = up(&state, 1);
        let (state, _) = received(&state, 2, 1, indications(1));
        let (state, _) = received(&state, 3, 1, acknowledge(1));
        state
    }

    #[test]
    fn test_startup_scenario() {
        // S1: transport up, then first indications from slave 1
        let state = initial(&[1, 2]);

        let (state, intents) = up(&state, 10);

        assert_eq!(state.global, GlobalState::Initializing);
        assert!(intents.contains(IntentKind::BeginInitialization));
        assert_eq!(state.slave(station(1)).phase, SlavePhase::Recall);
        assert_eq!(state.slave(station(2)).phase, SlavePhase::Recall);

        let (state, intents) = received(&state, 11, 1, indications(1));

        assert_eq!(state.slave(station(1)).phase, SlavePhase::SendControls);
        assert!(state.slave(station(1)).acknowledgment_pending);
        assert!(intents.contains(IntentKind::SendControls));
        assert_eq!(intents.target(), Some(station(1)));
        assert_eq!(state.global, GlobalState::Running);
        // Slave 2 is untouched
        assert_eq!(state.slave(station(2)).phase, SlavePhase::Recall);
    }

    #[test]
    fn test_ack_tracking_scenario() {
        // S2: indications during polling set the acknowledgment obligation
        let state = polling_state();
        assert!(!state.slave(station(1)).acknowledgment_pending);

        let (state, intents) = received(&state, 5, 1, indications(1));

        assert!(state.slave(station(1)).acknowledgment_pending);
        assert!(intents.contains(IntentKind::PollNext));
        assert_eq!(intents.target(), Some(station(1)));
    }

    #[test]
    fn test_escalation_scenario() {
        // S3: three consecutive poll timeouts fail the slave
        let state = polling_state();

        let (state, intents) = timeout(&state, 10, 1);
        assert_eq!(state.slave(station(1)).consecutive_failures, 1);
        assert!(intents.contains(IntentKind::RetryCurrent));

        let (state, intents) = timeout(&state, 20, 1);
        assert_eq!(state.slave(station(1)).consecutive_failures, 2);
        assert!(intents.contains(IntentKind::RetryCurrent));

        let (state, intents) = timeout(&state, 30, 1);
        assert_eq!(state.slave(station(1)).phase, SlavePhase::Failed);
        assert_eq!(state.slave(station(1)).consecutive_failures, 3);
        assert!(intents.contains(IntentKind::SendRecall));
        assert_eq!(intents.target(), Some(station(1)));
    }

    #[test]
    fn test_recall_timeouts_never_escalate() {
        // S4: recall retries do not move the failure counter
        let state = initial(&[1]);
        let (mut state, _) = up(&state, 1);

        for ts in 2..7 {
            let (next, intents) = timeout(&state, ts, 1);

            assert_eq!(next.slave(station(1)).phase, SlavePhase::Recall);
            assert_eq!(next.slave(station(1)).consecutive_failures, 0);
            assert!(intents.contains(IntentKind::SendRecall));
            assert_eq!(intents.target(), Some(station(1)));

            state = next;
        }
    }

    #[test]
    fn test_recovery_scenario() {
        // S5: any valid message revives a failed slave
        let state = polling_state();
        let (state, _) = timeout(&state, 10, 1);
        let (state, _) = timeout(&state, 20, 1);
        let (state, _) = timeout(&state, 30, 1);
        assert_eq!(state.slave(station(1)).phase, SlavePhase::Failed);

        let (state, intents) = received(&state, 40, 1, acknowledge(1));

        assert_eq!(state.slave(station(1)).phase, SlavePhase::Recall);
        assert_eq!(state.slave(station(1)).consecutive_failures, 0);
        assert!(intents.contains(IntentKind::SendRecall));
        assert_eq!(intents.target(), Some(station(1)));
    }

    #[test]
    fn test_transport_down_suspends_and_retains_slaves() {
        let state = polling_state();
        let (state, _) = timeout(&state, 10, 1);

        let (state, intents) = reducer().reduce(&state, &Event::TransportDown { ts: 20 });

        assert_eq!(state.global, GlobalState::TransportDown);
        assert!(intents.contains(IntentKind::SuspendAll));
        // Counters survive the outage
        assert_eq!(state.slave(station(1)).consecutive_failures, 1);
        assert_eq!(state.slave(station(1)).phase, SlavePhase::Poll);
    }

    #[test]
    fn test_transport_up_resets_slaves() {
        let state = polling_state();
        let (state, _) = timeout(&state, 10, 1);
        let (state, _) = reducer().reduce(&state, &Event::TransportDown { ts: 20 });

        let (state, _) = up(&state, 30);

        assert_eq!(state.slave(station(1)).phase, SlavePhase::Recall);
        assert_eq!(state.slave(station(1)).consecutive_failures, 0);
        assert!(!state.slave(station(1)).acknowledgment_pending);
    }

    #[test]
    fn test_poll_acknowledge_clears_obligation() {
        let state = polling_state();
        let (state, _) = received(&state, 5, 1, indications(1));
        assert!(state.slave(station(1)).acknowledgment_pending);

        let (state, intents) = received(&state, 6, 1, acknowledge(1));

        assert!(!state.slave(station(1)).acknowledgment_pending);
        assert!(intents.contains(IntentKind::PollNext));
    }

    #[test]
    fn test_poll_checkback_is_activity_only() {
        let state = polling_state();
        let (state, _) = timeout(&state, 10, 1);
        assert_eq!(state.slave(station(1)).consecutive_failures, 1);

        let checkback = Message::ControlCheckback {
            station: station(1),
            controls: ControlSet::all_false(8),
        };
        let (state, intents) = received(&state, 11, 1, checkback);

        assert_eq!(state.slave(station(1)).consecutive_failures, 0);
        assert_eq!(state.slave(station(1)).phase, SlavePhase::Poll);
        assert!(!state.slave(station(1)).acknowledgment_pending);
        assert!(intents.contains(IntentKind::PollNext));
    }

    #[test]
    fn test_send_controls_response_advances_to_poll() {
        let state = initial(&[1]);
        let (state, _) = up(&state, 1);
        let (state, _) = received(&state, 2, 1, indications(1));
        assert_eq!(state.slave(station(1)).phase, SlavePhase::SendControls);

        let checkback = Message::ControlCheckback {
            station: station(1),
            controls: ControlSet::all_false(8),
        };
        let (state, intents) = received(&state, 3, 1, checkback);

        assert_eq!(state.slave(station(1)).phase, SlavePhase::Poll);
        assert!(!state.slave(station(1)).acknowledgment_pending);
        assert!(!state.slave(station(1)).control_pending);
        assert!(intents.contains(IntentKind::PollNext));
    }

    #[test]
    fn test_send_controls_indication_response_keeps_ack_obligation() {
        let state = initial(&[1]);
        let (state, _) = up(&state, 1);
        let (state, _) = received(&state, 2, 1, indications(1));

        let (state, _) = received(&state, 3, 1, indications(1));

        assert_eq!(state.slave(station(1)).phase, SlavePhase::Poll);
        assert!(state.slave(station(1)).acknowledgment_pending);
    }

    #[test]
    fn test_send_controls_timeouts_escalate() {
        let state = initial(&[1]);
        let (state, _) = up(&state, 1);
        let (state, _) = received(&state, 2, 1, indications(1));

        let (state, intents) = timeout(&state, 10, 1);
        assert_eq!(state.slave(station(1)).consecutive_failures, 1);
        assert!(intents.contains(IntentKind::SendControls));

        let (state, _) = timeout(&state, 20, 1);
        let (state, intents) = timeout(&state, 30, 1);

        assert_eq!(state.slave(station(1)).phase, SlavePhase::Failed);
        assert!(intents.contains(IntentKind::SendRecall));
    }

    #[test]
    fn test_recall_ignores_unexpected_messages() {
        let state = initial(&[1]);
        let (state, _) = up(&state, 1);

        let (state, intents) = received(&state, 2, 1, acknowledge(1));

        assert_eq!(state.slave(station(1)).phase, SlavePhase::Recall);
        assert!(intents.is_empty());
    }

    #[test]
    fn test_failed_timeout_keeps_probing() {
        let state = polling_state();
        let (state, _) = timeout(&state, 10, 1);
        let (state, _) = timeout(&state, 20, 1);
        let (state, _) = timeout(&state, 30, 1);

        let (state, intents) = timeout(&state, 40, 1);

        assert_eq!(state.slave(station(1)).phase, SlavePhase::Failed);
        assert!(intents.contains(IntentKind::SendRecall));
        assert_eq!(intents.target(), Some(station(1)));
    }

    #[test]
    fn test_control_intent_marks_every_slave() {
        let state = polling_state();

        let event = Event::ControlIntentChanged {
            ts: 50,
            delta: ControlSet::new(8),
            desired: ControlSet::all_false(8),
        };
        let (state, intents) = reducer().reduce(&state, &event);

        assert!(state.slave(station(1)).control_pending);
        assert!(state.slave(station(2)).control_pending);
        assert!(intents.contains(IntentKind::ScheduleControlDelivery));
        assert_eq!(intents.target(), None);
    }

    #[test]
    fn test_control_delivery_due_in_poll() {
        let state = polling_state();
        let event = Event::ControlIntentChanged {
            ts: 50,
            delta: ControlSet::new(8),
            desired: ControlSet::all_false(8),
        };
        let (state, _) = reducer().reduce(&state, &event);

        let due = Event::ControlDeliveryDue {
            ts: 60,
            station: station(1),
        };
        let (state, intents) = reducer().reduce(&state, &due);

        assert_eq!(state.slave(station(1)).phase, SlavePhase::SendControls);
        assert!(state.slave(station(1)).control_pending);
        assert!(intents.contains(IntentKind::SendControls));
        assert_eq!(intents.target(), Some(station(1)));
    }

    #[test]
    fn test_control_delivery_due_outside_poll_is_noop() {
        let state = initial(&[1, 2]);
        let (state, _) = up(&state, 1);
        let event = Event::ControlIntentChanged {
            ts: 2,
            delta: ControlSet::new(8),
            desired: ControlSet::all_false(8),
        };
        let (state, _) = reducer().reduce(&state, &event);

        let due = Event::ControlDeliveryDue {
            ts: 3,
            station: station(1),
        };
        let (state, intents) = reducer().reduce(&state, &due);

        assert_eq!(state.slave(station(1)).phase, SlavePhase::Recall);
        assert!(state.slave(station(1)).control_pending);
        assert!(intents.is_empty());
    }

    #[test]
    fn test_reduce_is_pure() {
        let state = polling_state();
        let event = Event::ResponseTimeout {
            ts: 10,
            station: station(1),
        };

        let first = reducer().reduce(&state, &event);
        let second = reducer().reduce(&state, &event);

        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }

    #[test]
    #[should_panic]
    fn test_unknown_station_is_fatal() {
        let state = initial(&[1]);

        timeout(&state, 1, 99);
    }
}
