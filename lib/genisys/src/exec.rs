//! The side-effecting boundary. The executor interprets intent sets from the
//! reducer, commands the transport, and owns every timer in the system. It is
//! strictly serialized: only the controller loop calls `execute`, so all
//! bookkeeping lives behind plain fields.

use crate::config::ValidatedConfig;
use crate::event::{Event, EventSink};
use crate::intent::{IntentKind, Intents};
use crate::observe::{Observation, ObserverSink};
use crate::sched::{CancelHandle, Scheduler};
use crate::shared::StationAddress;
use crate::signal::ControlSet;
use crate::state::{ControllerState, SlavePhase, StateCell};
use crate::wire::message::Message;
use ballast::logging::{self, Logger};
use ballast::time::{timestamp_millis, Clock};
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outbound half of the transport as the executor sees it: encode and hand to
/// the endpoint, non-blocking, errors logged by the implementation.
pub trait MessageSender: Send + Sync {
    fn send(&self, message: &Message);
}

/// Monotonic timestamps of the last accepted message per station. The
/// transport adapter writes on every accepted decode; armed timers read it at
/// fire time so that semantic activity after a send wins over the timeout.
pub struct ActivityLog {
    last: Mutex<HashMap<StationAddress, u64>>,
}

impl ActivityLog {
    #[inline]
    pub fn new() -> ActivityLog {
        ActivityLog {
            last: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn record(&self, station: StationAddress, nanos: u64) {
        self.last
            .lock()
            .expect("Activity log poisoned")
            .insert(station, nanos);
    }

    /// True when activity for `station` was recorded strictly after
    /// `send_nanos`.
    #[inline]
    pub fn active_since(&self, station: StationAddress, send_nanos: u64) -> bool {
        self.last
            .lock()
            .expect("Activity log poisoned")
            .get(&station)
            .map_or(false, |&at| at > send_nanos)
    }
}

/// The host's desired control picture. Starts fully materialized at FALSE and
/// only ever absorbs deltas, so it stays materialized for good.
pub struct ControlLedger {
    desired: Mutex<ControlSet>,
}

impl ControlLedger {
    #[inline]
    pub fn new(capacity: usize) -> ControlLedger {
        ControlLedger {
            desired: Mutex::new(ControlSet::all_false(capacity)),
        }
    }

    /// Merges a delta and returns the resulting desired set.
    pub fn merge(&self, delta: &ControlSet) -> ControlSet {
        let mut desired = self.desired.lock().expect("Control ledger poisoned");
        *desired = desired.merge(delta);
        desired.clone()
    }

    /// Snapshot of the desired set. Always materialized.
    pub fn materialized(&self) -> ControlSet {
        let desired = self.desired.lock().expect("Control ledger poisoned").clone();
        desired
            .require_materialized()
            .expect("Control ledger lost materialization");
        desired
    }
}

/// Arm-sequence registry shared with timer tasks. A fired task whose sequence
/// no longer matches is stale (the timer was re-armed or cancelled after the
/// fire was already in flight) and must do nothing.
struct TimerGuards {
    armed: Mutex<HashMap<StationAddress, u64>>,
}

impl TimerGuards {
    fn new() -> TimerGuards {
        TimerGuards {
            armed: Mutex::new(HashMap::new()),
        }
    }

    fn arm(&self, station: StationAddress, seq: u64) {
        self.armed
            .lock()
            .expect("Timer guards poisoned")
            .insert(station, seq);
    }

    fn is_current(&self, station: StationAddress, seq: u64) -> bool {
        self.armed
            .lock()
            .expect("Timer guards poisoned")
            .get(&station)
            .map_or(false, |&current| current == seq)
    }

    fn clear_all(&self) {
        self.armed.lock().expect("Timer guards poisoned").clear();
    }
}

/// Per-station transmission bookkeeping: the last message sent, the monotonic
/// send time, and the poll rotation cursor.
struct SendTracker {
    last_sent: HashMap<StationAddress, Message>,
    send_time: HashMap<StationAddress, u64>,
    last_poll_at: Option<u64>,
    last_polled: Option<StationAddress>,
}

impl SendTracker {
    fn new() -> SendTracker {
        SendTracker {
            last_sent: HashMap::new(),
            send_time: HashMap::new(),
            last_poll_at: None,
            last_polled: None,
        }
    }
}

pub struct IntentExecutor {
    stations: Vec<StationAddress>,
    secure_polls: bool,
    response_timeout: Duration,
    poll_min_gap: Duration,
    recall_retry_delay: Duration,
    coalesce_window: Duration,

    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    events: Arc<dyn EventSink>,
    sender: Arc<dyn MessageSender>,
    state: Arc<StateCell>,
    controls: Arc<ControlLedger>,
    activity: Arc<ActivityLog>,
    observer: Arc<dyn ObserverSink>,

    tracker: SendTracker,
    timers: HashMap<StationAddress, CancelHandle>,
    guards: Arc<TimerGuards>,
    coalescers: HashMap<StationAddress, CancelHandle>,
    deferred: Vec<CancelHandle>,
    arm_seq: u64,
    suspended: bool,

    log: Logger,
}

impl IntentExecutor {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: &ValidatedConfig,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        events: Arc<dyn EventSink>,
        sender: Arc<dyn MessageSender>,
        state: Arc<StateCell>,
        controls: Arc<ControlLedger>,
        activity: Arc<ActivityLog>,
        observer: Arc<dyn ObserverSink>,
        log: L,
    ) -> IntentExecutor {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        IntentExecutor {
            stations: config.station_addresses(),
            secure_polls: config.secure_polls,
            response_timeout: config.response_timeout,
            poll_min_gap: config.poll_min_gap,
            recall_retry_delay: config.recall_retry_delay,
            coalesce_window: config.control_coalesce_window,
            clock,
            scheduler,
            events,
            sender,
            state,
            controls,
            activity,
            observer,
            tracker: SendTracker::new(),
            timers: HashMap::new(),
            guards: Arc::new(TimerGuards::new()),
            coalescers: HashMap::new(),
            deferred: Vec::new(),
            arm_seq: 0,
            suspended: true,
            log,
        }
    }

    /// Interprets one intent set atomically. Dominant kinds short-circuit the
    /// rest of the set.
    pub fn execute(&mut self, intents: &Intents) {
        if intents.is_empty() {
            return;
        }

        logging::trace!(self.log, "executing intents";
                        "context" => "execute",
                        "intents" => %intents);

        if intents.contains(IntentKind::SuspendAll) {
            self.suspend_all();
            return;
        }

        if intents.contains(IntentKind::BeginInitialization) {
            self.begin_initialization();
            return;
        }

        if self.suspended {
            logging::debug!(self.log, "suppressing intents while suspended";
                            "context" => "execute",
                            "intents" => %intents);
            return;
        }

        for &kind in intents.kinds() {
            match kind {
                IntentKind::SendRecall => {
                    let station = intents.require_target(kind);
                    self.send_recall(station);
                }
                IntentKind::SendControls => {
                    let station = intents.require_target(kind);
                    self.send_controls(station);
                }
                IntentKind::RetryCurrent => {
                    let station = intents.require_target(kind);
                    self.retry_current(station);
                }
                IntentKind::PollNext => self.poll_next(intents.target()),
                IntentKind::ScheduleControlDelivery => self.schedule_control_delivery(),
                IntentKind::SuspendAll | IntentKind::BeginInitialization => {
                    unreachable!("Dominant intents are handled before the loop")
                }
            }
        }
    }

    /// Cancels everything and stops transmitting until the next
    /// initialization. Used for both `SUSPEND_ALL` and shutdown.
    pub fn suspend_all(&mut self) {
        logging::info!(self.log, "suspending all protocol activity"; "context" => "suspend");

        self.cancel_all_timers();
        self.suspended = true;
    }

    /// Number of stations with an armed response timer. Single-flight means
    /// this can never exceed the station count.
    pub fn armed_timer_count(&self) -> usize {
        self.timers
            .values()
            .filter(|handle| !handle.is_settled())
            .count()
    }

    fn begin_initialization(&mut self) {
        logging::info!(self.log, "initializing all slaves";
                       "context" => "init",
                       "stations" => self.stations.len());

        self.cancel_all_timers();
        self.suspended = false;
        self.tracker = SendTracker::new();

        let stations = self.stations.clone();
        for station in stations {
            self.transmit(station, Message::Recall { station }, 0);
        }
    }

    fn send_recall(&mut self, station: StationAddress) {
        let now = self.clock.now_nanos();
        let min_gap = self.recall_retry_delay.as_nanos() as u64;

        // Failed-slave probes are paced by the recall retry delay.
        let delay = match self.tracker.send_time.get(&station) {
            Some(&last) => (last + min_gap).saturating_sub(now),
            None => 0,
        };

        self.transmit(station, Message::Recall { station }, delay);
    }

    fn send_controls(&mut self, station: StationAddress) {
        if let Some(handle) = self.coalescers.remove(&station) {
            handle.cancel();
        }

        let controls = self.controls.materialized();
        self.transmit(station, Message::ControlData { station, controls }, 0);
    }

    fn retry_current(&mut self, station: StationAddress) {
        match self.tracker.last_sent.get(&station).cloned() {
            Some(message) => self.transmit(station, message, 0),
            None => {
                logging::debug!(self.log, "retry requested with no prior transmission";
                                "context" => "retry",
                                "station" => %station);
            }
        }
    }

    fn poll_next(&mut self, after: Option<StationAddress>) {
        let snapshot = self.state.snapshot();

        let station = match self.select_pollable(after, &snapshot) {
            Some(station) => station,
            None => {
                logging::debug!(self.log, "no pollable station"; "context" => "poll");
                return;
            }
        };

        let message = if snapshot.slave(station).acknowledgment_pending {
            Message::AcknowledgeAndPoll { station }
        } else {
            Message::Poll {
                station,
                secure: self.secure_polls,
            }
        };

        let now = self.clock.now_nanos();
        let gap = self.poll_min_gap.as_nanos() as u64;
        let delay = match self.tracker.last_poll_at {
            Some(last) => (last + gap).saturating_sub(now),
            None => 0,
        };

        self.tracker.last_poll_at = Some(now + delay);
        self.tracker.last_polled = Some(station);
        self.transmit(station, message, delay);
    }

    /// Round-robin by ascending address, wrapping after `after`, skipping
    /// slaves that are failed or were never initialized.
    fn select_pollable(
        &self,
        after: Option<StationAddress>,
        snapshot: &ControllerState,
    ) -> Option<StationAddress> {
        if self.stations.is_empty() {
            return None;
        }

        let start = match after {
            Some(after) => match self.stations.iter().position(|&s| s == after) {
                Some(index) => index + 1,
                None => panic!("Unknown station {} in poll rotation", after),
            },
            None => 0,
        };

        (0..self.stations.len())
            .map(|offset| self.stations[(start + offset) % self.stations.len()])
            .find(|&station| {
                let phase = snapshot.slave(station).phase;
                phase != SlavePhase::Failed && phase != SlavePhase::Uninitialized
            })
    }

    fn schedule_control_delivery(&mut self) {
        let snapshot = self.state.snapshot();
        let deadline = self.clock.now_nanos() + self.coalesce_window.as_nanos() as u64;

        let stations = self.stations.clone();
        for station in stations {
            if !snapshot.slave(station).control_pending {
                continue;
            }

            // Re-arming replaces the open window, which is what coalesces a
            // burst of control changes into one delivery.
            if let Some(previous) = self.coalescers.remove(&station) {
                previous.cancel();
            }

            let events = self.events.clone();
            let handle = self.scheduler.schedule_at_nanos(
                deadline,
                Box::new(move || {
                    events.submit(Event::ControlDeliveryDue {
                        ts: timestamp_millis(),
                        station,
                    });
                }),
            );

            self.coalescers.insert(station, handle);
        }
    }

    /// Records bookkeeping, arms the response timer and moves the message
    /// out. `delay_nanos` defers the physical send without deferring the
    /// bookkeeping, so deferred tasks touch no executor state.
    fn transmit(&mut self, station: StationAddress, message: Message, delay_nanos: u64) {
        let send_at = self.clock.now_nanos() + delay_nanos;

        logging::trace!(self.log, "transmitting";
                        "context" => "transmit",
                        "station" => %station,
                        "message" => message.kind(),
                        "deferred_nanos" => delay_nanos);

        self.tracker.last_sent.insert(station, message.clone());
        self.tracker.send_time.insert(station, send_at);
        self.arm_response_timer(station, send_at);

        self.observer.observe(&Observation::MessageSent {
            station,
            kind: message.kind(),
        });

        if delay_nanos == 0 {
            self.sender.send(&message);
        } else {
            let sender = self.sender.clone();
            let handle = self
                .scheduler
                .schedule_at_nanos(send_at, Box::new(move || sender.send(&message)));

            self.deferred.retain(|pending| !pending.is_settled());
            self.deferred.push(handle);
        }
    }

    /// Arms the single-flight response timer for a station, replacing any
    /// prior one. The fired task checks the arm sequence and the activity log
    /// before injecting a timeout.
    fn arm_response_timer(&mut self, station: StationAddress, send_at: u64) {
        let deadline = send_at + self.response_timeout.as_nanos() as u64;

        self.arm_seq += 1;
        let seq = self.arm_seq;

        if let Some(previous) = self.timers.remove(&station) {
            previous.cancel();
        }
        self.guards.arm(station, seq);

        let guards = self.guards.clone();
        let activity = self.activity.clone();
        let events = self.events.clone();

        let handle = self.scheduler.schedule_at_nanos(
            deadline,
            Box::new(move || {
                if !guards.is_current(station, seq) {
                    return;
                }
                if activity.active_since(station, send_at) {
                    return;
                }

                events.submit(Event::ResponseTimeout {
                    ts: timestamp_millis(),
                    station,
                });
            }),
        );

        self.timers.insert(station, handle);
    }

    fn cancel_all_timers(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.cancel();
        }
        self.guards.clear_all();

        for (_, handle) in self.coalescers.drain() {
            handle.cancel();
        }

        for handle in self.deferred.drain(..) {
            handle.cancel();
        }
    }
}
