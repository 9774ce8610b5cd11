//! Transport contract and the adapter that wires a datagram endpoint into
//! the controller: inbound datagrams decode into events, outbound messages
//! encode onto the wire. Each datagram is an atomic unit; nothing accumulates
//! across datagrams.

pub mod udp;

use crate::event::{Event, EventSink};
use crate::exec::{ActivityLog, MessageSender};
use crate::observe::{Observation, ObserverSink};
use crate::shared::StationAddress;
use crate::wire::codec::MessageCodec;
use crate::wire::message::{Direction, Message};
use ballast::logging::{self, Logger};
use ballast::time::{timestamp_millis, Clock};
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// A datagram endpoint. `send` must be non-blocking (queued or dropped by the
/// endpoint); lifecycle and inbound traffic are reported to the installed
/// listener, which must be set before `start`.
pub trait DatagramEndpoint: Send + Sync {
    fn set_listener(&self, listener: Arc<dyn EndpointListener>);
    fn start(&self) -> io::Result<()>;
    fn stop(&self);
    fn send(&self, remote: SocketAddr, datagram: &[u8]) -> io::Result<()>;
}

/// Callbacks from the endpoint. Implementations post events onto the
/// controller queue; they never re-enter the reducer.
pub trait EndpointListener: Send + Sync {
    fn on_transport_up(&self);
    fn on_transport_down(&self, cause: Option<io::Error>);
    fn on_datagram(&self, remote: SocketAddr, datagram: &[u8]);
}

/// Two-way mapping between station addresses and their remote endpoints,
/// built from validated configuration. Iteration order is ascending address.
pub struct StationDirectory {
    by_station: IndexMap<StationAddress, SocketAddr>,
    by_remote: HashMap<SocketAddr, StationAddress>,
}

impl StationDirectory {
    /// Builds the directory from (station, endpoint) pairs sorted ascending.
    pub fn new(stations: &[(StationAddress, SocketAddr)]) -> StationDirectory {
        let mut by_station = IndexMap::with_capacity(stations.len());
        let mut by_remote = HashMap::with_capacity(stations.len());

        for &(station, remote) in stations {
            by_station.insert(station, remote);
            by_remote.insert(remote, station);
        }

        StationDirectory {
            by_station,
            by_remote,
        }
    }

    #[inline]
    pub fn remote_of(&self, station: StationAddress) -> Option<SocketAddr> {
        self.by_station.get(&station).copied()
    }

    #[inline]
    pub fn station_of(&self, remote: &SocketAddr) -> Option<StationAddress> {
        self.by_remote.get(remote).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_station.len()
    }
}

/// Inbound half: decodes datagrams, filters out what the protocol must never
/// see, records semantic activity and submits `MessageReceived`.
pub struct TransportAdapter {
    codec: Arc<MessageCodec>,
    directory: Arc<StationDirectory>,
    events: Arc<dyn EventSink>,
    activity: Arc<ActivityLog>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ObserverSink>,
    log: Logger,
}

impl TransportAdapter {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        codec: Arc<MessageCodec>,
        directory: Arc<StationDirectory>,
        events: Arc<dyn EventSink>,
        activity: Arc<ActivityLog>,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn ObserverSink>,
        log: L,
    ) -> TransportAdapter {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        TransportAdapter {
            codec,
            directory,
            events,
            activity,
            clock,
            observer,
            log,
        }
    }
}

impl EndpointListener for TransportAdapter {
    fn on_transport_up(&self) {
        logging::info!(self.log, "transport up"; "context" => "transport");

        self.observer.observe(&Observation::TransportUp);
        self.events.submit(Event::TransportUp {
            ts: timestamp_millis(),
        });
    }

    fn on_transport_down(&self, cause: Option<io::Error>) {
        logging::warn!(self.log, "transport down";
                       "context" => "transport",
                       "cause" => ?cause);

        self.observer.observe(&Observation::TransportDown);
        self.events.submit(Event::TransportDown {
            ts: timestamp_millis(),
        });
    }

    fn on_datagram(&self, remote: SocketAddr, datagram: &[u8]) {
        let message = match self.codec.decode_datagram(datagram) {
            Ok(message) => message,
            Err(defect) => {
                // Wire defects are recovered locally: drop, count, move on.
                logging::trace!(self.log, "dropping defective datagram";
                                "context" => "ingress",
                                "remote" => %remote,
                                "defect" => %defect);
                self.observer
                    .observe(&Observation::DatagramDropped { reason: defect });
                return;
            }
        };

        let station = message.station();

        if message.direction() != Direction::SlaveToMaster {
            logging::debug!(self.log, "dropping master-bound message";
                            "context" => "ingress",
                            "station" => %station,
                            "message" => message.kind());
            self.observer.observe(&Observation::ContextualDrop {
                station: Some(station),
                kind: message.kind(),
            });
            return;
        }

        match self.directory.station_of(&remote) {
            Some(expected) if expected == station => (),
            _ => {
                logging::debug!(self.log, "dropping message from unknown or mismatched remote";
                                "context" => "ingress",
                                "remote" => %remote,
                                "station" => %station);
                self.observer.observe(&Observation::ContextualDrop {
                    station: Some(station),
                    kind: message.kind(),
                });
                return;
            }
        }

        self.activity.record(station, self.clock.now_nanos());

        self.observer.observe(&Observation::MessageReceived {
            station,
            kind: message.kind(),
        });
        self.events.submit(Event::MessageReceived {
            ts: timestamp_millis(),
            station,
            message,
        });
    }
}

/// Outbound half handed to the executor: resolve, encode, send.
pub struct AdapterSender {
    codec: Arc<MessageCodec>,
    endpoint: Arc<dyn DatagramEndpoint>,
    directory: Arc<StationDirectory>,
    log: Logger,
}

impl AdapterSender {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        codec: Arc<MessageCodec>,
        endpoint: Arc<dyn DatagramEndpoint>,
        directory: Arc<StationDirectory>,
        log: L,
    ) -> AdapterSender {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        AdapterSender {
            codec,
            endpoint,
            directory,
            log,
        }
    }
}

impl MessageSender for AdapterSender {
    fn send(&self, message: &Message) {
        let station = message.station();

        let remote = match self.directory.remote_of(station) {
            Some(remote) => remote,
            // The executor only ever targets configured stations.
            None => panic!("No endpoint configured for station {}", station),
        };

        let wire = self.codec.encode(message);

        if let Err(err) = self.endpoint.send(remote, &wire) {
            logging::warn!(self.log, "datagram send failed";
                           "context" => "egress",
                           "station" => %station,
                           "error" => %err);
        }
    }
}
