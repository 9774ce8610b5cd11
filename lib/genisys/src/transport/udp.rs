//! Production datagram endpoint: a mio UDP socket drained by a dedicated
//! poll thread. Callbacks run on that thread and only ever post events, so
//! the controller loop is never re-entered.

use crate::transport::{DatagramEndpoint, EndpointListener};
use ballast::logging::{self, Logger};
use mio::net::UdpSocket;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const SOCKET_TOKEN: Token = Token(0);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RECV_BUF_SIZE: usize = 2048;

pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    listener: Mutex<Option<Arc<dyn EndpointListener>>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    log: Logger,
}

impl UdpEndpoint {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        bind: SocketAddr,
        log: L,
    ) -> io::Result<UdpEndpoint> {
        let socket = UdpSocket::bind(&bind)?;

        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        Ok(UdpEndpoint {
            socket: Arc::new(socket),
            listener: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            log,
        })
    }

    /// Bound local address, useful when binding to port 0.
    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn run(
        socket: Arc<UdpSocket>,
        listener: Arc<dyn EndpointListener>,
        shutdown: Arc<AtomicBool>,
        log: Logger,
    ) {
        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                logging::error!(log, "poll creation failed"; "context" => "udp", "error" => %err);
                listener.on_transport_down(Some(err));
                return;
            }
        };

        if let Err(err) = poll.register(
            &*socket,
            SOCKET_TOKEN,
            Ready::readable(),
            PollOpt::edge(),
        ) {
            logging::error!(log, "socket registration failed"; "context" => "udp", "error" => %err);
            listener.on_transport_down(Some(err));
            return;
        }

        let mut events = Events::with_capacity(64);
        let mut buf = [0u8; RECV_BUF_SIZE];

        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }

            if let Err(err) = poll.poll(&mut events, Some(POLL_INTERVAL)) {
                logging::error!(log, "poll failed"; "context" => "udp", "error" => %err);
                listener.on_transport_down(Some(err));
                return;
            }

            for _event in &events {
                // Edge triggered: drain until the socket would block.
                loop {
                    match socket.recv_from(&mut buf) {
                        Ok((len, remote)) => {
                            logging::trace!(log, "datagram received";
                                            "context" => "udp",
                                            "remote" => %remote,
                                            "len" => len);
                            listener.on_datagram(remote, &buf[..len]);
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            logging::error!(log, "receive failed";
                                            "context" => "udp",
                                            "error" => %err);
                            listener.on_transport_down(Some(err));
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl DatagramEndpoint for UdpEndpoint {
    fn set_listener(&self, listener: Arc<dyn EndpointListener>) {
        *self.listener.lock().expect("Listener slot poisoned") = Some(listener);
    }

    fn start(&self) -> io::Result<()> {
        let mut worker = self.worker.lock().expect("Worker slot poisoned");

        if worker.is_some() {
            return Ok(());
        }

        let listener = self
            .listener
            .lock()
            .expect("Listener slot poisoned")
            .clone()
            .expect("Listener must be installed before start");

        self.shutdown.store(false, Ordering::SeqCst);

        let socket = self.socket.clone();
        let shutdown = self.shutdown.clone();
        let log = self.log.clone();
        let worker_listener = listener.clone();

        let handle = thread::Builder::new()
            .name("genisys-udp".into())
            .spawn(move || Self::run(socket, worker_listener, shutdown, log))?;

        *worker = Some(handle);

        logging::info!(self.log, "endpoint started"; "context" => "udp");
        listener.on_transport_up();

        Ok(())
    }

    fn stop(&self) {
        let handle = self.worker.lock().expect("Worker slot poisoned").take();

        if let Some(handle) = handle {
            self.shutdown.store(true, Ordering::SeqCst);
            drop(handle.join());

            logging::info!(self.log, "endpoint stopped"; "context" => "udp");

            if let Some(listener) = self
                .listener
                .lock()
                .expect("Listener slot poisoned")
                .clone()
            {
                listener.on_transport_down(None);
            }
        }
    }

    fn send(&self, remote: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        match self.socket.send_to(datagram, &remote) {
            Ok(_) => Ok(()),
            // Non-blocking discipline: a saturated socket drops the datagram
            // rather than stalling the executor.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                logging::debug!(self.log, "send would block, datagram dropped";
                                "context" => "udp",
                                "remote" => %remote);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}
