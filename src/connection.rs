//! One channel to one peer, shared by the datagram and stream bindings.

use crate::proto::Message;
use crate::punch::{Handshake, Role, State};
use crate::registry::{Link, Registry};
use crate::tcp::Duplex;
use crate::{Endpoint, Error, Result};
use std::io::{self, Write};
use std::net::UdpSocket;
use std::str::FromStr;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// What the owner of a session hears about its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(Endpoint),
    Message { from: Endpoint, payload: String },
    Closed(Endpoint),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transport {
    Datagram,
    Stream,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Transport::Datagram),
            "tcp" => Ok(Transport::Stream),
            _ => Err(format!("unknown transport {:?}, expected udp or tcp", s)),
        }
    }
}

/// Shared by every session started against one registry.
#[derive(Clone)]
pub struct Context {
    pub registry: Registry,
    pub events: Sender<Event>,
    pub heartbeat: Duration,
}

impl Context {
    pub fn new(events: Sender<Event>) -> Self {
        Self {
            registry: Registry::new(),
            events,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

pub(crate) enum Writer {
    Datagram(UdpSocket),
    Stream(Box<dyn Duplex>),
}

struct Inner {
    id: u64,
    remote: Endpoint,
    transport: Transport,
    writer: Mutex<Writer>,
    //shuts the stream down without taking the writer lock
    stream_ctl: Option<Box<dyn Duplex>>,
    handshake: Mutex<Handshake>,
    last_activity: Mutex<Instant>,
    exit: Arc<(Mutex<bool>, Condvar)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: Sender<Event>,
}

/// Handle to an established (or establishing) channel, cheap to clone.
///
/// Writes are serialized, so datagrams or stream bytes of concurrent senders
/// never interleave. Inbound payloads are delivered as [`Event::Message`].
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Inner>,
}

impl PeerConnection {
    pub(crate) fn new(
        id: u64,
        remote: Endpoint,
        writer: Writer,
        stream_ctl: Option<Box<dyn Duplex>>,
        events: Sender<Event>,
    ) -> Self {
        let transport = match writer {
            Writer::Datagram(_) => Transport::Datagram,
            Writer::Stream(_) => Transport::Stream,
        };

        Self {
            inner: Arc::new(Inner {
                id,
                remote,
                transport,
                writer: Mutex::new(writer),
                stream_ctl,
                handshake: Default::default(),
                last_activity: Mutex::new(Instant::now()),
                exit: Default::default(),
                tasks: Default::default(),
                events,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote(&self) -> Endpoint {
        self.inner.remote
    }

    pub fn transport(&self) -> Transport {
        self.inner.transport
    }

    pub fn state(&self) -> State {
        self.inner.handshake.lock().unwrap().state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// last time anything, heartbeats included, was received
    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock().unwrap()
    }

    /// send an already encoded application frame
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected(self.remote()));
        }
        Ok(self.write_raw(payload)?)
    }

    /// best-effort `CLOSE` to the peer, then stop the background threads. Idempotent.
    pub fn close(&self) {
        let bye = self.inner.handshake.lock().unwrap().close();
        if let Some(bye) = bye {
            log::debug!("closing {}", self.remote());
            let _ = self.write_raw(&bye.encode());
        }
        self.signal_exit();
    }

    /// wait for the read loop and heartbeat, unless called from one of them
    pub fn join(&self) {
        let tasks: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for t in tasks {
            if t.thread().id() != thread::current().id() {
                let _ = t.join();
            }
        }
    }

    pub(crate) fn write_raw(&self, buf: &[u8]) -> io::Result<()> {
        match &mut *self.inner.writer.lock().unwrap() {
            Writer::Datagram(socket) => socket.send(buf).map(|_| ()),
            Writer::Stream(stream) => {
                stream.write_all(buf)?;
                stream.flush()
            }
        }
    }

    /// enter `Punching` and send the one `PUNCH`
    pub(crate) fn punch(&self) -> io::Result<()> {
        let mut handshake = self.inner.handshake.lock().unwrap();
        match handshake.punch() {
            Some(msg) => self.write_raw(&msg.encode()),
            None => Ok(()),
        }
    }

    pub(crate) fn touch(&self) {
        *self.inner.last_activity.lock().unwrap() = Instant::now();
    }

    /// Feed one inbound frame to the handshake. Returns false once the
    /// connection is closed and its read loop should stop.
    pub(crate) fn on_receive(&self, buf: &[u8]) -> bool {
        self.touch();
        let remote = self.remote();

        let msg = match Message::parse(buf) {
            Some(msg) => msg,
            None => {
                log::debug!("ignore unrecognized {} bytes from {}", buf.len(), remote);
                return !self.exiting();
            }
        };

        let step = {
            let mut handshake = self.inner.handshake.lock().unwrap();
            let step = handshake.on_message(msg);
            if let Some(reply) = &step.reply {
                if let Err(e) = self.write_raw(&reply.encode()) {
                    log::debug!("reply to {} failed: {}", remote, e);
                }
            }
            step
        };

        if step.connected {
            log::info!("connected with {}", remote);
            let _ = self.inner.events.send(Event::Connected(remote));
        }
        if let Some(payload) = step.deliver {
            let _ = self.inner.events.send(Event::Message {
                from: remote,
                payload,
            });
        }
        if step.closed {
            log::info!("{} closed the connection", remote);
            self.signal_exit();
            return false;
        }

        !self.exiting()
    }

    /// Another session towards the same peer lost the registration race.
    /// Feed its first frame here and, for an initiator, punch if still idle.
    pub(crate) fn merge(&self, role: Role, first: Option<&[u8]>) {
        log::debug!("keeping the registered connection to {}", self.remote());
        if let Some(first) = first {
            self.on_receive(first);
        }
        if role == Role::Initiator {
            if let Err(e) = self.punch() {
                self.fail(&e);
            }
        }
    }

    /// orderly close by the peer's transport
    pub(crate) fn on_eof(&self) {
        self.inner.handshake.lock().unwrap().close();
        self.signal_exit();
    }

    pub(crate) fn fail(&self, e: &io::Error) {
        log::warn!("connection with {} lost: {}", self.remote(), e);
        self.inner.handshake.lock().unwrap().fail();
        self.signal_exit();
    }

    pub(crate) fn exiting(&self) -> bool {
        *self.inner.exit.0.lock().unwrap()
    }

    /// sleep up to `timeout`, returns true if the connection is going away
    pub(crate) fn wait_exit(&self, timeout: Duration) -> bool {
        let (exit, cond) = &*self.inner.exit;
        let (exit, _) = cond
            .wait_timeout_while(exit.lock().unwrap(), timeout, |exit| !*exit)
            .unwrap();
        *exit
    }

    fn signal_exit(&self) {
        let (exit, cond) = &*self.inner.exit;
        *exit.lock().unwrap() = true;
        cond.notify_all();

        if let Some(ctl) = &self.inner.stream_ctl {
            let _ = ctl.shutdown();
        }
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        self.inner.tasks.lock().unwrap().push(task);
    }

    /// last step of a read loop: evict our own registry entry and tell the listener
    pub(crate) fn finish(&self, registry: &Registry) {
        self.inner.handshake.lock().unwrap().close();
        registry.remove_if(&self.remote(), self.id());
        log::debug!("read loop for {} stopped", self.remote());
        let _ = self.inner.events.send(Event::Closed(self.remote()));
    }
}

impl Link for PeerConnection {
    fn id(&self) -> u64 {
        PeerConnection::id(self)
    }

    fn is_connected(&self) -> bool {
        PeerConnection::is_connected(self)
    }

    fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    fn send(&self, payload: &[u8]) -> Result<()> {
        PeerConnection::send(self, payload)
    }

    fn close(&self) {
        PeerConnection::close(self)
    }

    fn join(&self) {
        PeerConnection::join(self)
    }
}
