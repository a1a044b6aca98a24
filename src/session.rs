use crate::config::Config;
use crate::connection::{Context, Event, PeerConnection, Transport};
use crate::mapper::{self, MappingRequest, PortMapper, Protocol};
use crate::proto::Message;
use crate::punch::Role;
use crate::registry::Delivery;
use crate::stun::{NatType, StunClient};
use crate::tcp::{self, StreamSession};
use crate::udp::{self, NatPunchSession};
use crate::{Endpoint, Error, Result};
use socket2::Socket;
use std::collections::BTreeSet;
use std::net::{Shutdown, UdpSocket};
use std::sync::mpsc::Sender;
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc,
};
use std::thread::{spawn, JoinHandle};

/// Peer to peer session over one local port
///
/// Learns its public endpoint from STUN, then punches towards peers and
/// answers peers punching towards it. Everything heard from peers arrives
/// on the event channel given to [`SessionController::new`].
///
/// # example
/// ```no_run
/// use natlink::{Config, Event, SessionController};
/// use std::sync::mpsc::channel;
///
/// let (tx, rx) = channel();
/// let mut s = SessionController::new(Config::default(), tx).unwrap();
/// println!("tell the peer: {}", s.public_endpoint());
///
/// s.start_as_initiator("203.0.113.5:40000").unwrap();
/// while let Ok(ev) = rx.recv() {
///     if let Event::Connected(_) = ev {
///         s.send("hello", None).unwrap();
///     }
/// }
/// ```
pub struct SessionController {
    config: Config,
    base: UdpSocket,
    local: Endpoint,
    public: Endpoint,
    nat_type: NatType,
    ctx: Context,
    exit: Arc<AtomicBool>,
    listener: Option<Socket>,
    acceptor: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Bind the local socket and discover the public endpoint.
    ///
    /// Failing to bind is an error. A failed discovery falls back to the
    /// local address.
    pub fn new(config: Config, events: Sender<Event>) -> Result<Self> {
        let mapper = default_mapper(&config);
        Self::with_mapper(config, events, mapper)
    }

    pub fn with_mapper(
        config: Config,
        events: Sender<Event>,
        mapper: Option<Arc<dyn PortMapper>>,
    ) -> Result<Self> {
        let client = StunClient::bind(config.bind_addr)?.timeout(config.stun_timeout);
        let local = client.local_endpoint()?;
        log::info!("bound to {}", local);

        let (public, nat_type) = match &config.stun_server {
            Some(server) => match client.discover_public_endpoint(&server.host, server.port) {
                Ok(ep) => {
                    log::info!("public endpoint {} (via {})", ep, server);
                    (ep, nat_type(&client, &config, local, ep))
                }
                Err(e) => {
                    log::warn!("STUN via {} failed: {}, using local {}", server, e, local);
                    (local, NatType::Unknown)
                }
            },
            None => (local, NatType::Unknown),
        };

        if let Some(mapper) = mapper {
            let protocol = match config.transport {
                Transport::Datagram => Protocol::Udp,
                Transport::Stream => Protocol::Tcp,
            };
            mapper::spawn_mapping(
                mapper,
                MappingRequest {
                    protocol,
                    internal_port: local.port(),
                    external_port: public.port(),
                    lease_seconds: config.mapping_lease,
                    description: config.mapping_description.clone(),
                },
            );
        }

        let mut ctx = Context::new(events);
        ctx.heartbeat = config.heartbeat_interval;

        Ok(Self {
            config,
            base: client.into_socket(),
            local,
            public,
            nat_type,
            ctx,
            exit: Arc::new(AtomicBool::new(false)),
            listener: None,
            acceptor: None,
        })
    }

    pub fn public_endpoint(&self) -> Endpoint {
        self.public
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    pub fn nat_type(&self) -> NatType {
        self.nat_type
    }

    pub fn transport(&self) -> Transport {
        self.config.transport
    }

    /// answer peers and punch towards `remote`
    pub fn start_as_initiator(&mut self, remote: &str) -> Result<Endpoint> {
        remote.parse::<Endpoint>()?;
        self.start_as_responder()?;
        self.connect(remote)
    }

    /// Start the accept loop on the local port. Calling it again is a no-op.
    pub fn start_as_responder(&mut self) -> Result<()> {
        if self.acceptor.is_some() {
            return Ok(());
        }

        let ctx = self.ctx.clone();
        let exit = self.exit.clone();
        let acceptor = match self.config.transport {
            Transport::Datagram => {
                let socket = self.base.try_clone()?;
                spawn(move || udp::accept(socket, ctx, exit))
            }
            Transport::Stream => {
                let listener = tcp::listen(self.local.into())?;
                self.listener = Some(listener.try_clone()?);
                spawn(move || tcp::accept(listener, ctx, exit))
            }
        };
        log::info!("waiting for peers on {}", self.local);

        self.acceptor = Some(acceptor);
        Ok(())
    }

    /// Punch towards `remote`. A live connection to it is kept as is.
    pub fn connect(&self, remote: &str) -> Result<Endpoint> {
        let remote: Endpoint = remote.parse()?;

        if let Some(conn) = self.ctx.registry.get(&remote) {
            if !conn.state().is_terminal() {
                log::info!("already {:?} with {}", conn.state(), remote);
                return Ok(remote);
            }
        }

        let local_addr = self.local.into();
        match self.config.transport {
            Transport::Datagram => {
                NatPunchSession::sibling(local_addr, remote, Role::Initiator)?.start(&self.ctx)?;
            }
            Transport::Stream => {
                StreamSession::connect(local_addr, remote, self.config.connect_timeout)?
                    .start(&self.ctx)?;
            }
        }

        Ok(remote)
    }

    /// Send `payload` to `target`, or to every connected peer.
    pub fn send(&self, payload: &str, target: Option<&str>) -> Result<Delivery> {
        let target = target.map(str::parse::<Endpoint>).transpose()?;
        let frame = Message::Msg(payload.to_string()).encode();
        self.ctx.registry.broadcast(&frame, target)
    }

    pub fn disconnect(&self, remote: &str) -> Result<()> {
        let remote: Endpoint = remote.parse()?;
        let conn = self
            .ctx
            .registry
            .remove(&remote)
            .ok_or(Error::NotConnected(remote))?;

        conn.close();
        conn.join();
        log::info!("disconnected from {}", remote);
        Ok(())
    }

    pub fn list_peers(&self) -> BTreeSet<Endpoint> {
        self.ctx.registry.list()
    }

    pub fn peer(&self, remote: &Endpoint) -> Option<PeerConnection> {
        self.ctx.registry.get(remote)
    }

    /// Stop accepting, close every connection and wait for all threads.
    pub fn shutdown(&mut self) {
        self.exit.store(true, Relaxed);

        if let Some(listener) = self.listener.take() {
            let _ = listener.shutdown(Shutdown::Both);
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }

        self.ctx.registry.shutdown();
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// ask the second server from the same socket and compare the mappings
fn nat_type(client: &StunClient, config: &Config, local: Endpoint, public: Endpoint) -> NatType {
    let second = config.nat_check_server.as_ref().and_then(|server| {
        client
            .discover_public_endpoint(&server.host, server.port)
            .map_err(|e| log::debug!("NAT check via {} failed: {}", server, e))
            .ok()
    });

    let nat_type = NatType::classify(local, public, second);
    match nat_type {
        NatType::Symmetric => log::warn!(
            "NAT type {}: mapped to {} and {:?}, hole punching will likely fail",
            nat_type,
            public,
            second
        ),
        _ => log::info!("NAT type {}", nat_type),
    }
    nat_type
}

#[cfg(feature = "upnp")]
fn default_mapper(config: &Config) -> Option<Arc<dyn PortMapper>> {
    if config.upnp {
        Some(Arc::new(mapper::IgdMapper::default()))
    } else {
        None
    }
}

#[cfg(not(feature = "upnp"))]
fn default_mapper(config: &Config) -> Option<Arc<dyn PortMapper>> {
    if config.upnp {
        log::warn!("built without the upnp feature, no port mapping");
    }
    None
}
