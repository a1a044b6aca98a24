use super::{bind_reusable, POLL_INTERVAL};
use crate::connection::{Context, PeerConnection, Writer};
use crate::proto::{Message, Status};
use crate::punch::Role;
use crate::registry::Registry;
use crate::{Endpoint, Error, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc,
};
use std::thread::spawn;

const MAX_DATAGRAM: usize = 1500;

/// Drives the punch handshake with one peer over a UDP socket
///
/// # example
/// ```no_run
/// use natlink::{udp::NatPunchSession, Context, Role};
/// use std::sync::mpsc::channel;
///
/// let (tx, rx) = channel();
/// let ctx = Context::new(tx);
/// let s = NatPunchSession::sibling(
///     "0.0.0.0:40000".parse().unwrap(),
///     "203.0.113.5:40000".parse().unwrap(),
///     Role::Initiator,
/// )
/// .unwrap();
/// let conn = s.start(&ctx).unwrap();
/// println!("{:?}", rx.recv().unwrap());
/// ```
pub struct NatPunchSession {
    socket: UdpSocket,
    remote: Endpoint,
    role: Role,
}

impl NatPunchSession {
    /// `socket` is connected to `remote` and used for this peer only.
    pub fn new(socket: UdpSocket, remote: Endpoint, role: Role) -> Result<Self> {
        socket
            .connect(SocketAddr::from(remote))
            .map_err(|e| Error::ConnectFailed(remote, e))?;

        Ok(Self {
            socket,
            remote,
            role,
        })
    }

    /// a new socket sharing `local_addr` with the STUN socket, dedicated to `remote`
    pub fn sibling(local_addr: SocketAddr, remote: Endpoint, role: Role) -> Result<Self> {
        let socket = bind_reusable(local_addr).map_err(|e| Error::ConnectFailed(remote, e))?;
        Self::new(socket, remote, role)
    }

    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    /// Register the connection, start its read loop and, as initiator, send the `PUNCH`.
    pub fn start(self, ctx: &Context) -> Result<PeerConnection> {
        self.run(ctx, None)
    }

    /// responder side when the peer's first datagram was read by the accept loop
    pub(crate) fn start_with(self, ctx: &Context, first: &[u8]) -> Result<PeerConnection> {
        self.run(ctx, Some(first))
    }

    fn run(self, ctx: &Context, first: Option<&[u8]>) -> Result<PeerConnection> {
        let reader = self.socket.try_clone()?;
        let remote = self.remote;

        let conn = PeerConnection::new(
            ctx.registry.next_id(),
            remote,
            Writer::Datagram(self.socket),
            None,
            ctx.events.clone(),
        );

        match ctx.registry.add_if_absent(remote, conn.clone()) {
            Ok(Some(old)) => old.close(),
            Ok(None) => {}
            Err(live) => {
                live.merge(self.role, first);
                return Ok(live);
            }
        }

        if let Some(first) = first {
            conn.on_receive(first);
        }

        {
            let c = conn.clone();
            let registry = ctx.registry.clone();
            conn.track(spawn(move || read_loop(c, reader, registry)));
        }

        if self.role == Role::Initiator {
            log::info!("punching towards {}", remote);
            if let Err(e) = conn.punch() {
                conn.fail(&e);
                return Err(Error::ConnectFailed(remote, e));
            }
        }

        Ok(conn)
    }
}

fn read_loop(conn: PeerConnection, socket: UdpSocket, registry: Registry) {
    if let Err(e) = socket.set_read_timeout(Some(POLL_INTERVAL)) {
        conn.fail(&e);
    }

    let mut buf = [0u8; MAX_DATAGRAM];
    while !conn.exiting() {
        match socket.recv(&mut buf) {
            Ok(n) => {
                if !conn.on_receive(&buf[..n]) {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            //peer's port not open yet, its PUNCH may still come
            Err(e) if e.kind() == ErrorKind::ConnectionRefused && !conn.is_connected() => {
                log::trace!("{} refused while punching", conn.remote());
            }
            Err(e) => {
                conn.fail(&e);
                break;
            }
        }
    }

    conn.finish(&registry);
}

/// Answer peers punching towards `socket`, the unconnected STUN socket.
///
/// A `PUNCH` from an unknown source starts a responder session on a sibling
/// socket. Datagrams from registered peers that still land here are handed
/// to their connection.
pub(crate) fn accept(socket: UdpSocket, ctx: Context, exit: Arc<AtomicBool>) {
    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log::warn!("accept loop not started: {}", e);
            return;
        }
    };
    let _ = socket.set_read_timeout(Some(POLL_INTERVAL));

    let mut buf = [0u8; MAX_DATAGRAM];
    while !exit.load(Relaxed) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok((n, from)) => (n, Endpoint::from(from)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                log::debug!("accept recv: {}", e);
                continue;
            }
        };

        if let Some(conn) = ctx.registry.get(&from).filter(|c| !c.state().is_terminal()) {
            conn.on_receive(&buf[..n]);
            continue;
        }

        match Message::parse(&buf[..n]) {
            Some(Message::Status(Status::Punch)) => {
                log::info!("punch from {}", from);
                let started = NatPunchSession::sibling(local_addr, from, Role::Responder)
                    .and_then(|s| s.start_with(&ctx, &buf[..n]));
                if let Err(e) = started {
                    log::warn!("could not answer {}: {}", from, e);
                }
            }
            _ => log::debug!("ignore {} bytes from unknown {}", n, from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Event;
    use crate::punch::State;
    use std::sync::mpsc::{channel, Receiver};
    use std::time::{Duration, Instant};

    fn loopback() -> UdpSocket {
        bind_reusable("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    fn addr(s: &UdpSocket) -> Endpoint {
        s.local_addr().unwrap().into()
    }

    fn expect(rx: &Receiver<Event>, ev: Event) {
        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got, ev);
    }

    #[test]
    fn test_both_sides_punch() {
        let (sa, sb) = (loopback(), loopback());
        let (ea, eb) = (addr(&sa), addr(&sb));

        let (tx_a, rx_a) = channel();
        let (tx_b, rx_b) = channel();
        let (ctx_a, ctx_b) = (Context::new(tx_a), Context::new(tx_b));

        let start = Instant::now();
        let a = NatPunchSession::new(sa, eb, Role::Initiator)
            .unwrap()
            .start(&ctx_a)
            .unwrap();
        let b = NatPunchSession::new(sb, ea, Role::Initiator)
            .unwrap()
            .start(&ctx_b)
            .unwrap();

        expect(&rx_a, Event::Connected(eb));
        expect(&rx_b, Event::Connected(ea));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(a.state(), State::Connected);
        assert_eq!(b.state(), State::Connected);

        a.send(&Message::Msg("hello".into()).encode()).unwrap();
        expect(
            &rx_b,
            Event::Message {
                from: ea,
                payload: "hello".into(),
            },
        );

        //no second Connected from the crossing acknowledgments
        assert!(rx_a.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(rx_b.recv_timeout(Duration::from_millis(300)).is_err());

        a.close();
        a.join();
        expect(&rx_a, Event::Closed(eb));
        expect(&rx_b, Event::Closed(ea));
        assert!(ctx_a.registry.is_empty());
        b.join();
        assert!(ctx_b.registry.is_empty());
        assert!(matches!(b.send(b"MSG:late"), Err(Error::NotConnected(_))));
    }

    #[test]
    fn test_send_before_connected() {
        let (sa, sb) = (loopback(), loopback());
        let eb = addr(&sb);
        let (tx, _rx) = channel();
        let ctx = Context::new(tx);

        let a = NatPunchSession::new(sa, eb, Role::Initiator)
            .unwrap()
            .start(&ctx)
            .unwrap();
        assert_eq!(a.state(), State::Punching);
        assert!(matches!(a.send(b"MSG:x"), Err(Error::NotConnected(e)) if e == eb));

        //operator cancels the stuck punch
        a.close();
        a.join();
        assert_eq!(a.state(), State::Closed);
        assert!(ctx.registry.is_empty());
    }

    #[test]
    fn test_registered_connection_is_kept() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let ep = addr(&peer);
        let (tx, rx) = channel();
        let ctx = Context::new(tx);

        //a responder registered first, as the accept loop would
        let s1 = loopback();
        let e1 = addr(&s1);
        let first = NatPunchSession::new(s1, ep, Role::Responder)
            .unwrap()
            .start(&ctx)
            .unwrap();
        let second = NatPunchSession::new(loopback(), ep, Role::Initiator)
            .unwrap()
            .start(&ctx)
            .unwrap();

        assert_eq!(second.id(), first.id());
        assert_eq!(ctx.registry.len(), 1);
        assert_eq!(first.state(), State::Punching);

        //one PUNCH from the kept connection, no CLOSE
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STATUS:PUNCH");
        assert_eq!(Endpoint::from(from), e1);
        peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        assert!(peer.recv_from(&mut buf).is_err());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        first.close();
        first.join();
    }

    #[test]
    fn test_accept_answers_punch() {
        let base = loopback();
        let eb = addr(&base);
        let (tx_b, rx_b) = channel();
        let ctx_b = Context::new(tx_b);
        let exit = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let (ctx, exit) = (ctx_b.clone(), exit.clone());
            spawn(move || accept(base, ctx, exit))
        };

        let sa = loopback();
        let ea = addr(&sa);
        let (tx_a, rx_a) = channel();
        let ctx_a = Context::new(tx_a);
        let a = NatPunchSession::new(sa, eb, Role::Initiator)
            .unwrap()
            .start(&ctx_a)
            .unwrap();

        expect(&rx_a, Event::Connected(eb));
        expect(&rx_b, Event::Connected(ea));
        assert_eq!(ctx_b.registry.list().into_iter().collect::<Vec<_>>(), vec![ea]);

        ctx_b
            .registry
            .broadcast(&Message::Msg("pong".into()).encode(), None)
            .unwrap();
        expect(
            &rx_a,
            Event::Message {
                from: eb,
                payload: "pong".into(),
            },
        );

        exit.store(true, Relaxed);
        acceptor.join().unwrap();
        ctx_b.registry.shutdown();
        expect(&rx_a, Event::Closed(eb));
        a.join();
    }
}
