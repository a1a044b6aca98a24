use super::{bind, Duplex};
use crate::connection::{Context, PeerConnection, Writer};
use crate::proto::{self, HEARTBEAT};
use crate::punch::Role;
use crate::registry::Registry;
use crate::{Endpoint, Error, Result};
use socket2::Socket;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc,
};
use std::thread::{sleep, spawn};
use std::time::Duration;

const READ_BUF: usize = 4096;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Drives the punch handshake with one peer over a reliable stream.
pub struct StreamSession {
    stream: Box<dyn Duplex>,
    remote: Endpoint,
    role: Role,
}

impl StreamSession {
    pub fn new<S: Duplex>(stream: S, role: Role) -> Result<Self> {
        let remote = stream.peer_addr()?.into();
        Ok(Self {
            stream: Box::new(stream),
            remote,
            role,
        })
    }

    /// connect from `local_addr`, the port a listener may already be bound to
    pub fn connect(local_addr: SocketAddr, remote: Endpoint, timeout: Duration) -> Result<Self> {
        let s = bind(local_addr).map_err(|e| Error::ConnectFailed(remote, e))?;
        s.connect_timeout(&SocketAddr::from(remote).into(), timeout)
            .map_err(|e| Error::ConnectFailed(remote, e))?;

        let stream: TcpStream = s.into();
        Ok(Self {
            stream: Box::new(stream),
            remote,
            role: Role::Initiator,
        })
    }

    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    /// Register the connection, start read loop and heartbeat, send `PUNCH` as initiator.
    pub fn start(self, ctx: &Context) -> Result<PeerConnection> {
        let reader = self.stream.try_clone_box()?;
        let ctl = self.stream.try_clone_box()?;
        let remote = self.remote;

        let conn = PeerConnection::new(
            ctx.registry.next_id(),
            remote,
            Writer::Stream(self.stream),
            Some(ctl),
            ctx.events.clone(),
        );

        match ctx.registry.add_if_absent(remote, conn.clone()) {
            Ok(Some(old)) => old.close(),
            Ok(None) => {}
            Err(live) => {
                //the extra stream is dropped unused
                live.merge(self.role, None);
                return Ok(live);
            }
        }

        {
            let c = conn.clone();
            let registry = ctx.registry.clone();
            conn.track(spawn(move || read_loop(c, reader, registry)));
        }
        {
            let c = conn.clone();
            let interval = ctx.heartbeat;
            conn.track(spawn(move || heartbeat(c, interval)));
        }

        if self.role == Role::Initiator {
            if let Err(e) = conn.punch() {
                conn.fail(&e);
                return Err(Error::ConnectFailed(remote, e));
            }
        }

        Ok(conn)
    }
}

fn read_loop(conn: PeerConnection, mut reader: Box<dyn Duplex>, registry: Registry) {
    let mut buf = [0u8; READ_BUF];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                if !conn.exiting() {
                    log::info!("{} closed the stream", conn.remote());
                }
                conn.on_eof();
                break;
            }
            Ok(n) => match proto::strip_heartbeats(&buf[..n]) {
                Some(msg) => {
                    if !conn.on_receive(&msg) {
                        break;
                    }
                }
                None => {
                    log::trace!("heartbeat from {}", conn.remote());
                    conn.touch();
                }
            },
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if !conn.exiting() {
                    conn.fail(&e);
                }
                break;
            }
        }
    }

    conn.finish(&registry);
}

fn heartbeat(conn: PeerConnection, interval: Duration) {
    while !conn.wait_exit(interval) {
        if let Err(e) = conn.write_raw(&[HEARTBEAT]) {
            conn.fail(&e);
            break;
        }
    }
}

/// Accept streams on `listener` until `exit` is set.
///
/// Shutting the listener down wakes a blocked accept. Other accept errors
/// are logged and retried after a pause.
pub(crate) fn accept(listener: Socket, ctx: Context, exit: Arc<AtomicBool>) {
    loop {
        let accepted = listener.accept();
        if exit.load(Relaxed) {
            break;
        }

        let (s, addr) = match accepted {
            Ok(r) => r,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                sleep(ACCEPT_BACKOFF);
                continue;
            }
        };

        let stream: TcpStream = s.into();
        log::info!("stream from {:?}", addr.as_socket());

        let started = StreamSession::new(stream, Role::Responder).and_then(|s| s.start(&ctx));
        if let Err(e) = started {
            log::warn!("could not answer stream: {}", e);
        }
    }

    log::debug!("accept loop stopped");
}
