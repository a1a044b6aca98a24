//! Stream binding.
//!
//! Any reliable byte stream implementing [`Duplex`] can carry a session, a
//! TLS or QUIC stream included. [`std::net::TcpStream`] is provided.
//!
//! Each successful read is taken as one message. Nothing frames the stream,
//! so one send may arrive split over two reads, or two sends in one read.

mod stream;
pub use stream::StreamSession;
pub(crate) use stream::accept;

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Result, Write};
use std::net::{Shutdown::Both, SocketAddr, TcpStream};

pub trait Duplex: Read + Write + Send + Sync + 'static {
    fn try_clone_box(&self) -> Result<Box<dyn Duplex>>;
    fn shutdown(&self) -> Result<()>;
    fn peer_addr(&self) -> Result<SocketAddr>;
}

impl Duplex for TcpStream {
    fn try_clone_box(&self) -> Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> Result<()> {
        TcpStream::shutdown(self, Both)
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// a tcp socket that may share its local port with a listener and other connections
pub(crate) fn bind(local_addr: SocketAddr) -> Result<Socket> {
    let s = Socket::new(
        Domain::for_address(local_addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    s.set_reuse_address(true)?;
    #[cfg(unix)]
    s.set_reuse_port(true)?;
    s.bind(&local_addr.into())?;

    Ok(s)
}

pub(crate) fn listen(local_addr: SocketAddr) -> Result<Socket> {
    let s = bind(local_addr)?;
    s.listen(10)?;
    Ok(s)
}
