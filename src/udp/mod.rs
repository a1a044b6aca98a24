//! UDP hole punching.
//!
//! use `NatPunchSession` to punch towards one peer over a socket.
//!
//! use `accept` to answer peers punching towards a shared local port.

mod session;
pub use session::NatPunchSession;
pub(crate) use session::accept;

use socket2::{Domain, Protocol, Socket, Type};
use std::io::Result;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// how often blocked receives wake up to check for close
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bind a UDP socket with SO_REUSEADDR set.
///
/// Several such sockets may share one local address: the STUN socket stays
/// unconnected, every peer gets its own sibling `connect()`ed to it, and the
/// OS dispatches a peer's datagrams to the connected sibling.
pub fn bind_reusable(local_addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(local_addr),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&local_addr.into())?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_dispatch() {
        let base = bind_reusable("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = base.local_addr().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();

        let sibling = bind_reusable(local).unwrap();
        sibling.connect(peer.local_addr().unwrap()).unwrap();

        peer.send_to(b"peer", local).unwrap();
        stranger.send_to(b"stranger", local).unwrap();

        let mut buf = [0u8; 16];
        sibling.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let n = sibling.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"peer");

        base.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let (n, from) = base.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"stranger");
        assert_eq!(from, stranger.local_addr().unwrap());
    }
}
