use super::codec::{decode_binding_response, StunMessage, TransactionId};
use crate::{udp, Endpoint, Error, Result};
use std::io::{Error as IoError, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Blocking STUN client
///
/// Owns the socket used for the query, so the NAT binding created by the
/// exchange can be reused for hole punching afterwards.
///
/// # example
/// ```no_run
/// use natlink::stun::StunClient;
///
/// let client = StunClient::bind("0.0.0.0:0".parse().unwrap()).unwrap();
/// let public = match client.discover_public_endpoint("stun.miwifi.com", 3478) {
///     Ok(ep) => ep,
///     Err(_) => client.local_endpoint().unwrap(),
/// };
/// let socket = client.into_socket();
/// ```
pub struct StunClient {
    socket: UdpSocket,
    timeout: Duration,
}

impl StunClient {
    /// bind an ephemeral socket with SO_REUSEADDR, so sibling sockets can share its port.
    pub fn bind(local_addr: SocketAddr) -> Result<Self> {
        let socket = udp::bind_reusable(local_addr)?;
        Ok(Self::with_socket(socket))
    }

    /// reuse a socket the caller already bound
    pub fn with_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_endpoint(&self) -> Result<Endpoint> {
        Ok(self.socket.local_addr()?.into())
    }

    pub fn into_socket(self) -> UdpSocket {
        self.socket
    }

    /// Send one binding request and wait for the matching response.
    ///
    /// Datagrams from other sources or for another transaction are skipped.
    /// No retry: a lost request or response ends in `StunTimeout`.
    pub fn discover_public_endpoint(&self, server_host: &str, server_port: u16) -> Result<Endpoint> {
        let server_addr = resolve(&self.socket, server_host, server_port)?;

        let req = StunMessage::binding_request();
        self.socket.send_to(&req.encode(), server_addr)?;
        log::debug!("binding request sent to {}", server_addr);

        let result = self.wait_response(server_addr, req.transaction_id);
        self.socket.set_read_timeout(None)?;
        result
    }

    fn wait_response(&self, server_addr: SocketAddr, id: TransactionId) -> Result<Endpoint> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::StunTimeout(self.timeout));
            }
            self.socket.set_read_timeout(Some(remaining))?;

            let mut buf = [0u8; 1500];
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(Error::StunTimeout(self.timeout))
                }
                Err(e) => return Err(e.into()),
            };

            if from != server_addr {
                log::trace!("ignore {} bytes from {}", n, from);
                continue;
            }

            let (_, tid) = StunMessage::decode_header(&buf[..n])?;
            if tid != id {
                log::debug!("ignore response for another transaction");
                continue;
            }

            return decode_binding_response(&buf[..n]);
        }
    }
}

/// first address of the server in the socket's family
pub(crate) fn resolve(socket: &UdpSocket, host: &str, port: u16) -> Result<SocketAddr> {
    let v4 = socket.local_addr()?.is_ipv4();
    (host, port)
        .to_socket_addrs()?
        .find(|a| a.is_ipv4() == v4)
        .ok_or_else(|| IoError::new(ErrorKind::Other, "server name resolve fail").into())
}
