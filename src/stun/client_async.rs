use super::codec::{decode_binding_response, StunMessage};
use super::client::DEFAULT_TIMEOUT;
use crate::{Endpoint, Error, Result};
use std::io::{Error as IoError, ErrorKind::Other};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::{
    net::{lookup_host, UdpSocket},
    time::{timeout, Instant},
};

/// Async twin of [`super::StunClient`], returns a [`tokio::net::UdpSocket`].
pub struct Client {
    socket: UdpSocket,
    timeout: Duration,
}

impl Client {
    pub async fn bind(local_addr: SocketAddr) -> Result<Self> {
        let socket = crate::udp::bind_reusable(local_addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self::with_socket(UdpSocket::from_std(socket)?))
    }

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

    pub async fn discover_public_endpoint(
        &self,
        server_host: &str,
        server_port: u16,
    ) -> Result<Endpoint> {
        let v4 = self.socket.local_addr()?.is_ipv4();
        let server_addr = lookup_host((server_host, server_port))
            .await?
            .find(|a| a.is_ipv4() == v4)
            .ok_or(IoError::new(Other, "server name resolve fail"))?;

        let req = StunMessage::binding_request();
        self.socket.send_to(&req.encode(), server_addr).await?;
        log::debug!("binding request sent to {}", server_addr);

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 1500];
        loop {
            let (n, from) =
                match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                    Ok(r) => r?,
                    Err(_) => return Err(Error::StunTimeout(self.timeout)),
                };

            if from != server_addr {
                continue;
            }

            let (_, tid) = StunMessage::decode_header(&buf[..n])?;
            if tid != req.transaction_id {
                log::debug!("ignore response for another transaction");
                continue;
            }

            return decode_binding_response(&buf[..n]);
        }
    }
}

/// bind, query once, and hand back whatever endpoint is best known plus the socket
pub async fn discover_or_local(
    local_addr: SocketAddr,
    server_host: &str,
    server_port: u16,
    wait: Duration,
) -> Result<(Endpoint, UdpSocket)> {
    let c = Client::bind(local_addr).await?.timeout(wait);
    let ep = match timeout(wait * 2, c.discover_public_endpoint(server_host, server_port)).await {
        Ok(Ok(ep)) => ep,
        Ok(Err(e)) => {
            log::warn!("STUN query failed: {}, using local address", e);
            c.local_endpoint()?
        }
        Err(_) => c.local_endpoint()?,
    };
    Ok((ep, c.into_socket()))
}
