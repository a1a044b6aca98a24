use crate::connection::{Transport, DEFAULT_HEARTBEAT};
use crate::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// `host:port` of a STUN server, the host may be a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunServer {
    pub host: String,
    pub port: u16,
}

impl FromStr for StunServer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidEndpointFormat(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| Error::InvalidEndpointFormat(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::InvalidEndpointFormat(s.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for StunServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// local address of the STUN socket; punching reuses its port
    pub bind_addr: SocketAddr,
    /// `None` skips discovery, the local address is announced instead
    pub stun_server: Option<StunServer>,
    /// second server queried from the same socket to tell a symmetric NAT
    pub nat_check_server: Option<StunServer>,
    pub stun_timeout: Duration,
    pub transport: Transport,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// ask the gateway for a port mapping, needs the `upnp` feature
    pub upnp: bool,
    pub mapping_lease: u32,
    pub mapping_description: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 0).into(),
            stun_server: Some(StunServer {
                host: "stun.miwifi.com".into(),
                port: 3478,
            }),
            nat_check_server: Some(StunServer {
                host: "stun.l.google.com".into(),
                port: 19302,
            }),
            stun_timeout: crate::stun::DEFAULT_TIMEOUT,
            transport: Transport::Datagram,
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: DEFAULT_HEARTBEAT,
            upnp: false,
            mapping_lease: 3600,
            mapping_description: "P2P Hole Punching".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_server_parse() {
        let s: StunServer = "stun.l.google.com:19302".parse().unwrap();
        assert_eq!(s.host, "stun.l.google.com");
        assert_eq!(s.port, 19302);
        assert_eq!(s.to_string(), "stun.l.google.com:19302");

        let s: StunServer = "[::1]:3478".parse().unwrap();
        assert_eq!(s.host, "::1");

        assert!("nohost".parse::<StunServer>().is_err());
        assert!(":3478".parse::<StunServer>().is_err());
        assert!("host:port".parse::<StunServer>().is_err());
    }
}
