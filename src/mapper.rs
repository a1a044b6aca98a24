//! Port mapping on the home gateway (UPnP / NAT-PMP).
//!
//! Mapping is opportunistic: punching works without it, so failures are
//! only logged.

use crate::Result;
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRequest {
    pub protocol: Protocol,
    pub internal_port: u16,
    pub external_port: u16,
    pub lease_seconds: u32,
    pub description: String,
}

/// Implementations must bound their own waiting time.
pub trait PortMapper: Send + Sync {
    fn request_mapping(&self, req: &MappingRequest) -> Result<()>;
}

/// run `req` off the calling thread, the outcome is only logged
pub(crate) fn spawn_mapping(mapper: Arc<dyn PortMapper>, req: MappingRequest) -> JoinHandle<()> {
    spawn(move || match mapper.request_mapping(&req) {
        Ok(()) => log::info!(
            "port mapping created: {} -> {} ({:?})",
            req.internal_port,
            req.external_port,
            req.protocol
        ),
        Err(e) => log::warn!("port mapping failed: {}", e),
    })
}

#[cfg(feature = "upnp")]
pub use igd::IgdMapper;

#[cfg(feature = "upnp")]
mod igd {
    use super::{MappingRequest, PortMapper, Protocol};
    use crate::{Error, Result};
    use igd_next::{PortMappingProtocol, SearchOptions};
    use std::net::{IpAddr, SocketAddr, UdpSocket};
    use std::time::Duration;

    /// UPnP IGD mapper
    pub struct IgdMapper {
        pub search_timeout: Duration,
    }

    impl Default for IgdMapper {
        fn default() -> Self {
            Self {
                search_timeout: Duration::from_secs(5),
            }
        }
    }

    /// the local address the OS would use to reach `gateway`
    fn local_ip_towards(gateway: SocketAddr) -> Result<IpAddr> {
        let s = UdpSocket::bind(("0.0.0.0", 0))?;
        s.connect(gateway)?;
        Ok(s.local_addr()?.ip())
    }

    impl PortMapper for IgdMapper {
        fn request_mapping(&self, req: &MappingRequest) -> Result<()> {
            let options = SearchOptions {
                timeout: Some(self.search_timeout),
                ..Default::default()
            };
            let gateway = igd_next::search_gateway(options)
                .map_err(|e| Error::Mapping(format!("no UPnP gateway found: {}", e)))?;
            log::debug!("UPnP gateway at {}", gateway.addr);

            let local_addr = SocketAddr::new(local_ip_towards(gateway.addr)?, req.internal_port);
            let protocol = match req.protocol {
                Protocol::Udp => PortMappingProtocol::UDP,
                Protocol::Tcp => PortMappingProtocol::TCP,
            };

            gateway
                .add_port(
                    protocol,
                    req.external_port,
                    local_addr,
                    req.lease_seconds,
                    &req.description,
                )
                .map_err(|e| Error::Mapping(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<MappingRequest>>);

    impl PortMapper for Recorder {
        fn request_mapping(&self, req: &MappingRequest) -> Result<()> {
            self.0.lock().unwrap().push(req.clone());
            Err(Error::Mapping("no gateway".into()))
        }
    }

    #[test]
    fn test_failure_is_not_fatal() {
        let rec = Arc::new(Recorder(Mutex::new(vec![])));
        let req = MappingRequest {
            protocol: Protocol::Udp,
            internal_port: 5000,
            external_port: 40000,
            lease_seconds: 3600,
            description: "test".into(),
        };

        spawn_mapping(rec.clone(), req.clone()).join().unwrap();
        assert_eq!(*rec.0.lock().unwrap(), vec![req]);
    }
}
