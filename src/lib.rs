//!Peer to peer connectivity between two hosts behind NAT, without a relay.
//!
//!A node behind a home gateway only receives traffic for outbound flows it opened itself.
//!To reach such a node, both sides have to send first, from the very port the other side will send to.
//!
//!## How natlink works
//!Each peer asks a STUN server which public ip and port its gateway assigned to its local socket.
//!The peers exchange these public endpoints out of band (chat, mail, a shared file).
//!
//!Then both send a `STATUS:PUNCH` to the other's public endpoint. The outgoing packet opens the
//!gateway for the reply, and the first side to hear a `PUNCH` answers `STATUS:CONNECTED`.
//!After that, text messages flow as `MSG:<payload>` until one side sends `STATUS:CLOSE`.
//!
//!The essential is, we must use the same port to talk to the STUN server and to peers.
//!
//!The implementation depends on socket option SO_REUSE_ADDR and SO_REUSE_PORT, so it is OS depends.
//!For udp, the OS should correctly dispatch traffic to connected and unconnected udp all bind to the same port.
//!For tcp, the OS should allow listening socket and connecting socket bind to the same port.
//!
//!## Feature flags
//!- `async`: tokio STUN client, return [`tokio::net::UdpSocket`]
//!- `upnp`: ask the gateway for a port mapping with UPnP IGD
//!- `env_logger`, `structopt`: needed by the `natlink` binary

mod endpoint;
mod error;

pub mod config;
pub mod connection;
pub mod mapper;
#[doc(hidden)]
pub mod proto;
pub mod punch;
pub mod registry;
pub mod session;
pub mod stun;
pub mod tcp;
pub mod udp;

pub use config::{Config, StunServer};
pub use connection::{Context, Event, PeerConnection, Transport};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use mapper::{MappingRequest, PortMapper};
pub use punch::{Handshake, Role, State};
pub use registry::{Delivery, Link, Registry};
pub use session::SessionController;
pub use stun::NatType;
