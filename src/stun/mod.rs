//! STUN public address discovery.
//!
//! Only the binding request/response subset is spoken: MAPPED-ADDRESS and
//! XOR-MAPPED-ADDRESS, IPv4 only.

pub mod codec;
pub use codec::{decode_binding_response, encode_binding_request, StunMessage};

mod nat;
pub use nat::NatType;

mod client;
pub use client::{StunClient, DEFAULT_TIMEOUT};
#[cfg(test)]
pub(crate) use client::tests::stun_server;

#[cfg(feature = "async")]
mod client_async;
#[cfg(feature = "async")]
pub use client_async::{discover_or_local, Client as AsyncStunClient};
