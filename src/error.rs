use crate::Endpoint;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed STUN message: {0}")]
    MalformedMessage(&'static str),

    #[error("unsupported address family {0:#04x}")]
    UnsupportedFamily(u8),

    #[error("no mapped address in STUN response")]
    NoAddressFound,

    #[error("STUN server did not answer within {0:?}")]
    StunTimeout(Duration),

    #[error("invalid endpoint {0:?}, expected ip:port")]
    InvalidEndpointFormat(String),

    #[error("connect to {0} failed: {1}")]
    ConnectFailed(Endpoint, #[source] io::Error),

    #[error("peer {0} is not connected")]
    NotConnected(Endpoint),

    #[error("port mapping failed: {0}")]
    Mapping(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
