use crate::Endpoint;
use std::fmt;

/// How the NAT maps the local socket, as far as two STUN answers tell.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NatType {
    /// the public endpoint is the local one
    Open,
    /// same mapping towards both servers, punching should work
    Cone,
    /// a new mapping per destination, punching will likely fail
    Symmetric,
    /// only one answer, or none
    Unknown,
}

impl NatType {
    /// `first` and `second` are the endpoints two different servers saw for `local`.
    pub fn classify(local: Endpoint, first: Endpoint, second: Option<Endpoint>) -> Self {
        match second {
            Some(second) if second != first => NatType::Symmetric,
            _ if first == local => NatType::Open,
            Some(_) => NatType::Cone,
            None => NatType::Unknown,
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatType::Open => "open",
            NatType::Cone => "cone",
            NatType::Symmetric => "symmetric",
            NatType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
