use crate::{Endpoint, Error, Result};
use rand::RngCore;
use std::net::{Ipv4Addr, SocketAddrV4};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LEN: usize = 20;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn random() -> Self {
        let mut id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl From<[u8; 12]> for TransactionId {
    fn from(id: [u8; 12]) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u16,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn mapped_address(addr: SocketAddrV4) -> Self {
        Self {
            kind: ATTR_MAPPED_ADDRESS,
            value: address_value(addr.port(), addr.ip().octets()),
        }
    }

    pub fn xor_mapped_address(addr: SocketAddrV4) -> Self {
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let mut ip = addr.ip().octets();
        for (b, c) in ip.iter_mut().zip(cookie) {
            *b ^= c;
        }

        Self {
            kind: ATTR_XOR_MAPPED_ADDRESS,
            value: address_value(addr.port() ^ (MAGIC_COOKIE >> 16) as u16, ip),
        }
    }
}

fn address_value(port: u16, ip: [u8; 4]) -> Vec<u8> {
    let mut v = vec![0, FAMILY_IPV4];
    v.extend_from_slice(&port.to_be_bytes());
    v.extend_from_slice(&ip);
    v
}

/// A STUN message: 20-byte header followed by TLV attributes.
///
/// Attribute values are not padded to 4 bytes, neither on encode nor on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub message_type: u16,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl StunMessage {
    pub fn binding_request() -> Self {
        Self {
            message_type: BINDING_REQUEST,
            transaction_id: TransactionId::random(),
            attributes: Vec::new(),
        }
    }

    /// a success response to `request` carrying `attributes`
    pub fn binding_response(request: &StunMessage, attributes: Vec<Attribute>) -> Self {
        Self {
            message_type: BINDING_RESPONSE,
            transaction_id: request.transaction_id,
            attributes,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len: usize = self.attributes.iter().map(|a| 4 + a.value.len()).sum();

        let mut buf = Vec::with_capacity(HEADER_LEN + body_len);
        buf.extend_from_slice(&self.message_type.to_be_bytes());
        buf.extend_from_slice(&(body_len as u16).to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            buf.extend_from_slice(&attr.kind.to_be_bytes());
            buf.extend_from_slice(&(attr.value.len() as u16).to_be_bytes());
            buf.extend_from_slice(&attr.value);
        }

        buf
    }

    /// message type and transaction id, after checking length and cookie
    pub fn decode_header(buf: &[u8]) -> Result<(u16, TransactionId)> {
        if buf.len() < HEADER_LEN {
            return Err(Error::MalformedMessage("shorter than STUN header"));
        }

        if buf[4..8] != MAGIC_COOKIE.to_be_bytes() {
            return Err(Error::MalformedMessage("magic cookie mismatch"));
        }

        let message_type = u16::from_be_bytes([buf[0], buf[1]]);
        let mut id = [0u8; 12];
        id.copy_from_slice(&buf[8..HEADER_LEN]);

        Ok((message_type, id.into()))
    }

    /// Parse header and attributes. Attributes are walked to the end of `buf`,
    /// the header length field is not consulted.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (message_type, transaction_id) = Self::decode_header(buf)?;

        let attributes = Attributes::new(buf)
            .map(|a| {
                a.map(|(kind, value)| Attribute {
                    kind,
                    value: value.to_vec(),
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// The first MAPPED-ADDRESS or XOR-MAPPED-ADDRESS attribute, whichever comes first.
    pub fn mapped_address(&self) -> Result<Endpoint> {
        self.attributes
            .iter()
            .find_map(|a| address(a.kind, &a.value))
            .unwrap_or(Err(Error::NoAddressFound))
    }
}

/// `(kind, value)` of each attribute after the header, without padding
struct Attributes<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Attributes<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: HEADER_LEN,
        }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<(u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        let buf = self.buf;
        let rest = buf.get(self.offset..).filter(|r| !r.is_empty())?;
        if rest.len() < 4 {
            self.offset = buf.len();
            return Some(Err(Error::MalformedMessage("truncated attribute header")));
        }

        let kind = u16::from_be_bytes([rest[0], rest[1]]);
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        match rest.get(4..4 + len) {
            Some(value) => {
                self.offset += 4 + len;
                Some(Ok((kind, value)))
            }
            None => {
                self.offset = buf.len();
                Some(Err(Error::MalformedMessage("truncated attribute value")))
            }
        }
    }
}

/// `None` unless `kind` is one of the two address attributes
fn address(kind: u16, v: &[u8]) -> Option<Result<Endpoint>> {
    let xor = match kind {
        ATTR_MAPPED_ADDRESS => false,
        ATTR_XOR_MAPPED_ADDRESS => true,
        _ => return None,
    };

    if v.len() < 2 {
        return Some(Err(Error::MalformedMessage("short address attribute")));
    }
    if v[1] != FAMILY_IPV4 {
        return Some(Err(Error::UnsupportedFamily(v[1])));
    }
    if v.len() < 8 {
        return Some(Err(Error::MalformedMessage("short address attribute")));
    }

    let mut port = u16::from_be_bytes([v[2], v[3]]);
    let mut ip = [v[4], v[5], v[6], v[7]];

    if xor {
        let cookie = MAGIC_COOKIE.to_be_bytes();
        port ^= u16::from_be_bytes([cookie[0], cookie[1]]);
        for (b, c) in ip.iter_mut().zip(cookie) {
            *b ^= c;
        }
    }

    Some(Ok(Endpoint::new(Ipv4Addr::from(ip).into(), port)))
}

/// a fresh binding request, with its transaction id for matching the response
pub fn encode_binding_request() -> (TransactionId, Vec<u8>) {
    let req = StunMessage::binding_request();
    (req.transaction_id, req.encode())
}

/// Stop at the first address attribute, whatever follows it is not read.
pub fn decode_binding_response(buf: &[u8]) -> Result<Endpoint> {
    StunMessage::decode_header(buf)?;

    for attr in Attributes::new(buf) {
        let (kind, value) = attr?;
        if let Some(ep) = address(kind, value) {
            return ep;
        }
    }

    Err(Error::NoAddressFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(request: &[u8], attributes: Vec<Attribute>) -> Vec<u8> {
        let req = StunMessage::decode(request).unwrap();
        StunMessage::binding_response(&req, attributes).encode()
    }

    #[test]
    fn test_binding_request_layout() {
        let (id, buf) = encode_binding_request();
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[0..2], &[0x00, 0x01]);
        assert_eq!(&buf[2..4], &[0x00, 0x00]);
        assert_eq!(&buf[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&buf[8..20], id.as_bytes());

        let (other, _) = encode_binding_request();
        assert_ne!(id, other);
    }

    #[test]
    fn test_decode_mapped_address() {
        let (_, req) = encode_binding_request();
        let addr: SocketAddrV4 = "198.51.100.7:3478".parse().unwrap();
        let resp = response_with(&req, vec![Attribute::mapped_address(addr)]);

        let ep = decode_binding_response(&resp).unwrap();
        assert_eq!(ep.as_socket_addr(), addr.into());
    }

    #[test]
    fn test_decode_xor_mapped_address() {
        let (_, req) = encode_binding_request();
        let addr: SocketAddrV4 = "203.0.113.5:40000".parse().unwrap();
        let resp = response_with(&req, vec![Attribute::xor_mapped_address(addr)]);

        let msg = StunMessage::decode(&resp).unwrap();
        assert_eq!(msg.message_type, BINDING_RESPONSE);
        assert_eq!(msg.transaction_id.as_bytes()[..], req[8..20]);
        assert_eq!(msg.mapped_address().unwrap().as_socket_addr(), addr.into());
    }

    #[test]
    fn test_xor_is_applied_bytewise() {
        let raw = [0xC0u8, 0xA8, 0x01, 0x02];
        let raw_port = 0xBEEFu16;

        let mut buf = StunMessage::binding_request().encode();
        buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x01]);
        buf.extend_from_slice(&raw_port.to_be_bytes());
        buf.extend_from_slice(&raw);

        let ep = decode_binding_response(&buf).unwrap();
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let expect: Vec<u8> = raw.iter().zip(cookie).map(|(a, c)| a ^ c).collect();

        match ep.address() {
            std::net::IpAddr::V4(ip) => assert_eq!(ip.octets().to_vec(), expect),
            ip => panic!("unexpected {}", ip),
        }
        assert_eq!(
            ep.port(),
            raw_port ^ ((cookie[0] as u16) << 8 | cookie[1] as u16)
        );
    }

    #[test]
    fn test_first_address_attribute_wins() {
        let (_, req) = encode_binding_request();
        let first: SocketAddrV4 = "192.0.2.1:1000".parse().unwrap();
        let second: SocketAddrV4 = "192.0.2.2:2000".parse().unwrap();
        let software = Attribute {
            kind: 0x8022,
            value: b"test".to_vec(),
        };
        let resp = response_with(
            &req,
            vec![
                software,
                Attribute::xor_mapped_address(first),
                Attribute::mapped_address(second),
            ],
        );

        assert_eq!(
            decode_binding_response(&resp).unwrap().as_socket_addr(),
            first.into()
        );
    }

    #[test]
    fn test_reject_bad_cookie() {
        let (_, req) = encode_binding_request();
        let addr: SocketAddrV4 = "203.0.113.5:40000".parse().unwrap();
        let mut resp = response_with(&req, vec![Attribute::xor_mapped_address(addr)]);
        resp[7] ^= 0xFF;

        assert!(matches!(
            decode_binding_response(&resp),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_reject_short() {
        assert!(matches!(
            decode_binding_response(&[0u8; 19]),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_no_address() {
        let (_, req) = encode_binding_request();
        let resp = response_with(&req, vec![]);
        assert!(matches!(
            decode_binding_response(&resp),
            Err(Error::NoAddressFound)
        ));
    }

    #[test]
    fn test_ipv6_family_unsupported() {
        let mut buf = StunMessage::binding_request().encode();
        buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        buf.extend_from_slice(&20u16.to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x02]);
        buf.extend_from_slice(&[0u8; 18]);

        assert!(matches!(
            decode_binding_response(&buf),
            Err(Error::UnsupportedFamily(0x02))
        ));
    }

    #[test]
    fn test_trailing_garbage_after_address() {
        let (_, req) = encode_binding_request();
        let addr: SocketAddrV4 = "203.0.113.5:40000".parse().unwrap();
        let mut resp = response_with(&req, vec![Attribute::xor_mapped_address(addr)]);
        //SOFTWARE claiming 7 bytes, only 3 present
        resp.extend_from_slice(&[0x80, 0x22, 0x00, 0x07, b'a', b'b', b'c']);

        let ep = decode_binding_response(&resp).unwrap();
        assert_eq!(ep.as_socket_addr(), addr.into());

        //the full decode still rejects it
        assert!(matches!(
            StunMessage::decode(&resp),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_truncated_before_address() {
        let (_, req) = encode_binding_request();
        let mut resp = response_with(&req, vec![]);
        resp.extend_from_slice(&[0x80, 0x22, 0x00, 0x07, b'a']);

        assert!(matches!(
            decode_binding_response(&resp),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_truncated_attribute() {
        let mut buf = StunMessage::binding_request().encode();
        buf.extend_from_slice(&ATTR_MAPPED_ADDRESS.to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x01, 0x00]);

        assert!(matches!(
            decode_binding_response(&buf),
            Err(Error::MalformedMessage(_))
        ));
    }
}
