//! Wire protocol of the PKI directory service.
//!
//! The PKI maps identities to reachability information and one-time key
//! packages. The service itself is an external collaborator; only the
//! request/response encoding and the client side live in this workspace.
//!
//! Requests open with a `u32` type. Identities travel as NUL-terminated
//! strings, key material as `u32` length-prefixed byte strings.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes};

use crate::wire::{self, Result, WireDecode, WireEncode, WireError};

/// Well-known TCP port of the PKI service.
pub const PKI_PORT: u16 = 10501;

const REQUEST_PUBLISH: u32 = 1;
const REQUEST_QUERY: u32 = 2;
const REQUEST_ADDR: u32 = 3;

fn put_cstring(buf: &mut impl BufMut, s: &str) {
    debug_assert!(!s.as_bytes().contains(&0));
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_cstring(buf: &mut impl Buf) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = wire::get_u8(buf)?;
        if b == 0 {
            break;
        }
        if bytes.len() >= wire::MAX_FIELD_LEN {
            return Err(WireError::FieldTooLarge { len: bytes.len() });
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|e| WireError::InvalidLength {
        context: "PKI string",
        expected: e.utf8_error().valid_up_to(),
        actual: e.into_bytes().len(),
    })
}

/// A request to the PKI service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PkiRequest {
    /// Register reachability and key packages for an identity.
    Publish {
        /// Identity being registered.
        id: String,
        /// Listening port of the client (the IP is taken from the
        /// connection).
        port: u16,
        /// Key packages to enqueue, consumed FIFO by queries.
        keys: Vec<Bytes>,
    },
    /// Fetch address and one key package for an identity.
    Query {
        /// Identity to look up.
        id: String,
    },
    /// Fetch address only.
    Addr {
        /// Identity to look up.
        id: String,
    },
}

impl WireEncode for PkiRequest {
    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::Publish { id, port, keys } => {
                buf.put_u32(REQUEST_PUBLISH);
                put_cstring(buf, id);
                buf.put_u16(*port);
                wire::put_list(buf, keys);
            },
            Self::Query { id } => {
                buf.put_u32(REQUEST_QUERY);
                put_cstring(buf, id);
            },
            Self::Addr { id } => {
                buf.put_u32(REQUEST_ADDR);
                put_cstring(buf, id);
            },
        }
    }
}

impl WireDecode for PkiRequest {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        match wire::get_u32(buf)? {
            REQUEST_PUBLISH => {
                let id = get_cstring(buf)?;
                let port = wire::get_u16(buf)?;
                let keys = wire::get_list(buf)?;
                Ok(Self::Publish { id, port, keys })
            },
            REQUEST_QUERY => Ok(Self::Query { id: get_cstring(buf)? }),
            REQUEST_ADDR => Ok(Self::Addr { id: get_cstring(buf)? }),
            tag => Err(WireError::UnknownTag { context: "PkiRequest", tag: tag as u8 }),
        }
    }
}

/// Reply to [`PkiRequest::Publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResponse {
    /// Whether the registration was accepted.
    pub success: bool,
}

impl WireEncode for PublishResponse {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.success as u8);
    }
}

impl WireDecode for PublishResponse {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self { success: wire::get_u8(buf)? != 0 })
    }
}

/// Reachability information for a published identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// IPv4 address the identity published from.
    pub ip: Ipv4Addr,
    /// Listening port.
    pub port: u16,
}

impl WireEncode for PeerAddress {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ip.into());
        buf.put_u16(self.port);
    }
}

impl WireDecode for PeerAddress {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self { ip: Ipv4Addr::from(wire::get_u32(buf)?), port: wire::get_u16(buf)? })
    }
}

/// Reply to [`PkiRequest::Query`]: address plus one consumed key package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    /// Address and key package, or `None` if the identity is unknown or
    /// out of key packages.
    pub result: Option<(PeerAddress, Bytes)>,
}

impl WireEncode for QueryResponse {
    fn encode(&self, buf: &mut impl BufMut) {
        match &self.result {
            Some((addr, key)) => {
                buf.put_u8(1);
                addr.encode(buf);
                wire::put_bytes(buf, key);
            },
            None => buf.put_u8(0),
        }
    }
}

impl WireDecode for QueryResponse {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if wire::get_u8(buf)? == 0 {
            return Ok(Self { result: None });
        }
        let addr = PeerAddress::decode(buf)?;
        let key = wire::get_bytes(buf)?;
        Ok(Self { result: Some((addr, key)) })
    }
}

/// Reply to [`PkiRequest::Addr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrResponse {
    /// Address, or `None` if the identity is unknown.
    pub result: Option<PeerAddress>,
}

impl WireEncode for AddrResponse {
    fn encode(&self, buf: &mut impl BufMut) {
        match &self.result {
            Some(addr) => {
                buf.put_u8(1);
                addr.encode(buf);
            },
            None => buf.put_u8(0),
        }
    }
}

impl WireDecode for AddrResponse {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if wire::get_u8(buf)? == 0 {
            return Ok(Self { result: None });
        }
        Ok(Self { result: Some(PeerAddress::decode(buf)?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_round_trip() {
        let req = PkiRequest::Publish {
            id: "alice".to_string(),
            port: 4242,
            keys: vec![Bytes::from_static(b"kp-1"), Bytes::from_static(b"kp-2")],
        };
        let decoded = PkiRequest::decode_exact(&req.encode_to_bytes()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn query_round_trip() {
        let req = PkiRequest::Query { id: "bob".to_string() };
        assert_eq!(PkiRequest::decode_exact(&req.encode_to_bytes()).unwrap(), req);

        let resp = QueryResponse {
            result: Some((
                PeerAddress { ip: Ipv4Addr::new(127, 0, 0, 1), port: 9000 },
                Bytes::from_static(b"prekey"),
            )),
        };
        assert_eq!(QueryResponse::decode_exact(&resp.encode_to_bytes()).unwrap(), resp);
    }

    #[test]
    fn failed_lookup_is_one_byte() {
        let resp = AddrResponse { result: None };
        assert_eq!(resp.encode_to_bytes().as_ref(), &[0]);
        assert_eq!(AddrResponse::decode_exact(&[0]).unwrap(), resp);
    }

    #[test]
    fn string_terminator_required() {
        let mut wire_bytes = Vec::new();
        wire_bytes.put_u32(REQUEST_QUERY);
        wire_bytes.put_slice(b"unterminated");
        assert!(matches!(
            PkiRequest::decode_exact(&wire_bytes),
            Err(WireError::UnexpectedEof { .. })
        ));
    }
}
