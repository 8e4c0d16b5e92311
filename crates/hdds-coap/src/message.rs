// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Message model exchanged with the transport layer.
//
// The transport owns framing, retransmission and multicast; the engine only
// sees these already-parsed values.

use std::fmt;

use crate::error::{EngineError, Result};
use crate::observe::MAX_SEQUENCE_NUMBER;
use crate::route::RouteAddress;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// CoAP Observe option number.
pub const OBSERVE_OPTION_ID: u16 = 6;

/// Observe option value requesting registration.
pub const OBSERVE_REGISTER: u32 = 0;
/// Observe option value requesting deregistration.
pub const OBSERVE_DEREGISTER: u32 = 1;

/// Maximum token length in bytes.
pub const MAX_TOKEN_LEN: usize = 8;

/// Well-known presence URI.
pub const PRESENCE_URI: &str = "/oic/ad";
/// Well-known discovery URI.
pub const DISCOVERY_URI: &str = "/oic/res";
/// Gateway URI used to carry disguised empty messages under routing.
pub const GATEWAY_URI: &str = "/oic/gateway";

/// Batch interface name, selects aggregated collection responses.
pub const BATCH_INTERFACE: &str = "oic.if.b";
/// Baseline interface name.
pub const BASELINE_INTERFACE: &str = "oic.if.baseline";
/// Links-list interface name.
pub const LINKS_LIST_INTERFACE: &str = "oic.if.ll";

/// Default CoAP port.
pub const COAP_PORT: u16 = 5683;

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Opaque identifier correlating a request with its responses.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Token(Vec<u8>);

impl Token {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() > MAX_TOKEN_LEN {
            return Err(EngineError::InvalidParameter(format!(
                "token length {} exceeds {}",
                bytes.len(),
                MAX_TOKEN_LEN
            )));
        }
        Ok(Self(bytes))
    }

    /// Random token of `len` bytes (clamped to 1..=8).
    pub fn random(rng: &mut fastrand::Rng, len: usize) -> Self {
        let len = len.clamp(1, MAX_TOKEN_LEN);
        Self((0..len).map(|_| rng.u8(..)).collect())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self)
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Transport family an endpoint is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Adapter {
    #[default]
    Ip,
    Tcp,
    Ble,
    Nfc,
}

/// Transport flags attached to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransportFlags {
    pub secure: bool,
    pub ipv4: bool,
    pub ipv6: bool,
}

/// Peer address as understood by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub adapter: Adapter,
    pub flags: TransportFlags,
    /// Textual address. Empty means the multicast/default group.
    pub addr: String,
    pub port: u16,
    /// Multi-hop address behind a gateway, if routed.
    pub route: Option<RouteAddress>,
}

impl Endpoint {
    pub fn new(adapter: Adapter, addr: impl Into<String>, port: u16) -> Self {
        let addr = addr.into();
        let flags = TransportFlags {
            secure: false,
            ipv4: !addr.is_empty() && !addr.contains(':'),
            ipv6: addr.contains(':'),
        };
        Self {
            adapter,
            flags,
            addr,
            port,
            route: None,
        }
    }

    pub fn ip(addr: impl Into<String>, port: u16) -> Self {
        Self::new(Adapter::Ip, addr, port)
    }

    /// The multicast/default destination on `adapter`.
    pub fn multicast(adapter: Adapter) -> Self {
        Self::new(adapter, "", 0)
    }

    pub fn is_multicast(&self) -> bool {
        self.addr.is_empty()
    }

    /// Same peer, ignoring routing data and flags.
    pub fn same_peer(&self, other: &Endpoint) -> bool {
        self.adapter == other.adapter && self.addr == other.addr && self.port == other.port
    }

    /// Canonical presence URI for this endpoint.
    ///
    /// `coap://addr:port/oic/ad` for unicast peers (IPv6 in brackets),
    /// bare `/oic/ad` for the multicast group.
    pub fn presence_uri(&self) -> String {
        if self.is_multicast() {
            return PRESENCE_URI.to_string();
        }
        if self.addr.contains(':') {
            format!("coap://[{}]:{}{}", self.addr, self.port, PRESENCE_URI)
        } else {
            format!("coap://{}:{}{}", self.addr, self.port, PRESENCE_URI)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_multicast() {
            return write!(f, "{:?}:multicast", self.adapter);
        }
        if self.addr.contains(':') {
            write!(f, "{:?}:[{}]:{}", self.adapter, self.addr, self.port)
        } else {
            write!(f, "{:?}:{}:{}", self.adapter, self.addr, self.port)
        }
    }
}

// ---------------------------------------------------------------------------
// Message header values
// ---------------------------------------------------------------------------

/// Transport-level message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageType {
    Confirmable,
    #[default]
    NonConfirmable,
    Acknowledgement,
    Reset,
}

/// Wire request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    /// Any method code the engine does not serve.
    Other(u8),
}

/// Wire response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    Empty = 0x00,
    Created = 0x41,
    Deleted = 0x42,
    Valid = 0x43,
    Changed = 0x44,
    Content = 0x45,
    BadRequest = 0x80,
    Unauthorized = 0x81,
    BadOption = 0x82,
    Forbidden = 0x83,
    NotFound = 0x84,
    MethodNotAllowed = 0x85,
    NotAcceptable = 0x86,
    RequestEntityIncomplete = 0x88,
    RequestEntityTooLarge = 0x8D,
    InternalServerError = 0xA0,
    RetransmitTimeout = 0xA4,
}

impl ResponseCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        let code = match v {
            0x00 => Self::Empty,
            0x41 => Self::Created,
            0x42 => Self::Deleted,
            0x43 => Self::Valid,
            0x44 => Self::Changed,
            0x45 => Self::Content,
            0x80 => Self::BadRequest,
            0x81 => Self::Unauthorized,
            0x82 => Self::BadOption,
            0x83 => Self::Forbidden,
            0x84 => Self::NotFound,
            0x85 => Self::MethodNotAllowed,
            0x86 => Self::NotAcceptable,
            0x88 => Self::RequestEntityIncomplete,
            0x8D => Self::RequestEntityTooLarge,
            0xA0 => Self::InternalServerError,
            0xA4 => Self::RetransmitTimeout,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// `class.detail` rendering, e.g. `2.05`.
    pub fn dotted(self) -> String {
        let v = self.as_u8();
        format!("{}.{:02}", v >> 5, v & 0x1F)
    }
}

/// Payload content format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentFormat {
    #[default]
    Undefined,
    Cbor,
    Json,
    Unsupported(u16),
}

/// One header option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOption {
    pub id: u16,
    pub value: Vec<u8>,
}

impl HeaderOption {
    pub fn new(id: u16, value: Vec<u8>) -> Self {
        Self { id, value }
    }

    /// Observe option carrying the low 24 bits of `value`, big-endian,
    /// without leading zero bytes.
    pub fn observe(value: u32) -> Self {
        let bytes = (value & MAX_SEQUENCE_NUMBER).to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        Self::new(OBSERVE_OPTION_ID, bytes[skip..].to_vec())
    }
}

/// First observe option value in `options`. Values longer than 4 bytes are
/// treated as absent.
pub fn observe_value(options: &[HeaderOption]) -> Option<u32> {
    let opt = options.iter().find(|o| o.id == OBSERVE_OPTION_ID)?;
    if opt.value.len() > 4 {
        return None;
    }
    Some(opt.value.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// Fields common to requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageInfo {
    pub message_type: MessageType,
    pub message_id: u16,
    pub token: Token,
    pub options: Vec<HeaderOption>,
    pub payload: Option<Vec<u8>>,
    pub content_format: ContentFormat,
    pub accept_format: ContentFormat,
    /// Path plus optional `?query`.
    pub resource_uri: Option<String>,
}

/// Inbound or outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: Method,
    pub info: MessageInfo,
    pub is_multicast: bool,
    /// Peer signalled that more block fragments follow.
    pub more_fragments: bool,
}

/// Inbound or outbound response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub code: ResponseCode,
    pub info: MessageInfo,
    pub is_multicast: bool,
    pub more_fragments: bool,
}

impl ResponseInfo {
    /// Payload-free empty message (ACK or RESET).
    pub fn empty(message_type: MessageType, message_id: u16, token: Token) -> Self {
        Self::direct(ResponseCode::Empty, message_type, message_id, token)
    }

    /// Payload-free response generated by the engine itself.
    pub fn direct(
        code: ResponseCode,
        message_type: MessageType,
        message_id: u16,
        token: Token,
    ) -> Self {
        Self {
            code,
            info: MessageInfo {
                message_type,
                message_id,
                token,
                ..Default::default()
            },
            is_multicast: false,
            more_fragments: false,
        }
    }
}

// ---------------------------------------------------------------------------
// URI helpers
// ---------------------------------------------------------------------------

/// Split `path?query` into its parts. An empty query is `None`.
pub fn split_query(uri: &str) -> (&str, Option<&str>) {
    match uri.split_once('?') {
        Some((path, query)) if !query.is_empty() => (path, Some(query)),
        Some((path, _)) => (path, None),
        None => (uri, None),
    }
}

/// Value of `key=` in a `&`/`;` separated query.
pub fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split(['&', ';'])
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Parse an absolute `coap://host:port/path?query` URI, or accept a bare
/// path. Returns the endpoint (if absolute) and the `path?query` remainder.
pub fn parse_request_uri(uri: &str) -> Result<(Option<Endpoint>, String)> {
    if uri.is_empty() {
        return Err(EngineError::InvalidParameter("empty request URI".into()));
    }
    if uri.starts_with('/') {
        return Ok((None, uri.to_string()));
    }
    let (secure, rest) = if let Some(rest) = uri.strip_prefix("coaps://") {
        (true, rest)
    } else if let Some(rest) = uri.strip_prefix("coap://") {
        (false, rest)
    } else if let Some(rest) = uri.strip_prefix("coap+tcp://") {
        (false, rest)
    } else {
        return Err(EngineError::Unsupported(format!("URI scheme in {}", uri)));
    };
    let tcp = uri.starts_with("coap+tcp://");

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };

    let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
        let (host, after) = v6.split_once(']').ok_or_else(|| {
            EngineError::InvalidParameter(format!("unterminated IPv6 literal in {}", uri))
        })?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None => COAP_PORT,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, p)) => (host, parse_port(p)?),
            None => (authority, COAP_PORT),
        }
    };
    if host.is_empty() {
        return Err(EngineError::InvalidParameter(format!("missing host in {}", uri)));
    }

    let adapter = if tcp { Adapter::Tcp } else { Adapter::Ip };
    let mut endpoint = Endpoint::new(adapter, host, port);
    endpoint.flags.secure = secure;
    Ok((Some(endpoint), path.to_string()))
}

fn parse_port(p: &str) -> Result<u16> {
    p.parse::<u16>()
        .map_err(|_| EngineError::InvalidParameter(format!("invalid port: {}", p)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_option_encoding() {
        assert!(HeaderOption::observe(0).value.is_empty());
        assert_eq!(HeaderOption::observe(1).value, vec![1]);
        assert_eq!(HeaderOption::observe(0x0102).value, vec![1, 2]);
        assert_eq!(HeaderOption::observe(0x00FF_FFFF).value, vec![0xFF, 0xFF, 0xFF]);
        // Only the low 24 bits travel.
        assert_eq!(HeaderOption::observe(MAX_SEQUENCE_NUMBER + 6).value, vec![5]);
        assert_eq!(HeaderOption::observe(0x1234_5678).value, vec![0x34, 0x56, 0x78]);
        for v in [0u32, 1, 5, 0x1234, 0xFF_FFFF] {
            assert_eq!(observe_value(&[HeaderOption::observe(v)]), Some(v));
        }
        assert_eq!(observe_value(&[]), None);
    }

    #[test]
    fn test_split_query_and_params() {
        assert_eq!(split_query("/a/b?rt=x&if=oic.if.b"), ("/a/b", Some("rt=x&if=oic.if.b")));
        assert_eq!(split_query("/a?"), ("/a", None));
        assert_eq!(split_query("/a"), ("/a", None));
        assert_eq!(query_param("rt=x&if=oic.if.b", "if"), Some("oic.if.b"));
        assert_eq!(query_param("rt=x;if=y", "rt"), Some("x"));
        assert_eq!(query_param("rt=x", "if"), None);
    }

    #[test]
    fn test_parse_absolute_uris() {
        let (ep, path) = parse_request_uri("coap://192.168.1.4:5700/light?if=a").unwrap();
        let ep = ep.unwrap();
        assert_eq!(ep.addr, "192.168.1.4");
        assert_eq!(ep.port, 5700);
        assert!(ep.flags.ipv4);
        assert_eq!(path, "/light?if=a");

        let (ep, path) = parse_request_uri("coap://[fe80::1]:5683/oic/ad").unwrap();
        let ep = ep.unwrap();
        assert_eq!(ep.addr, "fe80::1");
        assert!(ep.flags.ipv6);
        assert_eq!(path, "/oic/ad");

        let (ep, path) = parse_request_uri("/oic/res").unwrap();
        assert!(ep.is_none());
        assert_eq!(path, "/oic/res");

        assert!(parse_request_uri("").is_err());
        assert!(parse_request_uri("http://x/").is_err());
        assert!(parse_request_uri("coap://h:99999/").is_err());
    }

    #[test]
    fn test_presence_uri_forms() {
        assert_eq!(Endpoint::ip("10.0.0.1", 5683).presence_uri(), "coap://10.0.0.1:5683/oic/ad");
        assert_eq!(Endpoint::ip("fe80::1", 1).presence_uri(), "coap://[fe80::1]:1/oic/ad");
        assert_eq!(Endpoint::multicast(Adapter::Ip).presence_uri(), "/oic/ad");
    }

    #[test]
    fn test_response_code_bytes() {
        assert_eq!(ResponseCode::Content.dotted(), "2.05");
        assert_eq!(ResponseCode::NotFound.dotted(), "4.04");
        assert_eq!(ResponseCode::from_u8(0x44), Some(ResponseCode::Changed));
        assert_eq!(ResponseCode::from_u8(0x47), None);
    }
}
