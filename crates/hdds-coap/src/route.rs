// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Route option wire format.
//
// Short form (no addressing), 1 byte:
//
//   +-----+-----------+
//   | T T | 0 0 0 0 0 0 |
//   +-----+-----------+
//
// Long form:
//
//   type | dLen | dest gw (4) [dest ep (2)] | sLen | src gw (4) [src ep (2)] | mcast seq (2)
//
// dLen/sLen are 0, 4 (gateway only) or 6 (gateway + endpoint).
// Multi-byte fields are little-endian. All parsing is bounds checked:
// malformed input returns Err, never panics.

use crate::error::{EngineError, Result};
use crate::message::HeaderOption;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Private option number carrying the route option. Outside the
/// registered CoAP range so peers never mistake it for a standard option.
pub const ROUTE_OPTION_ID: u16 = 65524;

/// Message-type discriminators (top two bits of byte 0).
pub const ROUTE_KIND_NORMAL: u8 = 0b1100_0000;
pub const ROUTE_KIND_ACK: u8 = 0b0100_0000;
pub const ROUTE_KIND_RESET: u8 = 0b1000_0000;

const KIND_MASK: u8 = 0b1100_0000;

const GATEWAY_ID_LEN: usize = 4;
const ENDPOINT_ID_LEN: usize = 2;
const ADDR_LEN_GATEWAY: u8 = GATEWAY_ID_LEN as u8;
const ADDR_LEN_GATEWAY_ENDPOINT: u8 = (GATEWAY_ID_LEN + ENDPOINT_ID_LEN) as u8;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Message-type discriminator carried in the route option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    Normal,
    Ack,
    Reset,
}

impl RouteKind {
    pub fn from_bits(byte: u8) -> Result<Self> {
        if byte & !KIND_MASK != 0 {
            return Err(EngineError::Malformed(format!(
                "route option type byte has low bits set: 0x{:02x}",
                byte
            )));
        }
        match byte {
            ROUTE_KIND_NORMAL => Ok(Self::Normal),
            ROUTE_KIND_ACK => Ok(Self::Ack),
            ROUTE_KIND_RESET => Ok(Self::Reset),
            other => Err(EngineError::Malformed(format!(
                "unknown route option type: 0x{:02x}",
                other
            ))),
        }
    }

    pub fn as_bits(self) -> u8 {
        match self {
            Self::Normal => ROUTE_KIND_NORMAL,
            Self::Ack => ROUTE_KIND_ACK,
            Self::Reset => ROUTE_KIND_RESET,
        }
    }
}

/// A gateway hop, optionally narrowed to one endpoint behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteAddress {
    pub gateway_id: u32,
    pub endpoint_id: Option<u16>,
}

impl RouteAddress {
    pub fn gateway(gateway_id: u32) -> Self {
        Self {
            gateway_id,
            endpoint_id: None,
        }
    }

    pub fn endpoint(gateway_id: u32, endpoint_id: u16) -> Self {
        Self {
            gateway_id,
            endpoint_id: Some(endpoint_id),
        }
    }

    fn wire_len(&self) -> u8 {
        if self.endpoint_id.is_some() {
            ADDR_LEN_GATEWAY_ENDPOINT
        } else {
            ADDR_LEN_GATEWAY
        }
    }
}

/// Addressing block of the long form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteAddressing {
    pub destination: Option<RouteAddress>,
    pub source: Option<RouteAddress>,
    pub mcast_seq: u16,
}

/// Decoded route option.
///
/// `addressing == None` is the 1-byte short form; anything else is the
/// long form, even when both addresses are absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOption {
    pub kind: RouteKind,
    pub addressing: Option<RouteAddressing>,
}

impl RouteOption {
    /// Short-form option with no addressing.
    pub fn bare(kind: RouteKind) -> Self {
        Self {
            kind,
            addressing: None,
        }
    }

    pub fn source(&self) -> Option<RouteAddress> {
        self.addressing.and_then(|a| a.source)
    }

    pub fn destination(&self) -> Option<RouteAddress> {
        self.addressing.and_then(|a| a.destination)
    }

    /// Encoded size in bytes.
    pub fn wire_len(&self) -> usize {
        match &self.addressing {
            None => 1,
            Some(a) => {
                let d = a.destination.map_or(0, |d| d.wire_len() as usize);
                let s = a.source.map_or(0, |s| s.wire_len() as usize);
                1 + 1 + d + 1 + s + 2
            }
        }
    }

    /// Serialize into `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind.as_bits());
        let Some(addressing) = &self.addressing else {
            return;
        };
        write_address(buf, addressing.destination.as_ref());
        write_address(buf, addressing.source.as_ref());
        buf.extend_from_slice(&addressing.mcast_seq.to_le_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        self.write_to(&mut buf);
        buf
    }

    /// Parse a complete option value. Trailing bytes are rejected.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);
        let kind = RouteKind::from_bits(cur.u8()?)?;
        if cur.is_empty() {
            return Ok(Self::bare(kind));
        }
        let destination = read_address(&mut cur)?;
        let source = read_address(&mut cur)?;
        let mcast_seq = cur.u16_le()?;
        if !cur.is_empty() {
            return Err(EngineError::Malformed(format!(
                "{} trailing bytes after route option",
                cur.remaining()
            )));
        }
        Ok(Self {
            kind,
            addressing: Some(RouteAddressing {
                destination,
                source,
                mcast_seq,
            }),
        })
    }
}

/// Encode a route option value.
pub fn encode(option: &RouteOption) -> Vec<u8> {
    option.to_bytes()
}

/// Decode a route option value.
pub fn decode(buf: &[u8]) -> Result<RouteOption> {
    RouteOption::parse(buf)
}

fn write_address(buf: &mut Vec<u8>, addr: Option<&RouteAddress>) {
    match addr {
        None => buf.push(0),
        Some(a) => {
            buf.push(a.wire_len());
            buf.extend_from_slice(&a.gateway_id.to_le_bytes());
            if let Some(ep) = a.endpoint_id {
                buf.extend_from_slice(&ep.to_le_bytes());
            }
        }
    }
}

fn read_address(cur: &mut Cursor<'_>) -> Result<Option<RouteAddress>> {
    match cur.u8()? {
        0 => Ok(None),
        ADDR_LEN_GATEWAY => Ok(Some(RouteAddress::gateway(cur.u32_le()?))),
        ADDR_LEN_GATEWAY_ENDPOINT => {
            let gw = cur.u32_le()?;
            let ep = cur.u16_le()?;
            Ok(Some(RouteAddress::endpoint(gw, ep)))
        }
        other => Err(EngineError::Malformed(format!(
            "invalid route address length: {}",
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// Option list helpers
// ---------------------------------------------------------------------------

/// Find and decode the route option in an option list.
pub fn find_in(options: &[HeaderOption]) -> Option<Result<RouteOption>> {
    options
        .iter()
        .find(|o| o.id == ROUTE_OPTION_ID)
        .map(|o| decode(&o.value))
}

/// Remove every route option from an option list.
pub fn strip_from(options: &mut Vec<HeaderOption>) {
    options.retain(|o| o.id != ROUTE_OPTION_ID);
}

/// Replace any existing route option with `option`.
pub fn insert_into(options: &mut Vec<HeaderOption>, option: &RouteOption) {
    strip_from(options);
    options.push(HeaderOption::new(ROUTE_OPTION_ID, encode(option)));
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(EngineError::Malformed(format!(
                "route option truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
