// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Transport abstraction.
//
// The engine never touches sockets. A host plugs in a `Transport` that does
// the datagram/stream I/O, retransmission and multicast, and hands inbound
// traffic back as `TransportEvent`s drained once per engine tick.

use std::collections::VecDeque;

use thiserror::Error;

use crate::message::{Endpoint, MessageInfo, RequestInfo, ResponseInfo};

/// Failure reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("send failed")]
    SendFailed,
    #[error("retransmission timed out")]
    RetransmitTimeout,
    #[error("not connected")]
    NotConnected,
    #[error("transport allocation failed")]
    MemoryAllocFailed,
    #[error("{0}")]
    Other(String),
}

/// Delivery failure for a previously sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub error: TransportError,
    pub info: MessageInfo,
}

/// Inbound traffic, drained by `Engine::process`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Request(Endpoint, RequestInfo),
    Response(Endpoint, ResponseInfo),
    Error(Endpoint, ErrorInfo),
    /// A stream connection to the peer was closed.
    ConnectionLost(Endpoint),
}

/// Transport layer as seen by the engine.
pub trait Transport {
    /// Send a request to `endpoint`. An empty `endpoint.addr` is multicast.
    fn send_request(
        &mut self,
        endpoint: &Endpoint,
        request: &RequestInfo,
    ) -> Result<(), TransportError>;

    /// Send a response or notification to `endpoint`.
    fn send_response(
        &mut self,
        endpoint: &Endpoint,
        response: &ResponseInfo,
    ) -> Result<(), TransportError>;

    /// Next pending inbound event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// Routing-layer periodic work, run at the end of every engine tick.
    fn periodic(&mut self) {}
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// One message handed to a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Request(Endpoint, RequestInfo),
    Response(Endpoint, ResponseInfo),
}

impl Outbound {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Self::Request(ep, _) | Self::Response(ep, _) => ep,
        }
    }

    pub fn info(&self) -> &MessageInfo {
        match self {
            Self::Request(_, r) => &r.info,
            Self::Response(_, r) => &r.info,
        }
    }

    pub fn as_request(&self) -> Option<&RequestInfo> {
        match self {
            Self::Request(_, r) => Some(r),
            Self::Response(..) => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponseInfo> {
        match self {
            Self::Response(_, r) => Some(r),
            Self::Request(..) => None,
        }
    }
}

/// Queue-backed transport. Inbound events are pushed by the host (or a
/// test), outbound messages are recorded and assigned message ids.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    inbound: VecDeque<TransportEvent>,
    sent: Vec<Outbound>,
    next_message_id: u16,
    /// When set, every send fails with this error.
    pub fail_sends: Option<TransportError>,
    periodic_runs: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an inbound event for the next `poll_event`.
    pub fn push(&mut self, event: TransportEvent) {
        self.inbound.push_back(event);
    }

    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    pub fn sent(&self) -> &[Outbound] {
        &self.sent
    }

    /// Take every recorded outbound message.
    pub fn drain_sent(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.sent)
    }

    pub fn periodic_runs(&self) -> usize {
        self.periodic_runs
    }

    fn assign_id(&mut self, info: &mut MessageInfo) {
        if info.message_id == 0 {
            self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
            info.message_id = self.next_message_id;
        }
    }
}

impl Transport for MemoryTransport {
    fn send_request(
        &mut self,
        endpoint: &Endpoint,
        request: &RequestInfo,
    ) -> Result<(), TransportError> {
        if let Some(err) = &self.fail_sends {
            return Err(err.clone());
        }
        let mut request = request.clone();
        self.assign_id(&mut request.info);
        self.sent.push(Outbound::Request(endpoint.clone(), request));
        Ok(())
    }

    fn send_response(
        &mut self,
        endpoint: &Endpoint,
        response: &ResponseInfo,
    ) -> Result<(), TransportError> {
        if let Some(err) = &self.fail_sends {
            return Err(err.clone());
        }
        let mut response = response.clone();
        self.assign_id(&mut response.info);
        self.sent.push(Outbound::Response(endpoint.clone(), response));
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.inbound.pop_front()
    }

    fn periodic(&mut self) {
        self.periodic_runs += 1;
    }
}
