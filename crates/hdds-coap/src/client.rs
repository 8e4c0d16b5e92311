// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Outbound transaction registry.
//
// One `ClientTransaction` per issued request, keyed by token. Callbacks are
// invoked from here; the registry decides from their return value whether
// the transaction lives on.

use std::collections::HashMap;
use std::fmt;

use crate::clock::{is_due, ticks_after};
use crate::error::{EngineError, Result};
use crate::message::{Endpoint, HeaderOption, Method, Token};
use crate::observe::{MAX_SEQUENCE_NUMBER, SEQUENCE_NUMBER_OFFSET};
use crate::payload::Payload;
use crate::result::StackResult;

/// Number of TTL stages tracked per presence subscription.
pub const PRESENCE_STAGES: usize = 5;

/// Stage deadlines as percentages of the announced TTL.
pub const PRESENCE_STAGE_PERCENT: [u64; PRESENCE_STAGES] = [50, 75, 85, 95, 100];

// ---------------------------------------------------------------------------
// Request description
// ---------------------------------------------------------------------------

/// Application-level request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientMethod {
    Get,
    Put,
    Post,
    Delete,
    /// GET with observe registration; stale notifications are filtered.
    Observe,
    /// GET with observe registration; every notification is delivered.
    ObserveAll,
    /// Multicast-capable resource discovery.
    Discover,
    /// Passive presence subscription.
    Presence,
}

impl ClientMethod {
    /// Method put on the wire.
    pub fn wire(self) -> Method {
        match self {
            Self::Put => Method::Put,
            Self::Post => Method::Post,
            Self::Delete => Method::Delete,
            Self::Get | Self::Observe | Self::ObserveAll | Self::Discover | Self::Presence => {
                Method::Get
            }
        }
    }

    pub fn is_observe(self) -> bool {
        matches!(self, Self::Observe | Self::ObserveAll)
    }

    /// Methods whose transactions never expire on their own.
    pub fn is_long_lived(self) -> bool {
        matches!(self, Self::Observe | Self::ObserveAll | Self::Presence)
    }
}

/// Delivery guarantee requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Qos {
    /// Non-confirmable.
    #[default]
    Low,
    /// Confirmable.
    High,
}

/// What the callback wants done with its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    KeepTransaction,
    DeleteTransaction,
}

/// Handle returned to the application for a live transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionHandle(u32);

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// What is delivered to a client callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientResponse {
    pub handle: TransactionHandle,
    pub result: StackResult,
    pub endpoint: Endpoint,
    pub resource_uri: Option<String>,
    pub sequence_number: u32,
    pub payload: Option<Payload>,
    pub options: Vec<HeaderOption>,
}

/// Client callback. Captures its own context.
pub type ClientCallback = Box<dyn FnMut(&ClientResponse) -> CallbackAction + Send>;

/// Application request handed to `Engine::do_request`.
///
/// `uri` is either a path (`/light?if=oic.if.baseline`) sent to
/// `destination`, or a full `coap://host:port/path` URI that carries its
/// own destination.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: ClientMethod,
    pub uri: String,
    pub destination: Option<Endpoint>,
    pub qos: Qos,
    pub options: Vec<HeaderOption>,
    pub payload: Option<Payload>,
}

impl RequestDescriptor {
    pub fn new(method: ClientMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            destination: None,
            qos: Qos::Low,
            options: Vec::new(),
            payload: None,
        }
    }

    pub fn destination(mut self, endpoint: Endpoint) -> Self {
        self.destination = Some(endpoint);
        self
    }

    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn option(mut self, option: HeaderOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// True if an observe notification must be dropped as out of order.
///
/// Only `Observe` filters; `ObserveAll` sees everything. Sequence numbers
/// at or below the reserved offset always pass.
pub fn is_stale_notification(method: ClientMethod, received: u32, stored: u32) -> bool {
    method == ClientMethod::Observe
        && received > SEQUENCE_NUMBER_OFFSET
        && stored <= MAX_SEQUENCE_NUMBER
        && received <= stored
}

/// Registry-side description of a transaction.
#[derive(Debug, Clone)]
pub struct TransactionDescriptor {
    pub method: ClientMethod,
    pub request_uri: String,
    pub resource_type_filter: Option<String>,
    pub destination: Endpoint,
    pub qos: Qos,
    /// Absolute expiry tick, `None` for long-lived transactions.
    pub deadline: Option<u32>,
}

// ---------------------------------------------------------------------------
// Presence staging
// ---------------------------------------------------------------------------

/// TTL staging of one presence subscription.
///
/// Unarmed until the first announcement. Once armed, `stage` walks 0..=5:
/// stages 0..5 each fire a liveness probe at their deadline, stage 5 means
/// every probe went unanswered, stage 6 means the timeout was reported.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceStaging {
    pub ttl_secs: u32,
    pub deadlines: [u32; PRESENCE_STAGES],
    pub stage: usize,
    pub armed: bool,
    /// Sequence number of the last accepted announcement.
    pub last_sequence: Option<u32>,
    /// Last sequence number per announcing host, for multicast
    /// subscriptions.
    pub peers: HashMap<String, u32>,
}

impl PresenceStaging {
    /// Recompute all stage deadlines from `now` and reset the stage index.
    pub fn arm(&mut self, now: u32, ttl_secs: u32) {
        let ttl_ms = u64::from(ttl_secs) * 1000;
        for (deadline, pct) in self.deadlines.iter_mut().zip(PRESENCE_STAGE_PERCENT) {
            *deadline = ticks_after(now, ttl_ms * pct / 100);
        }
        self.ttl_secs = ttl_secs;
        self.stage = 0;
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
        self.stage = 0;
    }

    /// All probes sent, timeout not yet reported.
    pub fn is_exhausted(&self) -> bool {
        self.stage == PRESENCE_STAGES
    }

    /// Timeout already reported.
    pub fn is_expired(&self) -> bool {
        self.stage > PRESENCE_STAGES
    }

    pub fn current_deadline(&self) -> Option<u32> {
        self.deadlines.get(self.stage).copied()
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// One outstanding client request.
pub struct ClientTransaction {
    pub handle: TransactionHandle,
    pub token: Token,
    pub method: ClientMethod,
    /// Path (and query) of the request; canonical presence URI for presence.
    pub request_uri: String,
    pub resource_type_filter: Option<String>,
    pub destination: Endpoint,
    pub qos: Qos,
    pub deadline: Option<u32>,
    /// Last observe sequence number delivered (0 before the first).
    pub sequence_number: u32,
    pub presence: Option<PresenceStaging>,
    callback: ClientCallback,
}

impl ClientTransaction {
    /// Run the user callback.
    pub fn invoke(&mut self, response: &ClientResponse) -> CallbackAction {
        (self.callback)(response)
    }
}

impl fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransaction")
            .field("handle", &self.handle)
            .field("token", &self.token)
            .field("method", &self.method)
            .field("request_uri", &self.request_uri)
            .field("destination", &self.destination)
            .field("deadline", &self.deadline)
            .field("sequence_number", &self.sequence_number)
            .field("presence", &self.presence)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Live client transactions, indexed by token and by handle.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    by_token: HashMap<Token, ClientTransaction>,
    handles: HashMap<TransactionHandle, Token>,
    next_handle: u32,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction under `token`.
    pub fn register(
        &mut self,
        token: Token,
        descriptor: TransactionDescriptor,
        callback: ClientCallback,
    ) -> Result<TransactionHandle> {
        self.insert(token, descriptor, callback, None)
    }

    /// Register a presence subscription. Staging stays unarmed until the
    /// first announcement arrives.
    pub fn register_presence(
        &mut self,
        token: Token,
        descriptor: TransactionDescriptor,
        callback: ClientCallback,
    ) -> Result<TransactionHandle> {
        self.insert(token, descriptor, callback, Some(PresenceStaging::default()))
    }

    fn insert(
        &mut self,
        token: Token,
        descriptor: TransactionDescriptor,
        callback: ClientCallback,
        presence: Option<PresenceStaging>,
    ) -> Result<TransactionHandle> {
        if token.is_empty() {
            return Err(EngineError::InvalidParameter("empty token".into()));
        }
        if descriptor.request_uri.is_empty() {
            return Err(EngineError::InvalidParameter("empty request URI".into()));
        }
        if self.by_token.contains_key(&token) {
            return Err(EngineError::InvalidParameter(format!(
                "token {} already registered",
                token
            )));
        }
        self.next_handle = self.next_handle.checked_add(1).ok_or_else(|| {
            EngineError::ResourceExhausted("transaction handles".into())
        })?;
        let handle = TransactionHandle(self.next_handle);

        log::debug!(
            "register {} token={} {:?} {} -> {}",
            handle,
            token,
            descriptor.method,
            descriptor.request_uri,
            descriptor.destination
        );
        self.handles.insert(handle, token.clone());
        self.by_token.insert(
            token.clone(),
            ClientTransaction {
                handle,
                token,
                method: descriptor.method,
                request_uri: descriptor.request_uri,
                resource_type_filter: descriptor.resource_type_filter,
                destination: descriptor.destination,
                qos: descriptor.qos,
                deadline: descriptor.deadline,
                sequence_number: 0,
                presence,
                callback,
            },
        );
        Ok(handle)
    }

    pub fn lookup_by_token(&self, token: &Token) -> Option<&ClientTransaction> {
        self.by_token.get(token)
    }

    pub fn lookup_by_handle(&self, handle: TransactionHandle) -> Option<&ClientTransaction> {
        self.handles.get(&handle).and_then(|t| self.by_token.get(t))
    }

    pub fn lookup_by_handle_mut(
        &mut self,
        handle: TransactionHandle,
    ) -> Option<&mut ClientTransaction> {
        let token = self.handles.get(&handle)?;
        self.by_token.get_mut(token)
    }

    /// Transaction whose request URI is exactly `uri`.
    pub fn lookup_by_uri(&self, uri: &str) -> Option<&ClientTransaction> {
        self.by_token.values().find(|t| t.request_uri == uri)
    }

    /// Deliver a non-terminal response.
    ///
    /// The callback decides: `DeleteTransaction` removes the entry,
    /// `KeepTransaction` stores the sequence number and pushes a finite
    /// deadline out to `now + lifetime_ms`.
    pub fn complete(
        &mut self,
        handle: TransactionHandle,
        response: &ClientResponse,
        now: u32,
        lifetime_ms: u64,
    ) -> Result<CallbackAction> {
        let tx = self
            .lookup_by_handle_mut(handle)
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
        let action = tx.invoke(response);
        tx.sequence_number = response.sequence_number;
        match action {
            CallbackAction::DeleteTransaction => {
                self.remove(handle);
            }
            CallbackAction::KeepTransaction => {
                if tx.deadline.is_some() {
                    tx.deadline = Some(ticks_after(now, lifetime_ms));
                }
            }
        }
        Ok(action)
    }

    /// Deliver a terminal response: the callback runs once and the
    /// transaction is removed whatever it returns.
    pub fn finish(&mut self, handle: TransactionHandle, response: &ClientResponse) -> Result<()> {
        let mut tx = self
            .remove(handle)
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
        tx.invoke(response);
        Ok(())
    }

    /// Remove without invoking the callback.
    pub fn cancel(&mut self, handle: TransactionHandle) -> Result<ClientTransaction> {
        self.remove(handle)
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))
    }

    pub fn remove(&mut self, handle: TransactionHandle) -> Option<ClientTransaction> {
        let token = self.handles.remove(&handle)?;
        let tx = self.by_token.remove(&token);
        if tx.is_some() {
            log::debug!("remove {} token={}", handle, token);
        }
        tx
    }

    /// Transactions whose finite deadline is at or before `now`.
    pub fn expired(&self, now: u32) -> Vec<TransactionHandle> {
        let mut out: Vec<_> = self
            .by_token
            .values()
            .filter(|t| t.deadline.is_some_and(|d| is_due(now, d)))
            .map(|t| t.handle)
            .collect();
        out.sort();
        out
    }

    /// Handles of every presence subscription, oldest first.
    pub fn presence_handles(&self) -> Vec<TransactionHandle> {
        let mut out: Vec<_> = self
            .by_token
            .values()
            .filter(|t| t.presence.is_some())
            .map(|t| t.handle)
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientTransaction> {
        self.by_token.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MAX_SPAN_MS;
    use std::sync::{Arc, Mutex};

    fn token(b: u8) -> Token {
        Token::new(vec![b; 8]).unwrap()
    }

    fn descriptor(method: ClientMethod, deadline: Option<u32>) -> TransactionDescriptor {
        TransactionDescriptor {
            method,
            request_uri: "/res".into(),
            resource_type_filter: None,
            destination: Endpoint::ip("10.0.0.2", 5683),
            qos: Qos::Low,
            deadline,
        }
    }

    fn response(handle: TransactionHandle, seq: u32) -> ClientResponse {
        ClientResponse {
            handle,
            result: StackResult::Ok,
            endpoint: Endpoint::ip("10.0.0.2", 5683),
            resource_uri: Some("/res".into()),
            sequence_number: seq,
            payload: None,
            options: Vec::new(),
        }
    }

    fn counting(action: CallbackAction) -> (ClientCallback, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ClientCallback = Box::new(move |r| {
            sink.lock().unwrap().push(r.sequence_number);
            action
        });
        (cb, seen)
    }

    #[test]
    fn test_duplicate_token_rejected_until_removed() {
        let mut reg = TransactionRegistry::new();
        let (cb, _) = counting(CallbackAction::KeepTransaction);
        let h = reg.register(token(1), descriptor(ClientMethod::Get, None), cb).unwrap();
        let (cb, _) = counting(CallbackAction::KeepTransaction);
        assert!(reg.register(token(1), descriptor(ClientMethod::Get, None), cb).is_err());
        reg.cancel(h).unwrap();
        let (cb, _) = counting(CallbackAction::KeepTransaction);
        assert!(reg.register(token(1), descriptor(ClientMethod::Get, None), cb).is_ok());
    }

    #[test]
    fn test_empty_token_rejected() {
        let mut reg = TransactionRegistry::new();
        let (cb, _) = counting(CallbackAction::KeepTransaction);
        let err = reg.register(Token::default(), descriptor(ClientMethod::Get, None), cb);
        assert!(matches!(err, Err(EngineError::InvalidParameter(_))));
    }

    #[test]
    fn test_complete_delete_removes() {
        let mut reg = TransactionRegistry::new();
        let (cb, seen) = counting(CallbackAction::DeleteTransaction);
        let h = reg.register(token(2), descriptor(ClientMethod::Get, Some(100)), cb).unwrap();
        let action = reg.complete(h, &response(h, 7), 0, 1000).unwrap();
        assert_eq!(action, CallbackAction::DeleteTransaction);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert!(reg.lookup_by_token(&token(2)).is_none());
        assert!(reg.lookup_by_handle(h).is_none());
        assert!(reg.complete(h, &response(h, 8), 0, 1000).is_err());
    }

    #[test]
    fn test_complete_keep_refreshes_deadline() {
        let mut reg = TransactionRegistry::new();
        let (cb, _) = counting(CallbackAction::KeepTransaction);
        let h = reg.register(token(3), descriptor(ClientMethod::Discover, Some(100)), cb).unwrap();
        reg.complete(h, &response(h, 11), 50, 1000).unwrap();
        let tx = reg.lookup_by_handle(h).unwrap();
        assert_eq!(tx.deadline, Some(1050));
        assert_eq!(tx.sequence_number, 11);
        assert!(reg.expired(1049).is_empty());
        assert_eq!(reg.expired(1050), vec![h]);
    }

    #[test]
    fn test_finish_is_terminal() {
        let mut reg = TransactionRegistry::new();
        let (cb, seen) = counting(CallbackAction::KeepTransaction);
        let h = reg.register(token(4), descriptor(ClientMethod::Observe, None), cb).unwrap();
        reg.finish(h, &response(h, 1)).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_presence_staging_percentages() {
        let mut staging = PresenceStaging::default();
        staging.arm(1000, 60);
        assert_eq!(staging.deadlines, [31_000, 46_000, 52_000, 58_000, 61_000]);
        assert_eq!(staging.current_deadline(), Some(31_000));
        staging.stage = PRESENCE_STAGES;
        assert!(staging.is_exhausted());
        assert_eq!(staging.current_deadline(), None);
    }

    #[test]
    fn test_presence_staging_clamps_overflow() {
        let mut staging = PresenceStaging::default();
        let now = u32::MAX - 10;
        staging.arm(now, u32::MAX);
        assert!(staging.deadlines.iter().all(|d| *d == now.wrapping_add(MAX_SPAN_MS)));
        assert!(staging.deadlines.iter().all(|d| !is_due(now, *d)));
    }

    #[test]
    fn test_expired_across_tick_wrap() {
        let mut reg = TransactionRegistry::new();
        let now = u32::MAX - 5;
        let (cb, _) = counting(CallbackAction::KeepTransaction);
        let h = reg
            .register(token(7), descriptor(ClientMethod::Get, Some(ticks_after(now, 60_000))), cb)
            .unwrap();
        assert!(reg.expired(now).is_empty());
        assert!(reg.expired(now.wrapping_add(59_999)).is_empty());
        assert_eq!(reg.expired(now.wrapping_add(60_000)), vec![h]);
    }

    #[test]
    fn test_stale_notification_rule() {
        assert!(!is_stale_notification(ClientMethod::Observe, 10, 0));
        assert!(is_stale_notification(ClientMethod::Observe, 10, 10));
        assert!(is_stale_notification(ClientMethod::Observe, 9, 10));
        assert!(!is_stale_notification(ClientMethod::Observe, 11, 10));
        assert!(!is_stale_notification(ClientMethod::ObserveAll, 9, 10));
        // Reserved low values always pass.
        assert!(!is_stale_notification(ClientMethod::Observe, 3, 10));
        // Nothing stored yet.
        assert!(!is_stale_notification(
            ClientMethod::Observe,
            10,
            MAX_SEQUENCE_NUMBER + 1
        ));
    }

    #[test]
    fn test_lookup_by_uri_and_presence_handles() {
        let mut reg = TransactionRegistry::new();
        let (cb, _) = counting(CallbackAction::KeepTransaction);
        let mut d = descriptor(ClientMethod::Presence, None);
        d.request_uri = "coap://10.0.0.2:5683/oic/ad".into();
        let h = reg.register_presence(token(5), d, cb).unwrap();
        let (cb, _) = counting(CallbackAction::KeepTransaction);
        reg.register(token(6), descriptor(ClientMethod::Get, None), cb).unwrap();
        assert_eq!(reg.lookup_by_uri("coap://10.0.0.2:5683/oic/ad").unwrap().handle, h);
        assert_eq!(reg.presence_handles(), vec![h]);
    }
}
