// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Inbound request tracker.
//
// Requests are assembled per (token, peer) from block fragments, dispatched
// exactly once, and dropped right after their final response is sent.
// Collection requests carry a `ResponseAggregate` collecting member answers.

use std::collections::HashMap;
use std::fmt;

use crate::client::Qos;
use crate::error::{EngineError, Result};
use crate::message::{ContentFormat, Endpoint, HeaderOption, MessageType, Method, Token};
use crate::observe::{ObservationId, ObserveAction, Observer};
use crate::payload::RepPayload;
use crate::resource::ResourceHandle;

/// Identifier of a tracked inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Assembly state of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Assembling,
    Complete,
    Dispatched,
}

/// One received block of a request.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub endpoint: Endpoint,
    pub message_id: u16,
    pub message_type: MessageType,
    pub method: Method,
    pub resource_uri: String,
    pub query: Option<String>,
    pub payload: Vec<u8>,
    pub options: Vec<HeaderOption>,
    pub content_format: ContentFormat,
    pub accept_format: ContentFormat,
    pub observe: ObserveAction,
    /// More fragments follow.
    pub more: bool,
}

/// Member answers of a collection request.
#[derive(Debug, Clone, Default)]
pub struct ResponseAggregate {
    pending: usize,
    parts: Vec<RepPayload>,
    /// URIs of members that deferred their answer, in dispatch order.
    deferred: Vec<String>,
}

impl ResponseAggregate {
    pub fn new(pending: usize) -> Self {
        Self {
            pending,
            parts: Vec::with_capacity(pending),
            deferred: Vec::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Remember a member that will answer later.
    pub fn defer(&mut self, member_uri: String) {
        self.deferred.push(member_uri);
    }

    /// Claim the URI of a late member. A named member is taken as given;
    /// an anonymous answer claims the oldest deferred member.
    pub fn take_deferred(&mut self, member_uri: Option<&str>) -> Option<String> {
        match member_uri {
            Some(uri) => {
                self.deferred.retain(|d| d != uri);
                Some(uri.to_string())
            }
            None if self.deferred.is_empty() => None,
            None => Some(self.deferred.remove(0)),
        }
    }

    /// Record one member answer. Returns true once every member answered.
    pub fn contribute(&mut self, part: Option<RepPayload>) -> bool {
        if let Some(part) = part {
            self.parts.push(part);
        }
        self.pending = self.pending.saturating_sub(1);
        self.pending == 0
    }

    pub fn into_parts(self) -> Vec<RepPayload> {
        self.parts
    }
}

/// One inbound request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub id: RequestId,
    pub token: Token,
    pub endpoint: Endpoint,
    pub message_id: u16,
    pub message_type: MessageType,
    pub method: Method,
    pub resource_uri: String,
    pub query: Option<String>,
    pub payload: Vec<u8>,
    pub options: Vec<HeaderOption>,
    pub content_format: ContentFormat,
    pub accept_format: ContentFormat,
    pub qos: Qos,
    pub observe: ObserveAction,
    /// Set once an observer was registered or removed for this request.
    pub observation_id: Option<ObservationId>,
    /// Observe value to put on the response, if any.
    pub observe_sequence: Option<u32>,
    pub resource: Option<ResourceHandle>,
    pub state: RequestState,
    /// Handler deferred its answer; the response cannot piggy-back.
    pub slow: bool,
    /// Engine-initiated notification rather than a peer request.
    pub notification: bool,
    pub aggregate: Option<ResponseAggregate>,
}

/// Tracks inbound requests from first fragment to final response.
#[derive(Debug, Default)]
pub struct RequestTracker {
    requests: HashMap<RequestId, InboundRequest>,
    by_key: HashMap<(Token, Endpoint), RequestId>,
    next_id: u32,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> Result<RequestId> {
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| EngineError::ResourceExhausted("request ids".into()))?;
        Ok(RequestId(self.next_id))
    }

    /// Feed one fragment. Creates the request on first sight and marks it
    /// complete when the peer signals no more fragments.
    pub fn accept_fragment(
        &mut self,
        token: Token,
        fragment: Fragment,
    ) -> Result<(RequestId, RequestState)> {
        let key = (token, fragment.endpoint.clone());
        if let Some(id) = self.by_key.get(&key).copied() {
            let req = self
                .requests
                .get_mut(&id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            if req.state == RequestState::Assembling {
                req.payload.extend_from_slice(&fragment.payload);
                req.message_id = fragment.message_id;
                req.message_type = fragment.message_type;
                if !fragment.more {
                    req.state = RequestState::Complete;
                }
            }
            return Ok((id, req.state));
        }

        let id = self.alloc_id()?;
        let (token, endpoint) = key;
        let state = if fragment.more {
            RequestState::Assembling
        } else {
            RequestState::Complete
        };
        let qos = if fragment.message_type == MessageType::Confirmable {
            Qos::High
        } else {
            Qos::Low
        };
        log::debug!(
            "request {} token={} from {} {:?} {}",
            id,
            token,
            endpoint,
            fragment.method,
            fragment.resource_uri
        );
        self.by_key.insert((token.clone(), endpoint.clone()), id);
        self.requests.insert(
            id,
            InboundRequest {
                id,
                token,
                endpoint,
                message_id: fragment.message_id,
                message_type: fragment.message_type,
                method: fragment.method,
                resource_uri: fragment.resource_uri,
                query: fragment.query,
                payload: fragment.payload,
                options: fragment.options,
                content_format: fragment.content_format,
                accept_format: fragment.accept_format,
                qos,
                observe: fragment.observe,
                observation_id: None,
                observe_sequence: None,
                resource: None,
                state,
                slow: false,
                notification: false,
                aggregate: None,
            },
        );
        Ok((id, state))
    }

    /// Track an engine-initiated notification. It is born dispatched and is
    /// not indexed by token, so it never collides with a peer request.
    pub fn add_notification(
        &mut self,
        observer: &Observer,
        sequence: u32,
        qos: Qos,
    ) -> Result<RequestId> {
        let id = self.alloc_id()?;
        self.requests.insert(
            id,
            InboundRequest {
                id,
                token: observer.token.clone(),
                endpoint: observer.endpoint.clone(),
                message_id: 0,
                message_type: MessageType::NonConfirmable,
                method: Method::Get,
                resource_uri: observer.resource_uri.clone(),
                query: observer.query.clone(),
                payload: Vec::new(),
                options: Vec::new(),
                content_format: ContentFormat::Undefined,
                accept_format: observer.accept_format,
                qos,
                observe: ObserveAction::NoOption,
                observation_id: Some(observer.id),
                observe_sequence: Some(sequence),
                resource: Some(observer.resource),
                state: RequestState::Dispatched,
                slow: false,
                notification: true,
                aggregate: None,
            },
        );
        Ok(id)
    }

    /// Move a complete request to dispatched. Fails for any other state.
    pub fn dispatch(&mut self, id: RequestId) -> Result<&mut InboundRequest> {
        let req = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        match req.state {
            RequestState::Complete => {
                req.state = RequestState::Dispatched;
                Ok(req)
            }
            other => Err(EngineError::InvalidParameter(format!(
                "{} cannot be dispatched in state {:?}",
                id, other
            ))),
        }
    }

    /// Start aggregating `pending` member answers for `id`.
    pub fn begin_aggregate(&mut self, id: RequestId, pending: usize) -> Result<()> {
        let req = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        req.aggregate = Some(ResponseAggregate::new(pending));
        Ok(())
    }

    /// Record one member answer. Returns the merged parts once the last
    /// member answered; the aggregate is consumed at that point.
    pub fn contribute(
        &mut self,
        id: RequestId,
        part: Option<RepPayload>,
    ) -> Result<Option<Vec<RepPayload>>> {
        let req = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let aggregate = req
            .aggregate
            .as_mut()
            .ok_or_else(|| EngineError::InvalidParameter(format!("{} is not aggregating", id)))?;
        if !aggregate.contribute(part) {
            return Ok(None);
        }
        Ok(req.aggregate.take().map(ResponseAggregate::into_parts))
    }

    pub fn get(&self, id: RequestId) -> Option<&InboundRequest> {
        self.requests.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut InboundRequest> {
        self.requests.get_mut(&id)
    }

    pub fn remove(&mut self, id: RequestId) -> Option<InboundRequest> {
        let req = self.requests.remove(&id)?;
        if !req.notification {
            self.by_key.remove(&(req.token.clone(), req.endpoint.clone()));
        }
        Some(req)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(payload: &[u8], more: bool) -> Fragment {
        Fragment {
            endpoint: Endpoint::ip("10.0.0.9", 5683),
            message_id: 1,
            message_type: MessageType::Confirmable,
            method: Method::Put,
            resource_uri: "/big".into(),
            query: None,
            payload: payload.to_vec(),
            options: Vec::new(),
            content_format: ContentFormat::Json,
            accept_format: ContentFormat::Json,
            observe: ObserveAction::NoOption,
            more,
        }
    }

    fn token() -> Token {
        Token::new(vec![1, 2, 3]).unwrap()
    }

    #[test]
    fn test_fragments_assemble_then_complete() {
        let mut tracker = RequestTracker::new();
        let (id, state) = tracker.accept_fragment(token(), fragment(b"ab", true)).unwrap();
        assert_eq!(state, RequestState::Assembling);
        assert!(tracker.dispatch(id).is_err());
        let (id2, state) = tracker.accept_fragment(token(), fragment(b"cd", false)).unwrap();
        assert_eq!(id, id2);
        assert_eq!(state, RequestState::Complete);
        let req = tracker.dispatch(id).unwrap();
        assert_eq!(req.payload, b"abcd");
        assert_eq!(req.qos, Qos::High);
    }

    #[test]
    fn test_dispatch_only_once() {
        let mut tracker = RequestTracker::new();
        let (id, _) = tracker.accept_fragment(token(), fragment(b"x", false)).unwrap();
        tracker.dispatch(id).unwrap();
        assert!(tracker.dispatch(id).is_err());
        // A retransmitted fragment does not reopen the request.
        let (_, state) = tracker.accept_fragment(token(), fragment(b"x", false)).unwrap();
        assert_eq!(state, RequestState::Dispatched);
        tracker.remove(id).unwrap();
        assert!(tracker.is_empty());
        assert!(tracker.get(id).is_none());
        // The token is free again.
        let (next, state) = tracker.accept_fragment(token(), fragment(b"x", false)).unwrap();
        assert_ne!(next, id);
        assert_eq!(state, RequestState::Complete);
    }

    #[test]
    fn test_aggregate_releases_on_last_member() {
        let mut tracker = RequestTracker::new();
        let (id, _) = tracker.accept_fragment(token(), fragment(b"", false)).unwrap();
        tracker.begin_aggregate(id, 3).unwrap();
        assert!(tracker.contribute(id, Some(RepPayload::with_uri("/a"))).unwrap().is_none());
        assert!(tracker.contribute(id, None).unwrap().is_none());
        let parts = tracker
            .contribute(id, Some(RepPayload::with_uri("/c")))
            .unwrap()
            .unwrap();
        let uris: Vec<_> = parts.iter().map(|p| p.uri.clone().unwrap()).collect();
        assert_eq!(uris, vec!["/a", "/c"]);
        assert!(tracker.get(id).unwrap().aggregate.is_none());
    }

    #[test]
    fn test_aggregate_deferred_members() {
        let mut aggregate = ResponseAggregate::new(3);
        aggregate.defer("/a/b".into());
        aggregate.defer("/a/c".into());
        assert_eq!(aggregate.take_deferred(Some("/a/c")).as_deref(), Some("/a/c"));
        assert_eq!(aggregate.take_deferred(None).as_deref(), Some("/a/b"));
        assert_eq!(aggregate.take_deferred(None), None);
        assert_eq!(aggregate.pending(), 3);
    }
}
