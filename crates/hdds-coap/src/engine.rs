// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Protocol engine.
//
// Single-threaded dispatcher over the transaction registry, the request
// tracker, the observer table, the resource table and the presence state.
// The host drives it by calling `process` with its transport; every client
// callback and entity handler runs inside that call.

use crate::client::{
    is_stale_notification, CallbackAction, ClientMethod, ClientResponse, PresenceStaging, Qos,
    RequestDescriptor, TransactionDescriptor, TransactionHandle, TransactionRegistry,
};
use crate::clock::{ticks_after_secs, MonotonicTicks, TickSource};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::message::{
    observe_value, parse_request_uri, query_param, split_query, Adapter, ContentFormat, Endpoint,
    HeaderOption, MessageInfo, MessageType, Method, RequestInfo, ResponseCode, ResponseInfo,
    Token, BATCH_INTERFACE, DISCOVERY_URI, GATEWAY_URI, LINKS_LIST_INTERFACE, OBSERVE_DEREGISTER,
    OBSERVE_REGISTER, PRESENCE_URI,
};
use crate::observe::{
    next_sequence_number, FeedbackOutcome, ObserveAction, ObserveFeedback, Observer,
    ObserverTable, ObservationId, Subscription, NO_SEQUENCE_NUMBER,
};
use crate::payload::{
    DiscoveryPayload, LinkPayload, Payload, PayloadCodec, PayloadKind, PresenceTrigger,
    RepPayload,
};
use crate::presence::{
    apply_announcement, apply_multicast_announcement, poll_staging, Announcement, PollAction,
    PresenceState, PresenceStatus,
};
use crate::resource::{
    EntityHandler, EntityReply, EntityRequest, EntityResponse, HandlerFlags, ObserveInfo,
    ResourceHandle, ResourceProperties, ResourceSpec, ResourceTable,
};
use crate::result::{EntityResult, StackResult};
use crate::route::RouteKind;
use crate::routing::RouteStrategy;
use crate::server::{Fragment, RequestId, RequestState, RequestTracker, ResponseAggregate};
use crate::transport::{ErrorInfo, Transport, TransportEvent};

/// Resource type of the virtual presence resource.
pub const PRESENCE_RESOURCE_TYPE: &str = "oic.wk.ad";

/// Resource type of the virtual discovery resource.
pub const DISCOVERY_RESOURCE_TYPE: &str = "oic.wk.res";

const TOKEN_ATTEMPTS: usize = 16;

/// The protocol engine.
pub struct Engine {
    config: EngineConfig,
    codec: Box<dyn PayloadCodec>,
    ticks: Box<dyn TickSource>,
    rng: fastrand::Rng,
    routing: RouteStrategy,
    transactions: TransactionRegistry,
    requests: RequestTracker,
    observers: ObserverTable,
    resources: ResourceTable,
    presence: PresenceState,
    presence_resource: ResourceHandle,
    discovery_resource: ResourceHandle,
    default_handler: Option<Box<dyn EntityHandler>>,
}

impl Engine {
    /// Create an engine with the given configuration and payload codec.
    ///
    /// The virtual `/oic/ad` and `/oic/res` resources are created here.
    pub fn new(config: EngineConfig, codec: impl PayloadCodec + 'static) -> Result<Self> {
        config.validate()?;
        let mut resources = ResourceTable::new();
        let presence_resource = resources.create(
            ResourceSpec::new(PRESENCE_URI, PRESENCE_RESOURCE_TYPE).properties(ResourceProperties {
                discoverable: false,
                observable: true,
                active: false,
                ..Default::default()
            }),
        )?;
        let discovery_resource = resources.create(
            ResourceSpec::new(DISCOVERY_URI, DISCOVERY_RESOURCE_TYPE).properties(
                ResourceProperties {
                    discoverable: false,
                    ..Default::default()
                },
            ),
        )?;
        log::info!("engine created in {:?} mode", config.mode);
        Ok(Self {
            routing: RouteStrategy::from_config(&config.routing),
            observers: ObserverTable::new(config.max_observers),
            config,
            codec: Box::new(codec),
            ticks: Box::new(MonotonicTicks::new()),
            rng: fastrand::Rng::new(),
            transactions: TransactionRegistry::new(),
            requests: RequestTracker::new(),
            resources,
            presence: PresenceState::new(),
            presence_resource,
            discovery_resource,
            default_handler: None,
        })
    }

    /// Replace the tick source.
    pub fn with_ticks(mut self, ticks: impl TickSource + 'static) -> Self {
        self.ticks = Box::new(ticks);
        self
    }

    /// Replace the random source used for tokens and observation ids.
    pub fn with_rng(mut self, rng: fastrand::Rng) -> Self {
        self.rng = rng;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn routing(&self) -> RouteStrategy {
        self.routing
    }

    pub fn transactions(&self) -> &TransactionRegistry {
        &self.transactions
    }

    pub fn requests(&self) -> &RequestTracker {
        &self.requests
    }

    pub fn observers(&self) -> &ObserverTable {
        &self.observers
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn presence(&self) -> &PresenceState {
        &self.presence
    }

    pub fn presence_resource(&self) -> ResourceHandle {
        self.presence_resource
    }

    pub fn discovery_resource(&self) -> ResourceHandle {
        self.discovery_resource
    }

    /// Current tick in milliseconds.
    pub fn now(&self) -> u32 {
        self.ticks.now()
    }

    fn transaction_lifetime_ms(&self) -> u64 {
        u64::from(self.config.transaction_timeout_secs) * 1000
    }

    fn new_token(&mut self) -> Result<Token> {
        for _ in 0..TOKEN_ATTEMPTS {
            let token = Token::random(&mut self.rng, self.config.token_length);
            if self.transactions.lookup_by_token(&token).is_none()
                && self.observers.get_by_token(&token).is_none()
            {
                return Ok(token);
            }
        }
        Err(EngineError::ResourceExhausted("no free token".into()))
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    /// Run one engine tick: presence staging and timeouts, then every
    /// pending transport event, then the transport's periodic work.
    pub fn process(&mut self, transport: &mut dyn Transport) {
        let now = self.now();
        self.poll_presence(transport, now);
        self.sweep_expired(now);
        while let Some(event) = transport.poll_event() {
            self.handle_event(transport, event);
        }
        transport.periodic();
    }

    /// Dispatch one transport event.
    pub fn handle_event(&mut self, transport: &mut dyn Transport, event: TransportEvent) {
        match event {
            TransportEvent::Request(endpoint, request) => {
                self.handle_request(transport, endpoint, request)
            }
            TransportEvent::Response(endpoint, response) => {
                self.handle_response(transport, endpoint, response)
            }
            TransportEvent::Error(endpoint, error) => self.handle_error(endpoint, error),
            TransportEvent::ConnectionLost(endpoint) => self.connection_lost(&endpoint),
        }
    }

    fn poll_presence(&mut self, transport: &mut dyn Transport, now: u32) {
        let lifetime = self.transaction_lifetime_ms();
        for handle in self.transactions.presence_handles() {
            let Some(tx) = self.transactions.lookup_by_handle_mut(handle) else {
                continue;
            };
            let Some(staging) = tx.presence.as_mut() else {
                continue;
            };
            match poll_staging(staging, now) {
                PollAction::Idle => {}
                PollAction::Probe => {
                    let stage = staging.stage;
                    let destination = tx.destination.clone();
                    let probe = RequestInfo {
                        method: Method::Get,
                        info: MessageInfo {
                            message_type: MessageType::NonConfirmable,
                            token: tx.token.clone(),
                            accept_format: self.codec.content_format(),
                            resource_uri: Some(PRESENCE_URI.to_string()),
                            ..Default::default()
                        },
                        is_multicast: destination.is_multicast(),
                        more_fragments: false,
                    };
                    log::debug!("{} presence probe {} to {}", handle, stage, destination);
                    if let Err(e) = self.send_request_msg(transport, &destination, probe) {
                        log::warn!("{} presence probe failed: {}", handle, e);
                    }
                }
                PollAction::Timeout => {
                    let response = ClientResponse {
                        handle,
                        result: StackResult::PresenceTimeout,
                        endpoint: tx.destination.clone(),
                        resource_uri: Some(PRESENCE_URI.to_string()),
                        sequence_number: staging.last_sequence.unwrap_or(NO_SEQUENCE_NUMBER),
                        payload: None,
                        options: Vec::new(),
                    };
                    log::info!("{} presence timed out for {}", handle, response.endpoint);
                    if let Err(e) = self.transactions.complete(handle, &response, now, lifetime) {
                        log::warn!("{} presence timeout not delivered: {}", handle, e);
                    }
                }
            }
        }
    }

    fn sweep_expired(&mut self, now: u32) {
        for handle in self.transactions.expired(now) {
            let Some(tx) = self.transactions.lookup_by_handle(handle) else {
                continue;
            };
            let response = ClientResponse {
                handle,
                result: StackResult::Timeout,
                endpoint: tx.destination.clone(),
                resource_uri: Some(tx.request_uri.clone()),
                sequence_number: NO_SEQUENCE_NUMBER,
                payload: None,
                options: Vec::new(),
            };
            log::info!("{} timed out waiting for {}", handle, response.endpoint);
            if let Err(e) = self.transactions.finish(handle, &response) {
                log::warn!("{} timeout not delivered: {}", handle, e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Client API
    // -----------------------------------------------------------------------

    /// Issue a request and register its transaction.
    ///
    /// Presence subscriptions are passive: they are registered and armed by
    /// the first announcement, nothing is sent.
    pub fn do_request<F>(
        &mut self,
        transport: &mut dyn Transport,
        request: RequestDescriptor,
        callback: F,
    ) -> Result<TransactionHandle>
    where
        F: FnMut(&ClientResponse) -> CallbackAction + Send + 'static,
    {
        let RequestDescriptor {
            method,
            uri,
            destination,
            qos,
            mut options,
            payload,
        } = request;

        let (uri_endpoint, path) = parse_request_uri(&uri)?;
        let (bare_path, query) = split_query(&path);
        if bare_path.len() > self.config.max_uri_length
            || query.map_or(0, str::len) > self.config.max_query_length
        {
            return Err(EngineError::InvalidParameter(format!("request URI too long: {}", uri)));
        }
        let resource_type_filter = query
            .and_then(|q| query_param(q, "rt"))
            .map(str::to_string);

        let destination = match destination.or(uri_endpoint) {
            Some(endpoint) => endpoint,
            None if matches!(method, ClientMethod::Discover | ClientMethod::Presence) => {
                Endpoint::multicast(Adapter::Ip)
            }
            None => {
                return Err(EngineError::InvalidParameter(format!("no destination for {}", uri)))
            }
        };
        let qos = if destination.is_multicast() { Qos::Low } else { qos };
        let token = self.new_token()?;

        if method == ClientMethod::Presence {
            let descriptor = TransactionDescriptor {
                method,
                request_uri: destination.presence_uri(),
                resource_type_filter,
                destination,
                qos,
                deadline: None,
            };
            let handle = self
                .transactions
                .register_presence(token, descriptor, Box::new(callback))?;
            log::info!("{} presence subscription registered", handle);
            return Ok(handle);
        }

        if method.is_observe() {
            options.push(HeaderOption::observe(OBSERVE_REGISTER));
        }
        let payload = payload.map(|p| self.codec.encode(&p)).transpose()?;
        let request = RequestInfo {
            method: method.wire(),
            info: MessageInfo {
                message_type: message_type_for(qos),
                message_id: 0,
                token: token.clone(),
                options,
                content_format: if payload.is_some() {
                    self.codec.content_format()
                } else {
                    ContentFormat::Undefined
                },
                payload,
                accept_format: self.codec.content_format(),
                resource_uri: Some(path.clone()),
            },
            is_multicast: destination.is_multicast(),
            more_fragments: false,
        };
        let deadline = if method.is_long_lived() {
            None
        } else {
            Some(ticks_after_secs(self.now(), self.config.transaction_timeout_secs))
        };
        let descriptor = TransactionDescriptor {
            method,
            request_uri: path,
            resource_type_filter: None,
            destination: destination.clone(),
            qos,
            deadline,
        };
        let handle = self
            .transactions
            .register(token, descriptor, Box::new(callback))?;
        if let Err(e) = self.send_request_msg(transport, &destination, request) {
            self.transactions.remove(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Cancel a transaction.
    ///
    /// Observations over a reliable transport or at High qos are ended with
    /// an explicit deregistration carrying the same token; everything else
    /// is dropped locally.
    pub fn cancel(
        &mut self,
        transport: &mut dyn Transport,
        handle: TransactionHandle,
        qos: Qos,
        mut options: Vec<HeaderOption>,
    ) -> Result<()> {
        let tx = self
            .transactions
            .lookup_by_handle(handle)
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
        let explicit =
            tx.method.is_observe() && (tx.destination.adapter != Adapter::Ip || qos == Qos::High);
        if !explicit {
            self.transactions.cancel(handle)?;
            log::debug!("{} cancelled locally", handle);
            return Ok(());
        }

        options.push(HeaderOption::observe(OBSERVE_DEREGISTER));
        let destination = tx.destination.clone();
        let request = RequestInfo {
            method: Method::Get,
            info: MessageInfo {
                message_type: message_type_for(qos),
                token: tx.token.clone(),
                options,
                accept_format: self.codec.content_format(),
                resource_uri: Some(tx.request_uri.clone()),
                ..Default::default()
            },
            is_multicast: false,
            more_fragments: false,
        };
        self.transactions.cancel(handle)?;
        log::debug!("{} cancelled, deregistering at {}", handle, destination);
        self.send_request_msg(transport, &destination, request)
    }

    // -----------------------------------------------------------------------
    // Response path
    // -----------------------------------------------------------------------

    /// Handle one inbound response.
    pub fn handle_response(
        &mut self,
        transport: &mut dyn Transport,
        mut endpoint: Endpoint,
        mut response: ResponseInfo,
    ) {
        if let Err(e) = self
            .routing
            .extract_inbound(&mut endpoint, &mut response.info.options)
        {
            log::warn!("dropping response from {}: {}", endpoint, e);
            return;
        }
        let token = response.info.token.clone();
        let tx = self
            .transactions
            .lookup_by_token(&token)
            .map(|t| (t.handle, t.method));

        let presence_uri = response
            .info
            .resource_uri
            .as_deref()
            .is_some_and(|u| split_query(u).0 == PRESENCE_URI);
        if presence_uri || matches!(tx, Some((_, ClientMethod::Presence))) {
            self.handle_presence_response(endpoint, response);
            return;
        }

        if let Some((handle, method)) = tx {
            self.handle_transaction_response(transport, handle, method, endpoint, response);
            return;
        }

        if self.observers.get_by_token(&token).is_some() {
            let signal = match (response.code, response.info.message_type) {
                (ResponseCode::Empty, MessageType::Reset) => Some(ObserveFeedback::NotInterested),
                (ResponseCode::Empty, MessageType::Acknowledgement) => {
                    Some(ObserveFeedback::StillInterested)
                }
                (ResponseCode::RetransmitTimeout, _) => Some(ObserveFeedback::CommFailed),
                _ => None,
            };
            if let Some(signal) = signal {
                self.apply_feedback(&token, signal);
            }
            return;
        }

        if response.code == ResponseCode::Empty || !self.config.mode.accepts_responses() {
            log::debug!("unmatched response token={} from {}", token, endpoint);
            return;
        }
        log::debug!("unmatched response token={} from {}, sending RESET", token, endpoint);
        let reset = ResponseInfo::empty(MessageType::Reset, response.info.message_id, token);
        if let Err(e) = self.send_response_msg(transport, &endpoint, reset) {
            log::warn!("RESET to {} failed: {}", endpoint, e);
        }
    }

    fn handle_transaction_response(
        &mut self,
        transport: &mut dyn Transport,
        handle: TransactionHandle,
        method: ClientMethod,
        endpoint: Endpoint,
        response: ResponseInfo,
    ) {
        if response.code == ResponseCode::Empty {
            log::debug!("{} {:?} from {}", handle, response.info.message_type, endpoint);
            return;
        }
        if response.code == ResponseCode::RequestEntityIncomplete {
            log::debug!("{} waiting for remaining fragments", handle);
            return;
        }
        let Some(tx) = self.transactions.lookup_by_handle(handle) else {
            return;
        };
        let request_uri = tx.request_uri.clone();
        let stored = tx.sequence_number;

        let observe = observe_value(&response.info.options);
        let terminal = matches!(
            response.code,
            ResponseCode::RetransmitTimeout | ResponseCode::NotAcceptable
        ) || (method.is_observe() && response.code == ResponseCode::Content && observe.is_none());
        let sequence_number = observe.unwrap_or(NO_SEQUENCE_NUMBER);

        if !terminal && is_stale_notification(method, sequence_number, stored) {
            log::debug!(
                "{} dropping stale notification {} (last {})",
                handle,
                sequence_number,
                stored
            );
        } else {
            let client_response = ClientResponse {
                handle,
                result: StackResult::from_response_code(response.code),
                endpoint: endpoint.clone(),
                resource_uri: response.info.resource_uri.clone(),
                sequence_number,
                payload: self.decode_response_payload(method, &request_uri, &response.info),
                options: response.info.options.clone(),
            };
            let delivered = if terminal {
                log::debug!("{} ended by {}", handle, response.code.dotted());
                self.transactions.finish(handle, &client_response)
            } else {
                let (now, lifetime) = (self.now(), self.transaction_lifetime_ms());
                self.transactions
                    .complete(handle, &client_response, now, lifetime)
                    .map(|_| ())
            };
            if let Err(e) = delivered {
                log::warn!("{} response not delivered: {}", handle, e);
            }
        }

        if response.info.message_type == MessageType::Confirmable {
            let ack = ResponseInfo::empty(
                MessageType::Acknowledgement,
                response.info.message_id,
                response.info.token,
            );
            if let Err(e) = self.send_response_msg(transport, &endpoint, ack) {
                log::warn!("ACK to {} failed: {}", endpoint, e);
            }
        }
    }

    fn decode_response_payload(
        &self,
        method: ClientMethod,
        request_uri: &str,
        info: &MessageInfo,
    ) -> Option<Payload> {
        let bytes = info.payload.as_deref().filter(|b| !b.is_empty())?;
        let kind = if method == ClientMethod::Discover {
            PayloadKind::Discovery
        } else {
            PayloadKind::Representation
        };
        let payload = match self.codec.decode(bytes, kind) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("undecodable payload for {}: {}", request_uri, e);
                return None;
            }
        };
        let (path, query) = split_query(request_uri);
        let batch = query.and_then(|q| query_param(q, "if")) == Some(BATCH_INTERFACE);
        match payload {
            Payload::Representation(rep) if batch && rep.uri.as_deref() != Some(path) => {
                Some(Payload::Representation(RepPayload::batch(path, vec![rep])))
            }
            other => Some(other),
        }
    }

    fn handle_presence_response(&mut self, endpoint: Endpoint, response: ResponseInfo) {
        if response.code != ResponseCode::Content {
            log::debug!("presence {} from {} ignored", response.code.dotted(), endpoint);
            return;
        }
        let Some(bytes) = response.info.payload.as_deref().filter(|b| !b.is_empty()) else {
            log::debug!("presence response from {} without payload", endpoint);
            return;
        };
        let announcement = match self.codec.decode(bytes, PayloadKind::Presence) {
            Ok(Payload::Presence(p)) => p,
            Ok(_) => return,
            Err(e) => {
                log::warn!("bad presence payload from {}: {}", endpoint, e);
                return;
            }
        };

        let canonical = endpoint.presence_uri();
        let handle = self
            .transactions
            .lookup_by_uri(&canonical)
            .or_else(|| self.transactions.lookup_by_uri(PRESENCE_URI))
            .or_else(|| self.transactions.lookup_by_token(&response.info.token))
            .filter(|t| t.method == ClientMethod::Presence)
            .map(|t| t.handle);
        let Some(handle) = handle else {
            log::debug!("no presence subscription for {}", endpoint);
            return;
        };

        let (now, lifetime) = (self.now(), self.transaction_lifetime_ms());
        let Some(tx) = self.transactions.lookup_by_handle_mut(handle) else {
            return;
        };
        let multicast = tx.destination.is_multicast();
        let filter = tx.resource_type_filter.clone();
        let staging = tx.presence.get_or_insert_with(PresenceStaging::default);
        let outcome = if multicast {
            apply_multicast_announcement(staging, &endpoint.to_string(), &announcement)
        } else {
            apply_announcement(staging, &announcement, now)
        };
        let result = match outcome {
            Announcement::Stale | Announcement::Refreshed => {
                log::trace!(
                    "{} presence {:?} seq={} from {}",
                    handle,
                    outcome,
                    announcement.sequence_number,
                    endpoint
                );
                return;
            }
            Announcement::Stopped => StackResult::PresenceStopped,
            Announcement::Fresh => StackResult::Ok,
        };
        let announced_type = announcement.resource_type.as_deref();
        if let (Some(filter), Some(rt)) = (filter.as_deref(), announced_type) {
            if filter != rt {
                return;
            }
        }

        let client_response = ClientResponse {
            handle,
            result,
            endpoint,
            resource_uri: Some(PRESENCE_URI.to_string()),
            sequence_number: announcement.sequence_number,
            payload: Some(Payload::Presence(announcement)),
            options: response.info.options,
        };
        if let Err(e) = self
            .transactions
            .complete(handle, &client_response, now, lifetime)
        {
            log::warn!("{} presence not delivered: {}", handle, e);
        }
    }

    /// Handle a transport delivery failure.
    pub fn handle_error(&mut self, mut endpoint: Endpoint, mut error: ErrorInfo) {
        if let Err(e) = self
            .routing
            .extract_inbound(&mut endpoint, &mut error.info.options)
        {
            log::debug!("error event from {} with bad route option: {}", endpoint, e);
        }
        let token = error.info.token.clone();
        if let Some(tx) = self.transactions.lookup_by_token(&token) {
            let handle = tx.handle;
            if tx.method == ClientMethod::Presence {
                // staging reports the timeout
                log::debug!("{} presence probe to {} failed: {}", handle, endpoint, error.error);
                return;
            }
            log::warn!("{} delivery to {} failed: {}", handle, endpoint, error.error);
            let response = ClientResponse {
                handle,
                result: StackResult::from_transport_error(&error.error),
                endpoint,
                resource_uri: error.info.resource_uri,
                sequence_number: NO_SEQUENCE_NUMBER,
                payload: None,
                options: Vec::new(),
            };
            if let Err(e) = self.transactions.finish(handle, &response) {
                log::warn!("{} error not delivered: {}", handle, e);
            }
            return;
        }
        if self.observers.get_by_token(&token).is_some() {
            self.apply_feedback(&token, ObserveFeedback::CommFailed);
            return;
        }
        log::debug!("error event for unknown token={} from {}", token, endpoint);
    }

    /// Evict every observer of a peer whose connection closed.
    pub fn connection_lost(&mut self, endpoint: &Endpoint) {
        let evicted = self.observers.evict_peer(endpoint);
        if evicted.is_empty() {
            return;
        }
        log::info!(
            "connection to {} lost, {} observer(s) removed",
            endpoint,
            evicted.len()
        );
        for observer in &evicted {
            self.notify_deregistration(observer);
        }
    }

    // -----------------------------------------------------------------------
    // Observer feedback
    // -----------------------------------------------------------------------

    /// Apply delivery feedback to the observer registered under `token`.
    pub fn observer_feedback(&mut self, token: &Token, signal: ObserveFeedback) -> Result<()> {
        match self.observers.feedback(token, signal) {
            FeedbackOutcome::Removed(observer) => {
                self.notify_deregistration(&observer);
                Ok(())
            }
            FeedbackOutcome::Retained => Ok(()),
            FeedbackOutcome::NotFound => Err(EngineError::NotFound(format!("observer {}", token))),
        }
    }

    fn apply_feedback(&mut self, token: &Token, signal: ObserveFeedback) {
        if let Err(e) = self.observer_feedback(token, signal) {
            log::debug!("{:?} feedback dropped: {}", signal, e);
        }
    }

    fn notify_deregistration(&mut self, observer: &Observer) {
        let request = EntityRequest {
            request_id: None,
            resource: Some(observer.resource),
            uri: observer.resource_uri.clone(),
            method: Method::Get,
            query: observer.query.clone(),
            payload: None,
            endpoint: observer.endpoint.clone(),
            options: Vec::new(),
            observe: Some(ObserveInfo {
                action: ObserveAction::Deregister,
                id: observer.id,
            }),
        };
        let flags = HandlerFlags {
            request: false,
            observe: true,
        };
        if let Some(resource) = self.resources.get_mut(observer.resource) {
            resource.dispatch(flags, &request);
        }
    }

    // -----------------------------------------------------------------------
    // Request path
    // -----------------------------------------------------------------------

    /// Handle one inbound request.
    pub fn handle_request(
        &mut self,
        transport: &mut dyn Transport,
        mut endpoint: Endpoint,
        mut request: RequestInfo,
    ) {
        let kind = match self
            .routing
            .extract_inbound(&mut endpoint, &mut request.info.options)
        {
            Ok(kind) => kind,
            Err(e) => {
                log::warn!("dropping request from {}: {}", endpoint, e);
                return;
            }
        };
        if kind != RouteKind::Normal && request.info.payload.as_ref().map_or(true, Vec::is_empty) {
            let message_type = if kind == RouteKind::Ack {
                MessageType::Acknowledgement
            } else {
                MessageType::Reset
            };
            let empty =
                ResponseInfo::empty(message_type, request.info.message_id, request.info.token);
            self.handle_response(transport, endpoint, empty);
            return;
        }
        if !self.config.mode.accepts_requests() {
            log::debug!("ignoring request from {} in client mode", endpoint);
            return;
        }

        let info = request.info;
        let uri = info.resource_uri.clone().unwrap_or_default();
        let (path, query) = split_query(&uri);
        if path.len() > self.config.max_uri_length
            || query.map_or(0, str::len) > self.config.max_query_length
        {
            log::warn!("request URI from {} exceeds limits", endpoint);
            return;
        }
        let token = info.token.clone();
        let reply_type = if info.message_type == MessageType::Confirmable {
            MessageType::Acknowledgement
        } else {
            MessageType::NonConfirmable
        };
        let (message_id, message_type) = (info.message_id, info.message_type);

        if let Method::Other(code) = request.method {
            log::warn!("unsupported method code {:#04x} from {}", code, endpoint);
            let reply =
                ResponseInfo::direct(ResponseCode::BadRequest, reply_type, message_id, token);
            self.send_direct(transport, &endpoint, reply);
            return;
        }
        if info.options.len() > self.config.max_header_options {
            log::warn!("{} header options from {}", info.options.len(), endpoint);
            let reply =
                ResponseInfo::direct(ResponseCode::BadOption, reply_type, message_id, token);
            self.send_direct(transport, &endpoint, reply);
            return;
        }

        let fragment = Fragment {
            endpoint: endpoint.clone(),
            message_id,
            message_type,
            method: request.method,
            resource_uri: path.to_string(),
            query: query.map(str::to_string),
            observe: ObserveAction::from_option(observe_value(&info.options)),
            payload: info.payload.unwrap_or_default(),
            options: info.options,
            content_format: info.content_format,
            accept_format: info.accept_format,
            more: request.more_fragments,
        };
        let result = self.handle_stack_request(transport, token.clone(), fragment);
        match result {
            r if r.is_success() || r == StackResult::Continue => {}
            StackResult::SlowResource => {
                if message_type == MessageType::Confirmable {
                    let ack = ResponseInfo::empty(MessageType::Acknowledgement, message_id, token);
                    self.send_direct(transport, &endpoint, ack);
                }
            }
            StackResult::CommError => {}
            failure if request.is_multicast => {
                log::debug!("no error reply to multicast request: {}", failure);
            }
            failure => {
                log::debug!("request from {} failed: {}", endpoint, failure);
                let code = failure.to_response_code(request.method);
                let reply = ResponseInfo::direct(code, reply_type, message_id, token);
                self.send_direct(transport, &endpoint, reply);
            }
        }
    }

    fn handle_stack_request(
        &mut self,
        transport: &mut dyn Transport,
        token: Token,
        fragment: Fragment,
    ) -> StackResult {
        let (id, state) = match self.requests.accept_fragment(token, fragment) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("request rejected: {}", e);
                return StackResult::Error;
            }
        };
        match state {
            RequestState::Assembling => return StackResult::Continue,
            RequestState::Dispatched => {
                log::debug!("{} already dispatched, ignoring duplicate", id);
                return StackResult::Continue;
            }
            RequestState::Complete => {}
        }
        if let Err(e) = self.requests.dispatch(id) {
            log::warn!("{}", e);
            self.requests.remove(id);
            return StackResult::Error;
        }
        let result = self.process_request(transport, id);
        if !(result.is_success()
            || matches!(result, StackResult::Continue | StackResult::SlowResource))
        {
            self.requests.remove(id);
        }
        result
    }

    fn process_request(&mut self, transport: &mut dyn Transport, id: RequestId) -> StackResult {
        let Some(req) = self.requests.get(id) else {
            return StackResult::Error;
        };
        let path = req.resource_uri.clone();
        let interface = req
            .query
            .as_deref()
            .and_then(|q| query_param(q, "if"))
            .map(str::to_string);

        if path == PRESENCE_URI {
            return self.handle_presence_request(transport, id);
        }
        if path == DISCOVERY_URI {
            return self.handle_discovery_request(transport, id);
        }
        let Some(resource) = self.resources.find_by_uri(&path) else {
            if self.default_handler.is_some() {
                return self.handle_default_device_request(transport, id);
            }
            return StackResult::NoResource;
        };
        if !resource.properties.active {
            return StackResult::NoResource;
        }
        let handle = resource.handle;
        let collection = resource.is_collection() && !resource.has_handler();
        if let Some(iface) = interface.as_deref() {
            let collection_iface =
                collection && (iface == BATCH_INTERFACE || iface == LINKS_LIST_INTERFACE);
            if !collection_iface && !resource.supports_interface(iface) {
                return StackResult::InvalidQuery;
            }
        }
        if let Some(req) = self.requests.get_mut(id) {
            req.resource = Some(handle);
        }
        if collection {
            self.handle_collection_request(transport, id, handle)
        } else {
            self.handle_entity_request(transport, id, handle)
        }
    }

    /// Build the handler's view of a tracked request.
    fn entity_request(
        &self,
        id: RequestId,
        resource: Option<ResourceHandle>,
        observe: Option<ObserveInfo>,
    ) -> std::result::Result<EntityRequest, StackResult> {
        let req = self.requests.get(id).ok_or(StackResult::Error)?;
        let payload = if req.payload.is_empty() {
            None
        } else {
            match self.codec.decode(&req.payload, PayloadKind::Representation) {
                Ok(p) => Some(p),
                Err(e) => {
                    log::warn!("{} undecodable request payload: {}", id, e);
                    return Err(StackResult::InvalidQuery);
                }
            }
        };
        Ok(EntityRequest {
            request_id: Some(id),
            resource,
            uri: req.resource_uri.clone(),
            method: req.method,
            query: req.query.clone(),
            payload,
            endpoint: req.endpoint.clone(),
            options: req.options.clone(),
            observe,
        })
    }

    fn handle_entity_request(
        &mut self,
        transport: &mut dyn Transport,
        id: RequestId,
        resource: ResourceHandle,
    ) -> StackResult {
        let Some(req) = self.requests.get(id) else {
            return StackResult::Error;
        };
        let token = req.token.clone();
        let action = req.observe;
        let mut flags = HandlerFlags {
            request: true,
            observe: false,
        };
        let mut observe = None;
        let mut registered = false;

        match action {
            ObserveAction::Register => {
                let observable = self
                    .resources
                    .get(resource)
                    .is_some_and(|r| r.properties.observable && r.properties.active);
                if !observable {
                    log::debug!(
                        "{}: {} is not observable",
                        StackResult::ResourceError,
                        req.resource_uri
                    );
                } else if self.observers.find(&token, resource).is_some() {
                    log::debug!("repeated registration token={}, already observing", token);
                    self.requests.remove(id);
                    return StackResult::Ok;
                } else {
                    let subscription = Subscription {
                        token: token.clone(),
                        endpoint: req.endpoint.clone(),
                        resource,
                        resource_uri: req.resource_uri.clone(),
                        query: req.query.clone(),
                        qos: req.qos,
                        accept_format: req.accept_format,
                    };
                    match self.observers.subscribe(subscription, &mut self.rng) {
                        Ok(observation) => {
                            flags.observe = true;
                            registered = true;
                            observe = Some(ObserveInfo {
                                action: ObserveAction::Register,
                                id: observation,
                            });
                            let sequence = self.resources.get(resource).map(|r| r.sequence_number);
                            if let Some(req) = self.requests.get_mut(id) {
                                req.observation_id = Some(observation);
                                req.observe_sequence = sequence;
                            }
                        }
                        Err(e) => {
                            log::warn!("{}: {}", StackResult::ResourceError, e);
                        }
                    }
                }
            }
            ObserveAction::Deregister => {
                if let Some(observation) = self.observers.find(&token, resource).map(|o| o.id) {
                    self.observers.unsubscribe(&token);
                    flags.observe = true;
                    observe = Some(ObserveInfo {
                        action: ObserveAction::Deregister,
                        id: observation,
                    });
                } else {
                    log::debug!("deregistration for unknown observer token={}", token);
                }
            }
            ObserveAction::NoOption => {}
        }

        let request = match self.entity_request(id, Some(resource), observe) {
            Ok(r) => r,
            Err(result) => {
                if registered {
                    self.observers.unsubscribe(&token);
                }
                return result;
            }
        };
        let reply = self
            .resources
            .get_mut(resource)
            .and_then(|r| r.dispatch(flags, &request));

        match reply {
            Some(EntityReply::Respond(response)) if response.result == EntityResult::Slow => {
                self.mark_slow(id);
                StackResult::SlowResource
            }
            Some(EntityReply::Respond(response)) => {
                if registered && !StackResult::from(response.result).is_success() {
                    self.rollback_registration(id, &token);
                }
                self.reply(transport, id, response)
            }
            Some(EntityReply::Slow) => {
                self.mark_slow(id);
                StackResult::SlowResource
            }
            Some(EntityReply::Error(result)) => {
                if registered {
                    self.rollback_registration(id, &token);
                }
                StackResult::from(result)
            }
            None => {
                if registered {
                    self.rollback_registration(id, &token);
                }
                log::warn!("{} has no entity handler", request.uri);
                StackResult::Error
            }
        }
    }

    fn rollback_registration(&mut self, id: RequestId, token: &Token) {
        self.observers.unsubscribe(token);
        if let Some(req) = self.requests.get_mut(id) {
            req.observation_id = None;
            req.observe_sequence = None;
        }
    }

    fn aggregate_mut(&mut self, id: RequestId) -> Option<&mut ResponseAggregate> {
        self.requests.get_mut(id).and_then(|r| r.aggregate.as_mut())
    }

    fn mark_slow(&mut self, id: RequestId) {
        if let Some(req) = self.requests.get_mut(id) {
            req.slow = true;
        }
    }

    fn handle_default_device_request(
        &mut self,
        transport: &mut dyn Transport,
        id: RequestId,
    ) -> StackResult {
        let request = match self.entity_request(id, None, None) {
            Ok(r) => r,
            Err(result) => return result,
        };
        let flags = HandlerFlags {
            request: true,
            observe: false,
        };
        let Some(handler) = self.default_handler.as_mut() else {
            return StackResult::NoResource;
        };
        match handler.handle(flags, &request) {
            EntityReply::Respond(response) => self.reply(transport, id, response),
            EntityReply::Slow => {
                self.mark_slow(id);
                StackResult::SlowResource
            }
            EntityReply::Error(result) => StackResult::from(result),
        }
    }

    fn handle_collection_request(
        &mut self,
        transport: &mut dyn Transport,
        id: RequestId,
        collection: ResourceHandle,
    ) -> StackResult {
        let Some(req) = self.requests.get(id) else {
            return StackResult::Error;
        };
        let method = req.method;
        let batch = req
            .query
            .as_deref()
            .and_then(|q| query_param(q, "if"))
            == Some(BATCH_INTERFACE);

        if !batch {
            if method != Method::Get {
                return StackResult::InvalidMethod;
            }
            let links = self.collection_links(collection);
            return self.reply(transport, id, EntityResponse::ok(Payload::Representation(links)));
        }
        if !matches!(method, Method::Get | Method::Put | Method::Post) {
            return StackResult::InvalidMethod;
        }

        let children = self
            .resources
            .get(collection)
            .map(|r| r.children.clone())
            .unwrap_or_default();
        if children.is_empty() {
            return self.send_batch(transport, id, Vec::new());
        }
        if let Err(e) = self.requests.begin_aggregate(id, children.len()) {
            log::warn!("{}", e);
            return StackResult::Error;
        }
        let flags = HandlerFlags {
            request: true,
            observe: false,
        };
        for child in children {
            let request = match self.entity_request(id, Some(child), None) {
                Ok(r) => r,
                Err(result) => return result,
            };
            let reply = self
                .resources
                .get_mut(child)
                .and_then(|member| {
                    let uri = member.uri.clone();
                    member.dispatch(flags, &request).map(|r| (r, uri))
                });
            let part = match reply {
                Some((EntityReply::Slow, member_uri)) => {
                    self.mark_slow(id);
                    if let Some(aggregate) = self.aggregate_mut(id) {
                        aggregate.defer(member_uri);
                    }
                    continue;
                }
                Some((EntityReply::Respond(response), member_uri))
                    if StackResult::from(response.result).is_success() =>
                {
                    member_part(response.payload, Some(member_uri))
                }
                _ => None,
            };
            match self.requests.contribute(id, part) {
                Ok(Some(parts)) => return self.send_batch(transport, id, parts),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("{}", e);
                    return StackResult::Error;
                }
            }
        }
        StackResult::SlowResource
    }

    fn collection_links(&self, collection: ResourceHandle) -> RepPayload {
        let Some(coll) = self.resources.get(collection) else {
            return RepPayload::default();
        };
        let links: Vec<serde_json::Value> = coll
            .children
            .iter()
            .filter_map(|c| self.resources.get(*c))
            .map(|r| {
                serde_json::json!({
                    "href": r.uri,
                    "rt": r.resource_types,
                    "if": r.interfaces,
                })
            })
            .collect();
        let mut rep = RepPayload::with_uri(coll.uri.clone()).set("links", links);
        rep.resource_types = coll.resource_types.clone();
        rep.interfaces = coll.interfaces.clone();
        rep
    }

    fn send_batch(
        &mut self,
        transport: &mut dyn Transport,
        id: RequestId,
        parts: Vec<RepPayload>,
    ) -> StackResult {
        let Some(req) = self.requests.get(id) else {
            return StackResult::Error;
        };
        let merged = RepPayload::batch(&req.resource_uri, parts);
        self.reply(transport, id, EntityResponse::ok(Payload::Representation(merged)))
    }

    fn handle_discovery_request(
        &mut self,
        transport: &mut dyn Transport,
        id: RequestId,
    ) -> StackResult {
        let Some(req) = self.requests.get(id) else {
            return StackResult::Error;
        };
        if req.method != Method::Get {
            return StackResult::InvalidMethod;
        }
        let query = req.query.clone().unwrap_or_default();
        let rt = query_param(&query, "rt");
        let interface = query_param(&query, "if");
        let links: Vec<LinkPayload> = self
            .resources
            .iter()
            .filter(|r| r.properties.discoverable && r.properties.active)
            .filter(|r| rt.map_or(true, |rt| r.resource_types.iter().any(|t| t == rt)))
            .filter(|r| interface.map_or(true, |i| r.supports_interface(i)))
            .map(|r| LinkPayload {
                uri: r.uri.clone(),
                resource_types: r.resource_types.clone(),
                interfaces: r.interfaces.clone(),
                observable: r.properties.observable,
            })
            .collect();
        if links.is_empty() {
            return StackResult::NoResource;
        }
        let payload = Payload::Discovery(DiscoveryPayload { links });
        self.reply(transport, id, EntityResponse::ok(payload))
    }

    fn handle_presence_request(
        &mut self,
        transport: &mut dyn Transport,
        id: RequestId,
    ) -> StackResult {
        if self.presence.status() == PresenceStatus::Uninitialized {
            return StackResult::NoResource;
        }
        if self.requests.get(id).is_some_and(|r| r.method != Method::Get) {
            return StackResult::InvalidMethod;
        }
        let announcement = self.presence.announcement(PresenceTrigger::Change, None);
        self.reply(transport, id, EntityResponse::ok(Payload::Presence(announcement)))
    }

    // -----------------------------------------------------------------------
    // Response send
    // -----------------------------------------------------------------------

    /// Answer a slow request (or a slow collection member).
    pub fn respond(
        &mut self,
        transport: &mut dyn Transport,
        request_id: RequestId,
        response: EntityResponse,
    ) -> Result<()> {
        self.send_entity_response(transport, request_id, response)
            .map(|_| ())
    }

    fn reply(
        &mut self,
        transport: &mut dyn Transport,
        id: RequestId,
        response: EntityResponse,
    ) -> StackResult {
        match self.send_entity_response(transport, id, response) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("{} response not sent: {}", id, e);
                StackResult::CommError
            }
        }
    }

    /// Send the handler's answer for `id` and retire the request. Returns
    /// `Continue` while a collection aggregate still waits for members.
    fn send_entity_response(
        &mut self,
        transport: &mut dyn Transport,
        id: RequestId,
        response: EntityResponse,
    ) -> Result<StackResult> {
        let aggregating = self
            .requests
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?
            .aggregate
            .is_some();
        if aggregating {
            let named = response
                .resource
                .and_then(|h| self.resources.get(h))
                .map(|r| r.uri.clone());
            let member_uri = self
                .aggregate_mut(id)
                .and_then(|a| a.take_deferred(named.as_deref()));
            let part = if StackResult::from(response.result).is_success() {
                member_part(response.payload, member_uri)
            } else {
                None
            };
            return match self.requests.contribute(id, part)? {
                Some(parts) => Ok(self.send_batch(transport, id, parts)),
                None => Ok(StackResult::Continue),
            };
        }

        let Some(req) = self.requests.remove(id) else {
            return Err(EngineError::NotFound(id.to_string()));
        };
        let mut result = StackResult::from(response.result);
        let payload = match response.payload.as_ref().map(|p| self.codec.encode(p)).transpose() {
            Ok(p) => p,
            Err(e) => {
                log::warn!("{} payload not encodable: {}", id, e);
                result = StackResult::InternalServerError;
                None
            }
        };
        let (message_type, message_id) = if req.notification {
            (self.observers.notification_type(&req.token, req.qos), 0)
        } else if req.message_type == MessageType::Confirmable && !req.slow {
            (MessageType::Acknowledgement, req.message_id)
        } else {
            (message_type_for(req.qos), 0)
        };
        let mut options = response.options;
        if let Some(sequence) = req.observe_sequence.filter(|_| result.is_success()) {
            options.push(HeaderOption::observe(sequence));
        }
        let uri = match &req.query {
            Some(q) => format!("{}?{}", req.resource_uri, q),
            None => req.resource_uri.clone(),
        };
        let out = ResponseInfo {
            code: result.to_response_code(req.method),
            info: MessageInfo {
                message_type,
                message_id,
                token: req.token.clone(),
                options,
                content_format: if payload.is_some() {
                    self.codec.content_format()
                } else {
                    ContentFormat::Undefined
                },
                payload,
                accept_format: req.accept_format,
                resource_uri: Some(uri),
            },
            is_multicast: false,
            more_fragments: false,
        };
        if let Err(e) = self.send_response_msg(transport, &req.endpoint, out) {
            if req.notification {
                self.apply_feedback(&req.token, ObserveFeedback::CommFailed);
            }
            return Err(e);
        }
        Ok(StackResult::Ok)
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    /// Notify every observer of `resource`; each notification is produced by
    /// the resource's handler. Returns `NoObservers` when nobody observes.
    pub fn notify_all_observers(
        &mut self,
        transport: &mut dyn Transport,
        resource: ResourceHandle,
        qos: Qos,
    ) -> Result<StackResult> {
        if resource == self.presence_resource {
            return Ok(StackResult::Ok);
        }
        let sequence = self.bump_sequence(resource)?;
        let tokens = self.observers.tokens_of(resource);
        if tokens.is_empty() {
            return Ok(StackResult::NoObservers);
        }
        let flags = HandlerFlags {
            request: true,
            observe: false,
        };
        for token in tokens {
            let Some(observer) = self.observers.get_by_token(&token).cloned() else {
                continue;
            };
            let id = self.requests.add_notification(&observer, sequence, qos)?;
            let request = match self.entity_request(id, Some(resource), None) {
                Ok(mut r) => {
                    r.observe = Some(ObserveInfo {
                        action: ObserveAction::NoOption,
                        id: observer.id,
                    });
                    r
                }
                Err(_) => {
                    self.requests.remove(id);
                    continue;
                }
            };
            let reply = self
                .resources
                .get_mut(resource)
                .and_then(|r| r.dispatch(flags, &request));
            match reply {
                Some(EntityReply::Respond(response)) if response.result != EntityResult::Slow => {
                    if let Err(e) = self.send_entity_response(transport, id, response) {
                        log::warn!("notification to observer {} failed: {}", observer.id, e);
                    }
                }
                Some(EntityReply::Respond(_)) | Some(EntityReply::Slow) => self.mark_slow(id),
                Some(EntityReply::Error(result)) => {
                    log::debug!("handler declined notification: {:?}", result);
                    self.requests.remove(id);
                }
                None => {
                    self.requests.remove(id);
                }
            }
        }
        Ok(StackResult::Ok)
    }

    /// Send `payload` to the listed observers of `resource` without involving
    /// the handler. Returns `NoObservers` when none of them matched.
    pub fn notify_list_of_observers(
        &mut self,
        transport: &mut dyn Transport,
        resource: ResourceHandle,
        observation_ids: &[ObservationId],
        payload: &Payload,
        qos: Qos,
    ) -> Result<StackResult> {
        let sequence = self.bump_sequence(resource)?;
        let bytes = self.codec.encode(payload)?;
        let mut notified = 0usize;
        for id in observation_ids {
            let Some(observer) = self
                .observers
                .by_id(*id)
                .filter(|o| o.resource == resource)
                .cloned()
            else {
                continue;
            };
            let notification = ResponseInfo {
                code: ResponseCode::Content,
                info: MessageInfo {
                    message_type: self.observers.notification_type(&observer.token, qos),
                    message_id: 0,
                    token: observer.token.clone(),
                    options: vec![HeaderOption::observe(sequence)],
                    payload: Some(bytes.clone()),
                    content_format: self.codec.content_format(),
                    accept_format: observer.accept_format,
                    resource_uri: Some(observer.resource_uri.clone()),
                },
                is_multicast: false,
                more_fragments: false,
            };
            match self.send_response_msg(transport, &observer.endpoint, notification) {
                Ok(()) => notified += 1,
                Err(e) => {
                    log::warn!("notification to observer {} failed: {}", observer.id, e);
                    self.apply_feedback(&observer.token, ObserveFeedback::CommFailed);
                }
            }
        }
        if notified == 0 {
            return Ok(StackResult::NoObservers);
        }
        Ok(StackResult::Ok)
    }

    fn bump_sequence(&mut self, resource: ResourceHandle) -> Result<u32> {
        let res = self
            .resources
            .get_mut(resource)
            .ok_or_else(|| EngineError::NotFound(resource.to_string()))?;
        res.sequence_number = next_sequence_number(res.sequence_number);
        Ok(res.sequence_number)
    }

    // -----------------------------------------------------------------------
    // Presence (server side)
    // -----------------------------------------------------------------------

    /// Start announcing presence with `ttl_secs` (0 selects the default).
    pub fn start_presence(&mut self, transport: &mut dyn Transport, ttl_secs: u32) -> Result<()> {
        if !self.config.mode.accepts_requests() {
            return Err(EngineError::Unsupported("presence needs a server role".into()));
        }
        if self.presence.status() == PresenceStatus::Uninitialized {
            let subscription = Subscription {
                token: self.new_token()?,
                endpoint: Endpoint::multicast(Adapter::Ip),
                resource: self.presence_resource,
                resource_uri: PRESENCE_URI.to_string(),
                query: None,
                qos: Qos::Low,
                accept_format: self.codec.content_format(),
            };
            self.observers.subscribe(subscription, &mut self.rng)?;
        }
        self.presence.start(
            ttl_secs,
            self.config.presence_default_ttl_secs,
            self.config.presence_max_ttl_secs,
        );
        if let Some(r) = self.resources.get_mut(self.presence_resource) {
            r.properties.active = true;
        }
        let sequence = self.presence.bump();
        log::info!(
            "presence started: ttl={}s seq={}",
            self.presence.ttl_secs(),
            sequence
        );
        self.send_presence_notification(transport, PresenceTrigger::Create, None);
        Ok(())
    }

    /// Stop announcing presence; subscribers receive a zero-TTL announcement.
    pub fn stop_presence(&mut self, transport: &mut dyn Transport) -> Result<()> {
        if !self.presence.stop() {
            return Err(EngineError::InvalidParameter("presence was never started".into()));
        }
        if let Some(r) = self.resources.get_mut(self.presence_resource) {
            r.properties.active = false;
        }
        log::info!("presence stopped");
        self.send_presence_notification(transport, PresenceTrigger::Delete, None);
        Ok(())
    }

    fn announce(
        &mut self,
        transport: &mut dyn Transport,
        trigger: PresenceTrigger,
        resource_type: Option<String>,
    ) {
        if !self.presence.is_active() {
            return;
        }
        self.presence.bump();
        self.send_presence_notification(transport, trigger, resource_type);
    }

    fn send_presence_notification(
        &mut self,
        transport: &mut dyn Transport,
        trigger: PresenceTrigger,
        resource_type: Option<String>,
    ) {
        let announcement = self.presence.announcement(trigger, resource_type);
        let sequence = announcement.sequence_number;
        let bytes = match self.codec.encode(&Payload::Presence(announcement)) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("presence payload not encodable: {}", e);
                return;
            }
        };
        for token in self.observers.tokens_of(self.presence_resource) {
            let Some(endpoint) = self.observers.get_by_token(&token).map(|o| o.endpoint.clone())
            else {
                continue;
            };
            let notification = ResponseInfo {
                code: ResponseCode::Content,
                info: MessageInfo {
                    message_type: MessageType::NonConfirmable,
                    message_id: 0,
                    token,
                    options: vec![HeaderOption::observe(sequence)],
                    payload: Some(bytes.clone()),
                    content_format: self.codec.content_format(),
                    accept_format: self.codec.content_format(),
                    resource_uri: Some(PRESENCE_URI.to_string()),
                },
                is_multicast: endpoint.is_multicast(),
                more_fragments: false,
            };
            if let Err(e) = self.send_response_msg(transport, &endpoint, notification) {
                log::warn!("presence {:?} to {} failed: {}", trigger, endpoint, e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Resource lifecycle
    // -----------------------------------------------------------------------

    fn ensure_user_resource(&self, handle: ResourceHandle) -> Result<()> {
        if handle == self.presence_resource || handle == self.discovery_resource {
            return Err(EngineError::InvalidParameter(format!(
                "{} is a virtual resource",
                handle
            )));
        }
        Ok(())
    }

    pub fn create_resource(
        &mut self,
        transport: &mut dyn Transport,
        spec: ResourceSpec,
    ) -> Result<ResourceHandle> {
        let resource_type = spec.resource_type.clone();
        let uri = spec.uri.clone();
        let handle = self.resources.create(spec)?;
        log::info!("resource {} created at {}", handle, uri);
        self.announce(transport, PresenceTrigger::Create, Some(resource_type));
        Ok(handle)
    }

    /// Delete a resource. Its observers get a last High-qos notification
    /// and are dropped.
    pub fn delete_resource(
        &mut self,
        transport: &mut dyn Transport,
        handle: ResourceHandle,
    ) -> Result<()> {
        self.ensure_user_resource(handle)?;
        if self.resources.get(handle).is_none() {
            return Err(EngineError::NotFound(handle.to_string()));
        }
        if !self.observers.tokens_of(handle).is_empty() {
            self.notify_all_observers(transport, handle, Qos::High)?;
        }
        self.observers.remove_resource(handle);
        let removed = self.resources.delete(handle)?;
        log::info!("resource {} deleted from {}", handle, removed.uri);
        self.announce(
            transport,
            PresenceTrigger::Delete,
            removed.resource_types.first().cloned(),
        );
        Ok(())
    }

    /// Bind `child` into the collection `collection`.
    pub fn bind_resource(
        &mut self,
        transport: &mut dyn Transport,
        collection: ResourceHandle,
        child: ResourceHandle,
    ) -> Result<()> {
        self.ensure_user_resource(collection)?;
        self.resources.bind_child(collection, child)?;
        let rt = self.first_type(collection);
        self.announce(transport, PresenceTrigger::Change, rt);
        Ok(())
    }

    pub fn unbind_resource(
        &mut self,
        transport: &mut dyn Transport,
        collection: ResourceHandle,
        child: ResourceHandle,
    ) -> Result<()> {
        self.ensure_user_resource(collection)?;
        self.resources.unbind_child(collection, child)?;
        let rt = self.first_type(collection);
        self.announce(transport, PresenceTrigger::Change, rt);
        Ok(())
    }

    pub fn bind_resource_type(
        &mut self,
        transport: &mut dyn Transport,
        handle: ResourceHandle,
        resource_type: &str,
    ) -> Result<()> {
        self.ensure_user_resource(handle)?;
        self.resources.bind_type(handle, resource_type)?;
        self.announce(transport, PresenceTrigger::Change, Some(resource_type.to_string()));
        Ok(())
    }

    pub fn bind_resource_interface(
        &mut self,
        transport: &mut dyn Transport,
        handle: ResourceHandle,
        interface: &str,
    ) -> Result<()> {
        self.ensure_user_resource(handle)?;
        self.resources.bind_interface(handle, interface)?;
        let rt = self.first_type(handle);
        self.announce(transport, PresenceTrigger::Change, rt);
        Ok(())
    }

    fn first_type(&self, handle: ResourceHandle) -> Option<String> {
        self.resources
            .get(handle)
            .and_then(|r| r.resource_types.first().cloned())
    }

    /// Handler for requests to URIs with no resource record.
    pub fn set_default_device_handler(&mut self, handler: impl EntityHandler + 'static) {
        self.default_handler = Some(Box::new(handler));
    }

    // -----------------------------------------------------------------------
    // Send helpers
    // -----------------------------------------------------------------------

    fn send_request_msg(
        &mut self,
        transport: &mut dyn Transport,
        endpoint: &Endpoint,
        mut request: RequestInfo,
    ) -> Result<()> {
        let mut endpoint = endpoint.clone();
        self.routing
            .tag_outbound(&mut endpoint, &mut request.info.options, RouteKind::Normal);
        transport.send_request(&endpoint, &request)?;
        Ok(())
    }

    /// Send a response. Leaf endpoints behind a gateway send empty ACK/RESET
    /// as a gateway POST instead.
    fn send_response_msg(
        &mut self,
        transport: &mut dyn Transport,
        endpoint: &Endpoint,
        mut response: ResponseInfo,
    ) -> Result<()> {
        let mut endpoint = endpoint.clone();
        let kind = match response.info.message_type {
            MessageType::Acknowledgement => RouteKind::Ack,
            MessageType::Reset => RouteKind::Reset,
            _ => RouteKind::Normal,
        };
        if response.code == ResponseCode::Empty
            && kind != RouteKind::Normal
            && self.routing.disguises_empty()
        {
            let mut request = RequestInfo {
                method: Method::Post,
                info: MessageInfo {
                    message_type: MessageType::NonConfirmable,
                    message_id: response.info.message_id,
                    token: response.info.token,
                    options: response.info.options,
                    resource_uri: Some(GATEWAY_URI.to_string()),
                    ..Default::default()
                },
                is_multicast: false,
                more_fragments: false,
            };
            self.routing
                .tag_outbound(&mut endpoint, &mut request.info.options, kind);
            transport.send_request(&endpoint, &request)?;
            return Ok(());
        }
        self.routing
            .tag_outbound(&mut endpoint, &mut response.info.options, RouteKind::Normal);
        transport.send_response(&endpoint, &response)?;
        Ok(())
    }

    fn send_direct(
        &mut self,
        transport: &mut dyn Transport,
        endpoint: &Endpoint,
        response: ResponseInfo,
    ) {
        if let Err(e) = self.send_response_msg(transport, endpoint, response) {
            log::warn!("direct response to {} failed: {}", endpoint, e);
        }
    }
}

fn message_type_for(qos: Qos) -> MessageType {
    match qos {
        Qos::High => MessageType::Confirmable,
        Qos::Low => MessageType::NonConfirmable,
    }
}

/// A collection member's answer as a batch part, named after the member.
fn member_part(payload: Option<Payload>, member_uri: Option<String>) -> Option<RepPayload> {
    match payload? {
        Payload::Representation(mut rep) => {
            if rep.uri.is_none() {
                rep.uri = member_uri;
            }
            Some(rep)
        }
        _ => None,
    }
}
