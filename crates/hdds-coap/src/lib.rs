// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CoAP-style request/response engine for constrained IoT peers.
//!
//! One [`Engine`] plays client, server or both. It tracks outstanding client
//! transactions, reassembles and dispatches inbound requests to resource
//! handlers, keeps observe subscriptions, and announces or watches presence.
//! Bytes on the wire are somebody else's job: the engine talks to a
//! [`Transport`] in terms of parsed messages.
//!
//! # Architecture
//!
//! ```text
//!   application                      Engine                       Transport
//!        |                             |                              |
//!        |-- do_request(desc, cb) ---->|--- send_request ------------>|
//!        |                             |                              |
//!        |                             |<-- poll_event: Response -----|
//!        |<-- cb(ClientResponse) ------|   (transactions, stale seq)  |
//!        |                             |                              |
//!        |                             |<-- poll_event: Request ------|
//!        |<-- handler(EntityRequest) --|   (tracker, observers)       |
//!        |--- EntityReply ------------>|--- send_response ----------->|
//!        |                             |                              |
//!        |-- notify_all_observers ---->|--- notification per observer>|
//! ```
//!
//! # Key Features
//!
//! - **Observe**: 24-bit notification sequence numbers, stale filtering,
//!   eviction after repeated delivery failures
//! - **Presence**: server announcements with TTL, subscriber staging with
//!   probes at 50/75/85/95/100 % of the TTL
//! - **Collections**: batch interface aggregates member answers, slow
//!   members included
//! - **Routing**: optional little-endian route option for gateway segments
//!
//! The engine is single-threaded and runs every callback inside
//! [`Engine::process`].

pub mod client;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod observe;
pub mod payload;
pub mod presence;
pub mod resource;
pub mod result;
pub mod route;
pub mod routing;
pub mod server;
pub mod transport;

// Re-exports for convenience.
pub use client::{
    CallbackAction, ClientMethod, ClientResponse, Qos, RequestDescriptor, TransactionHandle,
};
pub use clock::{ManualTicks, MonotonicTicks, TickSource};
pub use config::{EngineConfig, EngineMode, RoutingConfig, RoutingMode};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use message::{
    Adapter, ContentFormat, Endpoint, HeaderOption, MessageInfo, MessageType, Method,
    RequestInfo, ResponseCode, ResponseInfo, Token, TransportFlags,
};
pub use observe::{ObservationId, ObserveAction, ObserveFeedback};
pub use payload::{
    DiscoveryPayload, JsonCodec, LinkPayload, Payload, PayloadCodec, PayloadKind,
    PresencePayload, PresenceTrigger, RepPayload,
};
pub use resource::{
    EntityHandler, EntityReply, EntityRequest, EntityResponse, HandlerFlags, ObserveInfo,
    ResourceHandle, ResourceProperties, ResourceSpec,
};
pub use result::{EntityResult, StackResult};
pub use route::{RouteAddress, RouteKind, RouteOption};
pub use server::RequestId;
pub use transport::{
    ErrorInfo, MemoryTransport, Outbound, Transport, TransportError, TransportEvent,
};
