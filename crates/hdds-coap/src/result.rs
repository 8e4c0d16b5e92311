// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Result vocabularies and the mapping between them.
//
// Three vocabularies meet here: wire response codes (transport side),
// stack results (callbacks and internal control flow), and entity handler
// results (resource side).

use std::fmt;

use crate::message::{Method, ResponseCode};
use crate::transport::TransportError;

/// Result code delivered to client callbacks and used for internal routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackResult {
    Ok,
    ResourceCreated,
    ResourceDeleted,
    ResourceChanged,
    /// Processing continues (more fragments or a deferred answer).
    Continue,
    SlowResource,
    InvalidQuery,
    InvalidOption,
    InvalidMethod,
    NoResource,
    ResourceError,
    CommError,
    GatewayTimeout,
    /// Client transaction deadline passed without a final answer.
    Timeout,
    NotAcceptable,
    UnauthorizedReq,
    ForbiddenReq,
    TooLargeReq,
    InternalServerError,
    BadEndpoint,
    PresenceStopped,
    PresenceTimeout,
    NoObservers,
    ObserverNotFound,
    Error,
}

impl StackResult {
    /// True for results that complete a request successfully.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Ok | Self::ResourceCreated | Self::ResourceDeleted | Self::ResourceChanged
        )
    }

    /// Map a received wire code to a stack result.
    pub fn from_response_code(code: ResponseCode) -> Self {
        match code {
            ResponseCode::Created => Self::ResourceCreated,
            ResponseCode::Deleted => Self::ResourceDeleted,
            ResponseCode::Changed => Self::ResourceChanged,
            ResponseCode::Content | ResponseCode::Valid => Self::Ok,
            ResponseCode::BadRequest => Self::InvalidQuery,
            ResponseCode::Unauthorized => Self::UnauthorizedReq,
            ResponseCode::BadOption => Self::InvalidOption,
            ResponseCode::NotFound => Self::NoResource,
            ResponseCode::RetransmitTimeout => Self::GatewayTimeout,
            ResponseCode::RequestEntityTooLarge => Self::TooLargeReq,
            ResponseCode::NotAcceptable => Self::NotAcceptable,
            ResponseCode::Forbidden => Self::ForbiddenReq,
            ResponseCode::InternalServerError => Self::InternalServerError,
            _ => Self::Error,
        }
    }

    /// Map a stack result to the wire code answering a request of `method`.
    pub fn to_response_code(self, method: Method) -> ResponseCode {
        match self {
            Self::Ok => match method {
                Method::Put | Method::Post => ResponseCode::Changed,
                _ => ResponseCode::Content,
            },
            Self::ResourceCreated => ResponseCode::Created,
            Self::ResourceDeleted => ResponseCode::Deleted,
            Self::ResourceChanged => ResponseCode::Changed,
            Self::InvalidQuery => ResponseCode::BadRequest,
            Self::InvalidOption => ResponseCode::BadOption,
            Self::NoResource => ResponseCode::NotFound,
            Self::CommError | Self::GatewayTimeout => ResponseCode::RetransmitTimeout,
            Self::NotAcceptable => ResponseCode::NotAcceptable,
            Self::UnauthorizedReq => ResponseCode::Unauthorized,
            Self::ForbiddenReq => ResponseCode::Forbidden,
            Self::TooLargeReq => ResponseCode::RequestEntityTooLarge,
            Self::BadEndpoint | Self::InvalidMethod => ResponseCode::BadRequest,
            _ => ResponseCode::InternalServerError,
        }
    }

    /// Map a transport delivery failure to a stack result.
    pub fn from_transport_error(err: &TransportError) -> Self {
        match err {
            TransportError::RetransmitTimeout => Self::GatewayTimeout,
            TransportError::MemoryAllocFailed => Self::Error,
            _ => Self::CommError,
        }
    }
}

impl fmt::Display for StackResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result returned by an entity handler for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityResult {
    Ok,
    /// The handler answers later through `Engine::respond`.
    Slow,
    Error,
    Forbidden,
    NotAcceptable,
    InternalServerError,
    ResourceCreated,
    ResourceDeleted,
    Changed,
    NotFound,
}

impl From<EntityResult> for StackResult {
    fn from(r: EntityResult) -> Self {
        match r {
            EntityResult::Ok => Self::Ok,
            EntityResult::Slow => Self::SlowResource,
            EntityResult::Error => Self::Error,
            EntityResult::Forbidden => Self::ForbiddenReq,
            EntityResult::NotAcceptable => Self::NotAcceptable,
            EntityResult::InternalServerError => Self::InternalServerError,
            EntityResult::ResourceCreated => Self::ResourceCreated,
            EntityResult::ResourceDeleted => Self::ResourceDeleted,
            EntityResult::Changed => Self::ResourceChanged,
            EntityResult::NotFound => Self::NoResource,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_depends_on_method() {
        assert_eq!(StackResult::Ok.to_response_code(Method::Get), ResponseCode::Content);
        assert_eq!(StackResult::Ok.to_response_code(Method::Put), ResponseCode::Changed);
        assert_eq!(StackResult::Ok.to_response_code(Method::Post), ResponseCode::Changed);
        assert_eq!(StackResult::Ok.to_response_code(Method::Delete), ResponseCode::Content);
    }

    #[test]
    fn test_wire_to_stack_and_back() {
        let pairs = [
            (ResponseCode::Created, StackResult::ResourceCreated),
            (ResponseCode::Deleted, StackResult::ResourceDeleted),
            (ResponseCode::Changed, StackResult::ResourceChanged),
            (ResponseCode::BadOption, StackResult::InvalidOption),
            (ResponseCode::NotFound, StackResult::NoResource),
            (ResponseCode::Forbidden, StackResult::ForbiddenReq),
            (ResponseCode::Unauthorized, StackResult::UnauthorizedReq),
            (ResponseCode::NotAcceptable, StackResult::NotAcceptable),
            (ResponseCode::RequestEntityTooLarge, StackResult::TooLargeReq),
            (ResponseCode::InternalServerError, StackResult::InternalServerError),
            (ResponseCode::RetransmitTimeout, StackResult::GatewayTimeout),
        ];
        for (code, result) in pairs {
            assert_eq!(StackResult::from_response_code(code), result);
            assert_eq!(result.to_response_code(Method::Get), code);
        }
    }

    #[test]
    fn test_unmapped_codes() {
        assert_eq!(StackResult::from_response_code(ResponseCode::Valid), StackResult::Ok);
        assert_eq!(
            StackResult::from_response_code(ResponseCode::MethodNotAllowed),
            StackResult::Error
        );
        assert_eq!(
            StackResult::PresenceTimeout.to_response_code(Method::Get),
            ResponseCode::InternalServerError
        );
        assert_eq!(
            StackResult::BadEndpoint.to_response_code(Method::Get),
            ResponseCode::BadRequest
        );
    }

    #[test]
    fn test_entity_results() {
        assert_eq!(StackResult::from(EntityResult::Slow), StackResult::SlowResource);
        assert_eq!(StackResult::from(EntityResult::NotFound), StackResult::NoResource);
        assert!(StackResult::from(EntityResult::Changed).is_success());
        assert!(!StackResult::from(EntityResult::Forbidden).is_success());
    }

    #[test]
    fn test_transport_errors() {
        assert_eq!(
            StackResult::from_transport_error(&TransportError::RetransmitTimeout),
            StackResult::GatewayTimeout
        );
        assert_eq!(
            StackResult::from_transport_error(&TransportError::SendFailed),
            StackResult::CommError
        );
    }
}
