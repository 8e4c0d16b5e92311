// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Observer table and observe sequence numbers.
//
// Observers are kept in subscription order so notification fan-out is
// deterministic. Deregistration side effects (calling the resource handler)
// belong to the engine; this table only reports what was removed.

use crate::client::Qos;
use crate::error::{EngineError, Result};
use crate::message::{
    ContentFormat, Endpoint, MessageType, Token, OBSERVE_DEREGISTER, OBSERVE_REGISTER,
};
use crate::resource::ResourceHandle;

// ---------------------------------------------------------------------------
// Sequence numbers
// ---------------------------------------------------------------------------

/// Largest observe sequence number; also the wrap point.
pub const MAX_SEQUENCE_NUMBER: u32 = 0xFF_FFFF;

/// Upper edge of the reserved low band. Values 0..=4 double as observe
/// option sentinels and are never used as sequence numbers.
pub const SEQUENCE_NUMBER_OFFSET: u32 = 4;

/// Sequence value meaning "response carried no observe option".
pub const NO_SEQUENCE_NUMBER: u32 = MAX_SEQUENCE_NUMBER + 1;

/// Next observe sequence number after `seq`.
///
/// Skips the reserved band on both ends: reaching the maximum wraps to the
/// first value above the offset band.
pub fn next_sequence_number(seq: u32) -> u32 {
    let next = seq.wrapping_add(1);
    if next >= MAX_SEQUENCE_NUMBER || next <= SEQUENCE_NUMBER_OFFSET {
        SEQUENCE_NUMBER_OFFSET + 1
    } else {
        next
    }
}

/// True if `seq` may be carried as a notification sequence number.
pub fn is_valid_sequence_number(seq: u32) -> bool {
    seq > SEQUENCE_NUMBER_OFFSET && seq < MAX_SEQUENCE_NUMBER
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Identifier the resource handler sees for one observer.
pub type ObservationId = u8;

/// Consecutive failed deliveries that evict an observer. The first two
/// failures are tolerated and switch the observer to confirmable delivery.
pub const OBSERVER_FAILURE_THRESHOLD: u8 = 3;

/// After this many consecutive non-confirmable notifications the next one
/// is sent confirmable, so a vanished observer is eventually detected.
pub const MAX_OBSERVER_NON_COUNT: u8 = 3;

/// Observe sub-option of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserveAction {
    Register,
    Deregister,
    NoOption,
}

impl ObserveAction {
    pub fn from_option(value: Option<u32>) -> Self {
        match value {
            Some(OBSERVE_REGISTER) => Self::Register,
            Some(OBSERVE_DEREGISTER) => Self::Deregister,
            _ => Self::NoOption,
        }
    }
}

/// Delivery feedback for an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveFeedback {
    StillInterested,
    NotInterested,
    CommFailed,
}

/// What `feedback` did.
#[derive(Debug)]
pub enum FeedbackOutcome {
    /// Observer removed; the engine owes its handler a deregistration.
    Removed(Observer),
    /// Observer kept, possibly with updated failure accounting.
    Retained,
    NotFound,
}

/// One subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observer {
    pub id: ObservationId,
    pub token: Token,
    pub endpoint: Endpoint,
    pub resource: ResourceHandle,
    pub resource_uri: String,
    pub query: Option<String>,
    pub qos: Qos,
    pub accept_format: ContentFormat,
    pub failed_comm_count: u8,
    /// Deliver confirmable regardless of `qos` until the peer answers again.
    pub force_high_qos: bool,
    /// Non-confirmable notifications since the last confirmable one.
    pub non_count: u8,
}

/// Parameters of a new subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub token: Token,
    pub endpoint: Endpoint,
    pub resource: ResourceHandle,
    pub resource_uri: String,
    pub query: Option<String>,
    pub qos: Qos,
    pub accept_format: ContentFormat,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// All observers, in subscription order.
#[derive(Debug)]
pub struct ObserverTable {
    observers: Vec<Observer>,
    capacity: usize,
}

impl ObserverTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            observers: Vec::new(),
            capacity: capacity.min(usize::from(ObservationId::MAX)),
        }
    }

    /// Add an observer with a fresh random observation id.
    pub fn subscribe(
        &mut self,
        sub: Subscription,
        rng: &mut fastrand::Rng,
    ) -> Result<ObservationId> {
        if sub.token.is_empty() {
            return Err(EngineError::InvalidParameter("empty observer token".into()));
        }
        if self.find(&sub.token, sub.resource).is_some() {
            return Err(EngineError::InvalidParameter(format!(
                "observer {} already on {}",
                sub.token, sub.resource
            )));
        }
        if self.observers.len() >= self.capacity {
            return Err(EngineError::ResourceExhausted(format!(
                "observer table full ({})",
                self.capacity
            )));
        }
        let id = self.generate_id(rng)?;
        log::info!(
            "observer {} added: token={} {} on {}",
            id,
            sub.token,
            sub.endpoint,
            sub.resource_uri
        );
        self.observers.push(Observer {
            id,
            token: sub.token,
            endpoint: sub.endpoint,
            resource: sub.resource,
            resource_uri: sub.resource_uri,
            query: sub.query,
            qos: sub.qos,
            accept_format: sub.accept_format,
            failed_comm_count: 0,
            force_high_qos: false,
            non_count: 0,
        });
        Ok(id)
    }

    fn generate_id(&self, rng: &mut fastrand::Rng) -> Result<ObservationId> {
        for _ in 0..64 {
            let id = rng.u8(..);
            if self.by_id(id).is_none() {
                return Ok(id);
            }
        }
        (0..=ObservationId::MAX)
            .find(|id| self.by_id(*id).is_none())
            .ok_or_else(|| EngineError::ResourceExhausted("observation ids".into()))
    }

    /// Remove the observer registered under `token`.
    pub fn unsubscribe(&mut self, token: &Token) -> Option<Observer> {
        let idx = self.observers.iter().position(|o| &o.token == token)?;
        let removed = self.observers.remove(idx);
        log::info!("observer {} removed: token={}", removed.id, removed.token);
        Some(removed)
    }

    pub fn get_by_token(&self, token: &Token) -> Option<&Observer> {
        self.observers.iter().find(|o| &o.token == token)
    }

    pub fn find(&self, token: &Token, resource: ResourceHandle) -> Option<&Observer> {
        self.observers
            .iter()
            .find(|o| &o.token == token && o.resource == resource)
    }

    pub fn by_id(&self, id: ObservationId) -> Option<&Observer> {
        self.observers.iter().find(|o| o.id == id)
    }

    /// Tokens of every observer on `resource`, in subscription order.
    pub fn tokens_of(&self, resource: ResourceHandle) -> Vec<Token> {
        self.observers
            .iter()
            .filter(|o| o.resource == resource)
            .map(|o| o.token.clone())
            .collect()
    }

    /// Apply delivery feedback.
    pub fn feedback(&mut self, token: &Token, signal: ObserveFeedback) -> FeedbackOutcome {
        let Some(idx) = self.observers.iter().position(|o| &o.token == token) else {
            return FeedbackOutcome::NotFound;
        };
        match signal {
            ObserveFeedback::NotInterested => {
                log::info!("observer {} not interested", self.observers[idx].id);
                FeedbackOutcome::Removed(self.observers.remove(idx))
            }
            ObserveFeedback::StillInterested => {
                let o = &mut self.observers[idx];
                o.failed_comm_count = 0;
                o.force_high_qos = false;
                FeedbackOutcome::Retained
            }
            ObserveFeedback::CommFailed => {
                let o = &mut self.observers[idx];
                if o.failed_comm_count + 1 >= OBSERVER_FAILURE_THRESHOLD {
                    log::warn!(
                        "observer {} evicted after {} failed deliveries",
                        o.id,
                        OBSERVER_FAILURE_THRESHOLD
                    );
                    FeedbackOutcome::Removed(self.observers.remove(idx))
                } else {
                    o.failed_comm_count += 1;
                    o.force_high_qos = true;
                    log::debug!(
                        "observer {} delivery failed ({}/{})",
                        o.id,
                        o.failed_comm_count,
                        OBSERVER_FAILURE_THRESHOLD
                    );
                    FeedbackOutcome::Retained
                }
            }
        }
    }

    /// Message type for the next notification to `token` at `qos`, updating
    /// the non-confirmable streak.
    pub fn notification_type(&mut self, token: &Token, qos: Qos) -> MessageType {
        let Some(o) = self.observers.iter_mut().find(|o| &o.token == token) else {
            return MessageType::NonConfirmable;
        };
        let confirmable =
            qos == Qos::High || o.force_high_qos || o.non_count >= MAX_OBSERVER_NON_COUNT;
        if confirmable {
            o.non_count = 0;
            MessageType::Confirmable
        } else {
            o.non_count += 1;
            MessageType::NonConfirmable
        }
    }

    /// Remove every observer whose subscriber is `peer`.
    pub fn evict_peer(&mut self, peer: &Endpoint) -> Vec<Observer> {
        let (gone, kept) = std::mem::take(&mut self.observers)
            .into_iter()
            .partition(|o| o.endpoint.same_peer(peer));
        self.observers = kept;
        gone
    }

    /// Remove every observer of `resource`.
    pub fn remove_resource(&mut self, resource: ResourceHandle) -> Vec<Observer> {
        let (gone, kept) = std::mem::take(&mut self.observers)
            .into_iter()
            .partition(|o| o.resource == resource);
        self.observers = kept;
        gone
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observer> {
        self.observers.iter()
    }
}
