// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Route option strategy.
//
// Chosen once from configuration. `NoRouting` leaves messages untouched;
// `OptionRouting` tags every outbound message and strips/interprets the
// option on every inbound one.

use crate::config::{RoutingConfig, RoutingMode};
use crate::error::Result;
use crate::message::{Endpoint, HeaderOption};
use crate::route::{self, RouteAddress, RouteAddressing, RouteKind, RouteOption};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStrategy {
    NoRouting,
    OptionRouting { gateway_id: u32, mode: RoutingMode },
}

impl RouteStrategy {
    pub fn from_config(config: &RoutingConfig) -> Self {
        match config.mode {
            RoutingMode::Disabled => Self::NoRouting,
            mode => Self::OptionRouting {
                gateway_id: config.gateway_id,
                mode,
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::OptionRouting { .. })
    }

    /// Leaf endpoints send empty ACK/RESET as a gateway POST carrying the
    /// message kind in the route option.
    pub fn disguises_empty(&self) -> bool {
        matches!(
            self,
            Self::OptionRouting {
                mode: RoutingMode::Endpoint,
                ..
            }
        )
    }

    /// Attach the route option for an outbound message. The endpoint's
    /// routed address becomes the destination and is cleared.
    pub fn tag_outbound(
        &self,
        endpoint: &mut Endpoint,
        options: &mut Vec<HeaderOption>,
        kind: RouteKind,
    ) {
        let Self::OptionRouting { gateway_id, .. } = *self else {
            return;
        };
        let option = RouteOption {
            kind,
            addressing: Some(RouteAddressing {
                destination: endpoint.route.take(),
                source: Some(RouteAddress::gateway(gateway_id)),
                mcast_seq: 0,
            }),
        };
        route::insert_into(options, &option);
    }

    /// Interpret and strip the route option of an inbound message.
    ///
    /// The option's source becomes `endpoint.route`. Messages without an
    /// option are `Normal`. A malformed option is an error; the caller must
    /// reject the whole message.
    pub fn extract_inbound(
        &self,
        endpoint: &mut Endpoint,
        options: &mut Vec<HeaderOption>,
    ) -> Result<RouteKind> {
        if !self.is_enabled() {
            return Ok(RouteKind::Normal);
        }
        let Some(parsed) = route::find_in(options) else {
            return Ok(RouteKind::Normal);
        };
        let option = parsed?;
        route::strip_from(options);
        if let Some(source) = option.source() {
            endpoint.route = Some(source);
        }
        Ok(option.kind)
    }
}
