// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine error taxonomy.
//!
//! These errors are returned to the immediate caller of an engine operation.
//! Results delivered to application callbacks use [`StackResult`] instead.
//!
//! [`StackResult`]: crate::result::StackResult

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Errors produced by the engine and its registries.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required field was empty, zero-length or out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Input bytes could not be decoded.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// No registry entry matches the given token or handle.
    #[error("not found: {0}")]
    NotFound(String),

    /// A bounded table is full or an identifier space is used up.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Method or payload type not recognised in this context.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Propagated from the transport layer.
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
