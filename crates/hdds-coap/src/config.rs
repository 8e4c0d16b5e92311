// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration:
//!
//! ```toml
//! mode = "client_server"
//! token_length = 8
//! presence_default_ttl_secs = 60
//!
//! [routing]
//! mode = "endpoint"
//! gateway_id = 42
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::message::MAX_TOKEN_LEN;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which roles the engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Issues requests only; inbound requests are ignored.
    Client,
    /// Serves resources only; unmatched responses are not reset.
    Server,
    #[default]
    ClientServer,
    /// Client and server, forwarding between routed segments.
    Gateway,
}

impl EngineMode {
    pub fn accepts_requests(self) -> bool {
        !matches!(self, Self::Client)
    }

    pub fn accepts_responses(self) -> bool {
        !matches!(self, Self::Server)
    }
}

/// Multi-hop routing role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    #[default]
    Disabled,
    /// Leaf node behind a gateway.
    Endpoint,
    Gateway,
}

/// Route option settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub mode: RoutingMode,

    /// This node's gateway id, written as the source of outbound options.
    #[serde(default)]
    pub gateway_id: u32,
}

/// Configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: EngineMode,

    #[serde(default)]
    pub routing: RoutingConfig,

    /// Length of generated tokens (default: 8).
    #[serde(default = "default_token_length")]
    pub token_length: usize,

    /// Lifetime of one-shot client transactions (default: 7200 s).
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_secs: u32,

    /// Presence TTL used when `start_presence(0)` is called (default: 60 s).
    #[serde(default = "default_presence_ttl")]
    pub presence_default_ttl_secs: u32,

    /// Upper clamp for presence TTL (default: 86400 s).
    #[serde(default = "default_presence_max_ttl")]
    pub presence_max_ttl_secs: u32,

    /// Requests carrying more options are answered with 4.02 (default: 50).
    #[serde(default = "default_max_header_options")]
    pub max_header_options: usize,

    #[serde(default = "default_max_uri_length")]
    pub max_uri_length: usize,

    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,

    /// Observation ids are one byte (default: 255).
    #[serde(default = "default_max_observers")]
    pub max_observers: usize,
}

fn default_token_length() -> usize {
    MAX_TOKEN_LEN
}

fn default_transaction_timeout() -> u32 {
    7200
}

fn default_presence_ttl() -> u32 {
    60
}

fn default_presence_max_ttl() -> u32 {
    60 * 60 * 24
}

fn default_max_header_options() -> usize {
    50
}

fn default_max_uri_length() -> usize {
    256
}

fn default_max_query_length() -> usize {
    256
}

fn default_max_observers() -> usize {
    255
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::default(),
            routing: RoutingConfig::default(),
            token_length: default_token_length(),
            transaction_timeout_secs: default_transaction_timeout(),
            presence_default_ttl_secs: default_presence_ttl(),
            presence_max_ttl_secs: default_presence_max_ttl(),
            max_header_options: default_max_header_options(),
            max_uri_length: default_max_uri_length(),
            max_query_length: default_max_query_length(),
            max_observers: default_max_observers(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Client-only engine with defaults.
    pub fn client() -> Self {
        Self {
            mode: EngineMode::Client,
            ..Default::default()
        }
    }

    /// Server-only engine with defaults.
    pub fn server() -> Self {
        Self {
            mode: EngineMode::Server,
            ..Default::default()
        }
    }

    /// Validate configuration. Returns Ok(()) if valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_length == 0 || self.token_length > MAX_TOKEN_LEN {
            return Err(ConfigError::Invalid(format!(
                "token_length must be in 1..={}",
                MAX_TOKEN_LEN
            )));
        }
        if self.transaction_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transaction_timeout_secs must be > 0".into(),
            ));
        }
        if self.presence_default_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "presence_default_ttl_secs must be > 0".into(),
            ));
        }
        if self.presence_max_ttl_secs < self.presence_default_ttl_secs {
            return Err(ConfigError::Invalid(
                "presence_max_ttl_secs must be >= presence_default_ttl_secs".into(),
            ));
        }
        if self.max_header_options == 0 {
            return Err(ConfigError::Invalid(
                "max_header_options must be > 0".into(),
            ));
        }
        if self.max_uri_length == 0 || self.max_query_length == 0 {
            return Err(ConfigError::Invalid(
                "URI and query limits must be > 0".into(),
            ));
        }
        // observation ids are u8
        if self.max_observers == 0 || self.max_observers > 255 {
            return Err(ConfigError::Invalid(
                "max_observers must be in 1..=255".into(),
            ));
        }
        if self.routing.mode != RoutingMode::Disabled && self.routing.gateway_id == 0 {
            return Err(ConfigError::Invalid(
                "routing.gateway_id must be non-zero when routing is enabled".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.token_length, 8);
        assert_eq!(config.presence_max_ttl_secs, 86_400);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            EngineConfig {
                token_length: 0,
                ..Default::default()
            },
            EngineConfig {
                token_length: 9,
                ..Default::default()
            },
            EngineConfig {
                presence_max_ttl_secs: 10,
                ..Default::default()
            },
            EngineConfig {
                max_observers: 300,
                ..Default::default()
            },
            EngineConfig {
                routing: RoutingConfig {
                    mode: RoutingMode::Gateway,
                    gateway_id: 0,
                },
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "mode = \"server\"\ntoken_length = 4\n\n[routing]\nmode = \"endpoint\"\ngateway_id = 42"
        )
        .unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.mode, EngineMode::Server);
        assert_eq!(config.token_length, 4);
        assert_eq!(config.routing.mode, RoutingMode::Endpoint);
        assert_eq!(config.routing.gateway_id, 42);
        assert_eq!(config.transaction_timeout_secs, 7200);
    }

    #[test]
    fn test_from_toml_validates() {
        assert!(matches!(
            EngineConfig::from_toml("token_length = 12"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml("mode = 3"),
            Err(ConfigError::Toml(_))
        ));
    }
}
