// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Payload documents and the codec seam.
//
// The engine only needs three document kinds: resource representations,
// presence announcements and discovery link lists. Encoding is delegated to
// a `PayloadCodec`; `JsonCodec` is the stock implementation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::message::ContentFormat;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Resource representation. Collections nest member representations in
/// `children`, in the order they were contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RepPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, rename = "rt", skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<String>,
    #[serde(default, rename = "if", skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
    #[serde(default, rename = "rep", skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RepPayload>,
}

impl RepPayload {
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Default::default()
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Merge member documents into one batch document for `request_uri`.
    ///
    /// If the first part already describes `request_uri` it becomes the
    /// root and the rest are appended under it; otherwise a new container
    /// level for `request_uri` is prepended above all parts.
    pub fn batch(request_uri: &str, parts: Vec<RepPayload>) -> RepPayload {
        let mut parts = parts.into_iter();
        match parts.next() {
            Some(first) if first.uri.as_deref() == Some(request_uri) => {
                let mut root = first;
                root.children.extend(parts);
                root
            }
            Some(first) => {
                let mut root = RepPayload::with_uri(request_uri);
                root.children.push(first);
                root.children.extend(parts);
                root
            }
            None => RepPayload::with_uri(request_uri),
        }
    }
}

/// Why a presence announcement was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceTrigger {
    Create,
    Change,
    Delete,
}

/// Presence announcement. `max_age == 0` means the peer stopped presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    #[serde(rename = "non")]
    pub sequence_number: u32,
    #[serde(rename = "ttl")]
    pub max_age: u32,
    #[serde(rename = "trg")]
    pub trigger: PresenceTrigger,
    #[serde(default, rename = "rt", skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

/// One discoverable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPayload {
    #[serde(rename = "href")]
    pub uri: String,
    #[serde(default, rename = "rt")]
    pub resource_types: Vec<String>,
    #[serde(default, rename = "if")]
    pub interfaces: Vec<String>,
    #[serde(default, rename = "obs")]
    pub observable: bool,
}

/// Discovery answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiscoveryPayload {
    pub links: Vec<LinkPayload>,
}

/// Decoded payload document.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Representation(RepPayload),
    Presence(PresencePayload),
    Discovery(DiscoveryPayload),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Representation(_) => PayloadKind::Representation,
            Self::Presence(_) => PayloadKind::Presence,
            Self::Discovery(_) => PayloadKind::Discovery,
        }
    }

    pub fn as_representation(&self) -> Option<&RepPayload> {
        match self {
            Self::Representation(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_presence(&self) -> Option<&PresencePayload> {
        match self {
            Self::Presence(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_discovery(&self) -> Option<&DiscoveryPayload> {
        match self {
            Self::Discovery(d) => Some(d),
            _ => None,
        }
    }
}

/// Expected document type when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Representation,
    Presence,
    Discovery,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Structured-document encoder/decoder.
pub trait PayloadCodec: Send {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8], kind: PayloadKind) -> Result<Payload>;

    /// Content format advertised on encoded payloads.
    fn content_format(&self) -> ContentFormat;
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>> {
        let out = match payload {
            Payload::Representation(r) => serde_json::to_vec(r),
            Payload::Presence(p) => serde_json::to_vec(p),
            Payload::Discovery(d) => serde_json::to_vec(d),
        };
        out.map_err(|e| EngineError::Malformed(format!("payload encode: {}", e)))
    }

    fn decode(&self, bytes: &[u8], kind: PayloadKind) -> Result<Payload> {
        let malformed =
            |e: serde_json::Error| EngineError::Malformed(format!("payload decode: {}", e));
        Ok(match kind {
            PayloadKind::Representation => {
                Payload::Representation(serde_json::from_slice(bytes).map_err(malformed)?)
            }
            PayloadKind::Presence => {
                Payload::Presence(serde_json::from_slice(bytes).map_err(malformed)?)
            }
            PayloadKind::Discovery => {
                Payload::Discovery(serde_json::from_slice(bytes).map_err(malformed)?)
            }
        })
    }

    fn content_format(&self) -> ContentFormat {
        ContentFormat::Json
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_reuses_matching_root() {
        let root = RepPayload::with_uri("/room").set("name", "kitchen");
        let light = RepPayload::with_uri("/room/light").set("on", true);
        let merged = RepPayload::batch("/room", vec![root, light.clone()]);
        assert_eq!(merged.uri.as_deref(), Some("/room"));
        assert_eq!(merged.values["name"], "kitchen");
        assert_eq!(merged.children, vec![light]);
    }

    #[test]
    fn test_batch_prepends_container() {
        let light = RepPayload::with_uri("/room/light");
        let fan = RepPayload::with_uri("/room/fan");
        let merged = RepPayload::batch("/room", vec![light.clone(), fan.clone()]);
        assert_eq!(merged.uri.as_deref(), Some("/room"));
        assert!(merged.values.is_empty());
        assert_eq!(merged.children, vec![light, fan]);
    }

    #[test]
    fn test_presence_decode_requires_fields() {
        let codec = JsonCodec;
        let p = Payload::Presence(PresencePayload {
            sequence_number: 9,
            max_age: 60,
            trigger: PresenceTrigger::Change,
            resource_type: None,
        });
        let bytes = codec.encode(&p).unwrap();
        assert_eq!(codec.decode(&bytes, PayloadKind::Presence).unwrap(), p);
        assert!(codec.decode(b"{\"non\":1}", PayloadKind::Presence).is_err());
        assert!(codec.decode(b"not json", PayloadKind::Representation).is_err());
    }
}
