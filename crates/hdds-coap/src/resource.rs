// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Resource table and the entity handler seam.
//
// A plain record store. Presence side effects of lifecycle changes live in
// the engine, which wraps these operations.

use std::fmt;

use crate::error::{EngineError, Result};
use crate::message::{Endpoint, HeaderOption, Method, BASELINE_INTERFACE};
use crate::observe::{ObservationId, ObserveAction, SEQUENCE_NUMBER_OFFSET};
use crate::payload::Payload;
use crate::result::EntityResult;
use crate::server::RequestId;

/// Stable handle of a resource record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(u32);

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res#{}", self.0)
    }
}

/// Resource property flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceProperties {
    pub discoverable: bool,
    pub observable: bool,
    pub active: bool,
    /// Handler answers asynchronously.
    pub slow: bool,
    pub secure: bool,
}

impl Default for ResourceProperties {
    fn default() -> Self {
        Self {
            discoverable: true,
            observable: false,
            active: true,
            slow: false,
            secure: false,
        }
    }
}

impl ResourceProperties {
    pub fn observable() -> Self {
        Self {
            observable: true,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Entity handler
// ---------------------------------------------------------------------------

/// Which parts of an entity request are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerFlags {
    /// A request to answer.
    pub request: bool,
    /// An observe registration or deregistration.
    pub observe: bool,
}

/// Observe information attached to an entity request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveInfo {
    pub action: ObserveAction,
    pub id: ObservationId,
}

/// What an entity handler is asked.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRequest {
    /// Answer slow requests through `Engine::respond` with this id. `None`
    /// for engine-synthesised requests such as deregistrations.
    pub request_id: Option<RequestId>,
    /// `None` when the request reached the default device handler.
    pub resource: Option<ResourceHandle>,
    /// Request path without the query.
    pub uri: String,
    pub method: Method,
    pub query: Option<String>,
    pub payload: Option<Payload>,
    pub endpoint: Endpoint,
    pub options: Vec<HeaderOption>,
    pub observe: Option<ObserveInfo>,
}

/// Response produced by an entity handler.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityResponse {
    pub result: EntityResult,
    pub payload: Option<Payload>,
    pub options: Vec<HeaderOption>,
    /// Collection member answering late; names its part of the batch.
    pub resource: Option<ResourceHandle>,
}

impl EntityResponse {
    pub fn ok(payload: Payload) -> Self {
        Self {
            result: EntityResult::Ok,
            payload: Some(payload),
            options: Vec::new(),
            resource: None,
        }
    }

    pub fn with_result(result: EntityResult) -> Self {
        Self {
            result,
            payload: None,
            options: Vec::new(),
            resource: None,
        }
    }

    pub fn from_resource(mut self, resource: ResourceHandle) -> Self {
        self.resource = Some(resource);
        self
    }
}

/// Reply to an entity request.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityReply {
    Respond(EntityResponse),
    /// The answer comes later via `Engine::respond(request_id, ..)`.
    Slow,
    Error(EntityResult),
}

/// Produces payloads for a resource.
pub trait EntityHandler: Send {
    fn handle(&mut self, flags: HandlerFlags, request: &EntityRequest) -> EntityReply;
}

impl<F> EntityHandler for F
where
    F: FnMut(HandlerFlags, &EntityRequest) -> EntityReply + Send,
{
    fn handle(&mut self, flags: HandlerFlags, request: &EntityRequest) -> EntityReply {
        self(flags, request)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One resource.
pub struct Resource {
    pub handle: ResourceHandle,
    pub uri: String,
    pub resource_types: Vec<String>,
    pub interfaces: Vec<String>,
    pub properties: ResourceProperties,
    pub children: Vec<ResourceHandle>,
    /// Observe sequence number of the last notification.
    pub sequence_number: u32,
    handler: Option<Box<dyn EntityHandler>>,
}

impl Resource {
    pub fn is_collection(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Call the handler, if any.
    pub fn dispatch(
        &mut self,
        flags: HandlerFlags,
        request: &EntityRequest,
    ) -> Option<EntityReply> {
        self.handler.as_mut().map(|h| h.handle(flags, request))
    }

    pub fn supports_interface(&self, interface: &str) -> bool {
        interface == BASELINE_INTERFACE || self.interfaces.iter().any(|i| i == interface)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("handle", &self.handle)
            .field("uri", &self.uri)
            .field("resource_types", &self.resource_types)
            .field("interfaces", &self.interfaces)
            .field("properties", &self.properties)
            .field("children", &self.children)
            .field("sequence_number", &self.sequence_number)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Parameters for a new resource.
pub struct ResourceSpec {
    pub uri: String,
    pub resource_type: String,
    pub interface: String,
    pub properties: ResourceProperties,
    pub handler: Option<Box<dyn EntityHandler>>,
}

impl ResourceSpec {
    pub fn new(uri: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            resource_type: resource_type.into(),
            interface: BASELINE_INTERFACE.to_string(),
            properties: ResourceProperties::default(),
            handler: None,
        }
    }

    pub fn properties(mut self, properties: ResourceProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    pub fn handler(mut self, handler: impl EntityHandler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }
}

/// Ordered resource records.
#[derive(Debug, Default)]
pub struct ResourceTable {
    resources: Vec<Resource>,
    next_handle: u32,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, spec: ResourceSpec) -> Result<ResourceHandle> {
        if spec.uri.is_empty() || !spec.uri.starts_with('/') {
            return Err(EngineError::InvalidParameter(format!(
                "resource URI must start with '/': {:?}",
                spec.uri
            )));
        }
        if spec.resource_type.is_empty() {
            return Err(EngineError::InvalidParameter("empty resource type".into()));
        }
        if self.find_by_uri(&spec.uri).is_some() {
            return Err(EngineError::InvalidParameter(format!(
                "resource {} already exists",
                spec.uri
            )));
        }
        self.next_handle = self
            .next_handle
            .checked_add(1)
            .ok_or_else(|| EngineError::ResourceExhausted("resource handles".into()))?;
        let handle = ResourceHandle(self.next_handle);
        let mut interfaces = vec![BASELINE_INTERFACE.to_string()];
        if spec.interface != BASELINE_INTERFACE && !spec.interface.is_empty() {
            interfaces.push(spec.interface);
        }
        self.resources.push(Resource {
            handle,
            uri: spec.uri,
            resource_types: vec![spec.resource_type],
            interfaces,
            properties: spec.properties,
            children: Vec::new(),
            sequence_number: SEQUENCE_NUMBER_OFFSET,
            handler: spec.handler,
        });
        Ok(handle)
    }

    /// Remove a resource and unbind it from every collection.
    pub fn delete(&mut self, handle: ResourceHandle) -> Result<Resource> {
        let idx = self
            .resources
            .iter()
            .position(|r| r.handle == handle)
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))?;
        let removed = self.resources.remove(idx);
        for r in &mut self.resources {
            r.children.retain(|c| *c != handle);
        }
        Ok(removed)
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&Resource> {
        self.resources.iter().find(|r| r.handle == handle)
    }

    pub fn get_mut(&mut self, handle: ResourceHandle) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.handle == handle)
    }

    pub fn find_by_uri(&self, uri: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.uri == uri)
    }

    pub fn bind_type(&mut self, handle: ResourceHandle, resource_type: &str) -> Result<()> {
        let r = self.require_mut(handle)?;
        if !r.resource_types.iter().any(|t| t == resource_type) {
            r.resource_types.push(resource_type.to_string());
        }
        Ok(())
    }

    pub fn bind_interface(&mut self, handle: ResourceHandle, interface: &str) -> Result<()> {
        let r = self.require_mut(handle)?;
        if !r.interfaces.iter().any(|i| i == interface) {
            r.interfaces.push(interface.to_string());
        }
        Ok(())
    }

    /// Make `child` a member of collection `parent`.
    pub fn bind_child(&mut self, parent: ResourceHandle, child: ResourceHandle) -> Result<()> {
        if parent == child {
            return Err(EngineError::InvalidParameter("resource bound to itself".into()));
        }
        self.require(child)?;
        let p = self.require_mut(parent)?;
        if p.children.contains(&child) {
            return Err(EngineError::InvalidParameter(format!(
                "{} already bound to {}",
                child, parent
            )));
        }
        p.children.push(child);
        Ok(())
    }

    pub fn unbind_child(&mut self, parent: ResourceHandle, child: ResourceHandle) -> Result<()> {
        let p = self.require_mut(parent)?;
        let before = p.children.len();
        p.children.retain(|c| *c != child);
        if p.children.len() == before {
            return Err(EngineError::NotFound(format!("{} in {}", child, parent)));
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn require(&self, handle: ResourceHandle) -> Result<&Resource> {
        self.get(handle)
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))
    }

    fn require_mut(&mut self, handle: ResourceHandle) -> Result<&mut Resource> {
        self.get_mut(handle)
            .ok_or_else(|| EngineError::NotFound(handle.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_find() {
        let mut table = ResourceTable::new();
        let h = table.create(ResourceSpec::new("/light", "oic.r.light")).unwrap();
        let r = table.find_by_uri("/light").unwrap();
        assert_eq!(r.handle, h);
        assert_eq!(r.sequence_number, SEQUENCE_NUMBER_OFFSET);
        assert!(r.supports_interface(BASELINE_INTERFACE));
        assert!(table.create(ResourceSpec::new("/light", "x")).is_err());
        assert!(table.create(ResourceSpec::new("light", "x")).is_err());
    }

    #[test]
    fn test_children_unbound_on_delete() {
        let mut table = ResourceTable::new();
        let room = table.create(ResourceSpec::new("/room", "oic.wk.col")).unwrap();
        let lamp = table.create(ResourceSpec::new("/room/lamp", "oic.r.light")).unwrap();
        table.bind_child(room, lamp).unwrap();
        assert!(table.bind_child(room, lamp).is_err());
        assert!(table.get(room).unwrap().is_collection());
        table.delete(lamp).unwrap();
        assert!(!table.get(room).unwrap().is_collection());
        assert!(table.unbind_child(room, lamp).is_err());
    }

    #[test]
    fn test_handler_dispatch() {
        use crate::payload::RepPayload;

        let mut table = ResourceTable::new();
        let h = table
            .create(ResourceSpec::new("/temp", "oic.r.temperature").handler(
                |_f: HandlerFlags, req: &EntityRequest| {
                    EntityReply::Respond(EntityResponse::ok(Payload::Representation(
                        RepPayload::with_uri(req.uri.clone()).set("t", 21),
                    )))
                },
            ))
            .unwrap();
        let bare = table.create(ResourceSpec::new("/bare", "x")).unwrap();
        let request = EntityRequest {
            request_id: None,
            resource: Some(h),
            uri: "/temp".into(),
            method: Method::Get,
            query: None,
            payload: None,
            endpoint: Endpoint::ip("10.0.0.1", 5683),
            options: Vec::new(),
            observe: None,
        };
        let flags = HandlerFlags {
            request: true,
            observe: false,
        };
        let reply = table.get_mut(h).unwrap().dispatch(flags, &request).unwrap();
        let EntityReply::Respond(response) = reply else {
            panic!("expected a response");
        };
        let rep = response.payload.unwrap();
        let rep = rep.as_representation().unwrap();
        assert_eq!(rep.uri.as_deref(), Some("/temp"));
        assert_eq!(rep.values["t"], 21);
        assert!(table.get_mut(bare).unwrap().dispatch(flags, &request).is_none());
    }
}
