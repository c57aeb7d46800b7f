use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use coap_lite::link_format::{LINK_ATTR_CONTENT_FORMAT, LINK_ATTR_OBSERVABLE};
use dyn_clone::DynClone;
use futures::future::BoxFuture;

use crate::app::core_link::{LinkAttributeValue, LinkAttributes};
use crate::app::{Request, Response};
use crate::msg::option::{content_format, content_format_number};
use crate::msg::{ContentFormat, ResponseType};

/// Observe sequence numbers wrap at this value rather than at the 24 bit option limit.
pub const OBSERVE_SEQUENCE_MODULUS: u32 = 65000;

/// Number of ETags remembered per resource.
const ETAG_HISTORY: usize = 8;

/// Data half of a resource: representations, validators and discovery metadata.  The
/// dispatcher owns the authoritative copy inside the resource tree and hands handlers a
/// snapshot; handlers return a modified copy to apply a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState {
    path: String,
    content: BTreeMap<u16, Vec<u8>>,
    default_format: Option<u16>,
    etags: Vec<Vec<u8>>,
    version: u32,
    attributes: LinkAttributes,
    max_age: Option<u32>,
    observable: bool,
    allow_children: bool,
    visible: bool,
    observe_sequence: u32,
}

impl ResourceState {
    pub fn new(path: &str) -> Self {
        Self {
            path: normalize_path(path),
            content: BTreeMap::new(),
            default_format: None,
            etags: Vec::new(),
            version: 0,
            attributes: LinkAttributes::new(),
            max_age: None,
            observable: false,
            allow_children: false,
            visible: true,
            observe_sequence: 1,
        }
    }

    /// Normalized path without leading or trailing slashes.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn set_path(&mut self, path: &str) {
        self.path = normalize_path(path);
    }

    /// Replaces every representation with a single one and issues a new ETag.
    pub fn set_payload(&mut self, format: ContentFormat, payload: Vec<u8>) {
        self.content.clear();
        self.add_representation(format, payload);
    }

    /// Adds or replaces the representation for one content format and issues a new ETag.
    pub fn add_representation(&mut self, format: ContentFormat, payload: Vec<u8>) {
        let number = content_format_number(format);
        if self.default_format.is_none() || self.content.is_empty() {
            self.default_format = Some(number);
        }
        self.content.insert(number, payload);
        self.bump_etag();
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.representation(None).map(|(_, payload)| payload)
    }

    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    pub fn formats(&self) -> impl Iterator<Item = ContentFormat> + '_ {
        self.content.keys().filter_map(|number| content_format(*number))
    }

    /// Representation for an Accept option, or the default one if `accept` is `None`.
    pub fn representation(&self, accept: Option<ContentFormat>) -> Option<(ContentFormat, &[u8])> {
        let number = accept.map(content_format_number).or(self.default_format)?;
        let payload = self.content.get(&number)?;
        Some((content_format(number)?, payload.as_slice()))
    }

    /// Current entity tag, if the resource has a representation.
    pub fn etag(&self) -> Option<&[u8]> {
        self.etags.last().map(|etag| etag.as_slice())
    }

    /// Recent entity tags, oldest first.
    pub fn etag_history(&self) -> &[Vec<u8>] {
        &self.etags
    }

    fn bump_etag(&mut self) {
        self.version = self.version.wrapping_add(1);
        self.etags.push(self.version.to_be_bytes().to_vec());
        if self.etags.len() > ETAG_HISTORY {
            self.etags.remove(0);
        }
    }

    pub fn attributes(&self) -> &LinkAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut LinkAttributes {
        &mut self.attributes
    }

    pub fn set_attr(&mut self, key: &str, value: impl LinkAttributeValue + 'static) {
        self.attributes.attr(key, value);
    }

    pub fn max_age(&self) -> Option<u32> {
        self.max_age
    }

    pub fn set_max_age(&mut self, seconds: u32) {
        self.max_age = Some(seconds);
    }

    pub fn is_observable(&self) -> bool {
        self.observable
    }

    pub fn set_observable(&mut self, observable: bool) {
        self.observable = observable;
        if observable {
            self.attributes.attr(LINK_ATTR_OBSERVABLE, ());
        } else {
            self.attributes.remove(LINK_ATTR_OBSERVABLE);
        }
    }

    pub fn allows_children(&self) -> bool {
        self.allow_children
    }

    pub fn set_allow_children(&mut self, allow_children: bool) {
        self.allow_children = allow_children;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn set_content_format_attr(&mut self, format: ContentFormat) {
        self.attributes.attr(LINK_ATTR_CONTENT_FORMAT, format);
    }

    pub fn observe_sequence(&self) -> u32 {
        self.observe_sequence
    }

    pub(crate) fn bump_observe_sequence(&mut self) -> u32 {
        self.observe_sequence = (self.observe_sequence + 1) % OBSERVE_SEQUENCE_MODULUS;
        self.observe_sequence
    }

    /// Carries over the fields the tree manages itself when a handler hands back a new state.
    pub(crate) fn adopt_managed_fields(&mut self, current: &ResourceState) {
        self.path = current.path.clone();
        self.observe_sequence = current.observe_sequence;
    }
}

pub(crate) fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// What a resource handler wants the dispatcher to do with a request.
pub enum Render<Endpoint: Send + Sync + 'static> {
    /// Success: serve (GET) or store (PUT/POST/DELETE) this state.
    Resource(ResourceState),
    /// POST created a new child resource with its own handler.
    Created(ResourceState, Box<dyn Resource<Endpoint>>),
    /// Reject (or accept without a body) with a bare status code.
    Status(ResponseType),
    /// Fully populated response, typically built with [`Request::new_response`].
    Response(Response),
    /// The work will take a while: acknowledge now, respond when the future completes.
    Separate(BoxFuture<'static, Render<Endpoint>>),
    /// The method is not implemented by this resource (4.05).
    Unsupported,
}

impl<Endpoint: Send + Sync + 'static> fmt::Debug for Render<Endpoint> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Render::Resource(state) => f.debug_tuple("Resource").field(&state.path).finish(),
            Render::Created(state, _) => f.debug_tuple("Created").field(&state.path).finish(),
            Render::Status(code) => f.debug_tuple("Status").field(code).finish(),
            Render::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Render::Separate(_) => f.write_str("Separate"),
            Render::Unsupported => f.write_str("Unsupported"),
        }
    }
}

/// Behaviour half of a resource.  Every method defaults to [`Render::Unsupported`].
#[async_trait]
pub trait Resource<Endpoint: Send + Sync + 'static>: DynClone + Send + Sync + 'static {
    async fn render_get(&self, _request: &Request<Endpoint>, _state: &ResourceState) -> Render<Endpoint> {
        Render::Unsupported
    }

    async fn render_put(&self, _request: &Request<Endpoint>, _state: &ResourceState) -> Render<Endpoint> {
        Render::Unsupported
    }

    async fn render_post(&self, _request: &Request<Endpoint>, _state: &ResourceState) -> Render<Endpoint> {
        Render::Unsupported
    }

    async fn render_delete(&self, _request: &Request<Endpoint>, _state: &ResourceState) -> Render<Endpoint> {
        Render::Unsupported
    }
}

dyn_clone::clone_trait_object!(<Endpoint> Resource<Endpoint> where Endpoint: Send + Sync + 'static);

/// Plain storage resource: GET serves the stored representation, PUT replaces it, POST either
/// updates it or creates a child of the same kind, DELETE removes it.
#[derive(Debug, Clone, Default)]
pub struct BasicResource;

#[async_trait]
impl<Endpoint: Send + Sync + 'static> Resource<Endpoint> for BasicResource {
    async fn render_get(&self, _request: &Request<Endpoint>, state: &ResourceState) -> Render<Endpoint> {
        Render::Resource(state.clone())
    }

    async fn render_put(&self, request: &Request<Endpoint>, state: &ResourceState) -> Render<Endpoint> {
        let mut updated = state.clone();
        let format = request
            .original
            .get_content_format()
            .unwrap_or(ContentFormat::TextPlain);
        updated.set_payload(format, request.original.payload.clone());
        Render::Resource(updated)
    }

    async fn render_post(&self, request: &Request<Endpoint>, state: &ResourceState) -> Render<Endpoint> {
        let format = request
            .original
            .get_content_format()
            .unwrap_or(ContentFormat::TextPlain);
        if request.unmatched_path.is_empty() {
            let mut updated = state.clone();
            updated.set_payload(format, request.original.payload.clone());
            return Render::Resource(updated);
        }
        let mut child = ResourceState::new(&request.path());
        child.set_payload(format, request.original.payload.clone());
        child.set_observable(state.is_observable());
        Render::Created(child, Box::new(self.clone()))
    }

    async fn render_delete(&self, _request: &Request<Endpoint>, state: &ResourceState) -> Render<Endpoint> {
        Render::Resource(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_tracks_changes() {
        let mut state = ResourceState::new("/sensors/temp/");
        assert_eq!(state.path(), "sensors/temp");
        assert_eq!(state.etag(), None);

        state.set_payload(ContentFormat::TextPlain, b"21".to_vec());
        let first = state.etag().unwrap().to_vec();
        state.set_payload(ContentFormat::TextPlain, b"22".to_vec());
        assert_ne!(state.etag().unwrap(), first.as_slice());
        assert_eq!(state.etag_history().len(), 2);
        assert_eq!(state.payload(), Some(&b"22"[..]));
    }

    #[test]
    fn test_content_negotiation() {
        let mut state = ResourceState::new("a");
        state.set_payload(ContentFormat::TextPlain, b"1".to_vec());
        state.add_representation(ContentFormat::ApplicationJSON, b"{\"v\":1}".to_vec());

        assert_eq!(state.representation(None).unwrap().0, ContentFormat::TextPlain);
        assert_eq!(
            state.representation(Some(ContentFormat::ApplicationJSON)).unwrap().1,
            b"{\"v\":1}"
        );
        assert!(state.representation(Some(ContentFormat::ApplicationXML)).is_none());
    }

    #[test]
    fn test_observe_sequence_wraps() {
        let mut state = ResourceState::new("a");
        state.observe_sequence = OBSERVE_SEQUENCE_MODULUS - 1;
        assert_eq!(state.bump_observe_sequence(), 0);
        assert_eq!(state.bump_observe_sequence(), 1);
    }
}
