use coap_lite::link_format::LINK_ATTR_RESOURCE_TYPE;

use crate::app::core_link::LinkAttributeValue;
use crate::app::resource::{BasicResource, Resource, ResourceState};
use crate::msg::ContentFormat;

const LINK_ATTR_INTERFACE: &str = "if";

/// Configure a single resource: its handler, initial representation and discovery metadata.
pub struct ResourceBuilder<Endpoint: Send + Sync + 'static> {
    state: ResourceState,
    handler: Box<dyn Resource<Endpoint>>,
    discoverable: Option<bool>,
}

impl<Endpoint: Send + Sync + 'static> ResourceBuilder<Endpoint> {
    pub fn new(path: &str) -> Self {
        Self {
            state: ResourceState::new(path),
            handler: Box::new(BasicResource),
            discoverable: None,
        }
    }

    /// Set the handler that renders requests for this resource.  Defaults to
    /// [`BasicResource`].
    pub fn handler(mut self, handler: impl Resource<Endpoint>) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Add a new attribute to the CoRE Link response, assuming that this resource will be
    /// discoverable.  For more information, see
    /// [RFC 6690](https://datatracker.ietf.org/doc/html/rfc6690)
    pub fn link_attr(mut self, attr_name: &str, value: impl LinkAttributeValue + 'static) -> Self {
        self.state.set_attr(attr_name, value);
        self
    }

    pub fn resource_type(self, rt: &'static str) -> Self {
        self.link_attr(LINK_ATTR_RESOURCE_TYPE, rt)
    }

    pub fn interface(self, interface: &'static str) -> Self {
        self.link_attr(LINK_ATTR_INTERFACE, interface)
    }

    /// Advertise `ct` in discovery.  Does not change the stored representation.
    pub fn content_format(mut self, format: ContentFormat) -> Self {
        self.state.set_content_format_attr(format);
        self
    }

    /// Enable Observe support for GET requests on this resource.  Notifications are triggered
    /// by mutations through the dispatcher or by [`crate::app::Notifier::notify_change`].
    ///
    /// For more information, see [RFC 7641](https://datatracker.ietf.org/doc/html/rfc7641)
    pub fn observable(mut self) -> Self {
        self.state.set_observable(true);
        self
    }

    /// Route POSTs to missing paths below this resource here, so that the handler can create
    /// them.
    pub fn allow_children(mut self) -> Self {
        self.state.set_allow_children(true);
        self
    }

    /// See [`crate::app::AppBuilder::not_discoverable`].
    pub fn not_discoverable(mut self) -> Self {
        self.discoverable = Some(false);
        self
    }

    /// See [`crate::app::AppBuilder::discoverable`].
    pub fn discoverable(mut self) -> Self {
        self.discoverable = Some(true);
        self
    }

    /// Initial representation.  May be called once per content format.
    pub fn payload(mut self, format: ContentFormat, payload: impl Into<Vec<u8>>) -> Self {
        self.state.add_representation(format, payload.into());
        self
    }

    pub fn max_age(mut self, seconds: u32) -> Self {
        self.state.set_max_age(seconds);
        self
    }

    pub(crate) fn build(mut self, default_discoverable: bool) -> (ResourceState, Box<dyn Resource<Endpoint>>) {
        self.state
            .set_visible(self.discoverable.unwrap_or(default_discoverable));
        (self.state, self.handler)
    }
}
