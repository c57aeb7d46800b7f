//! Server application layer: resources, the resource tree and the dispatcher that serves them
//! with deduplication, separate responses, Observe and block-wise transfer.

pub use app_builder::AppBuilder;
pub use app_handler::AppHandler;
pub use core_link::{LinkAttributeValue, LinkAttributes};
pub use error::CoapError;
pub use notifier::Notifier;
pub use observe_manager::{NotifyConditions, MAX_NON_NOTIFICATIONS};
pub use request::Request;
pub use resource::{BasicResource, Render, Resource, ResourceState, OBSERVE_SEQUENCE_MODULUS};
pub use resource_builder::ResourceBuilder;
pub use response::Response;

pub mod app_builder;
mod app_handler;
mod block_handler;
mod coap_utils;
mod core_handler;
mod core_link;
pub mod error;
mod notifier;
mod observe_manager;
pub mod request;
mod resource;
pub mod resource_builder;
mod resource_tree;
pub mod response;

pub fn new<Endpoint: Send + Sync + 'static>() -> AppBuilder<Endpoint> {
    AppBuilder::new()
}

pub fn resource<Endpoint: Send + Sync + 'static>(path: &str) -> ResourceBuilder<Endpoint> {
    ResourceBuilder::new(path)
}
