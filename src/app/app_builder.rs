use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::app::app_handler::AppHandler;
use crate::app::block_handler::{BlockConfig, DEFAULT_MAX_BLOCK1_PAYLOAD};
use crate::app::notifier::Notifier;
use crate::app::observe_manager::MAX_NON_NOTIFICATIONS;
use crate::app::ResourceBuilder;
use crate::exchange::TransmissionParameters;
use crate::packet_handler::{IntoHandler, Relay};

const DEFAULT_DISCOVERABLE: bool = true;
const DEFAULT_BLOCK_TRANSFER: bool = true;
const DEFAULT_SEPARATE_RESPONSE_AFTER: Duration = Duration::from_secs(1);

/// Main builder API to configure how the CoAP server should respond to requests
pub struct AppBuilder<Endpoint: Send + Sync + 'static> {
    pub(crate) config: ConfigBuilder,
    pub(crate) resources: Vec<ResourceBuilder<Endpoint>>,
    notifier: Notifier,
    pub(crate) changes_rx: UnboundedReceiver<String>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ConfigBuilder {
    pub discoverable: Option<bool>,
    pub block_transfer: Option<bool>,
    pub block_size: Option<usize>,
    pub max_block1_payload: Option<usize>,
    pub separate_response_after: Option<Duration>,
    pub max_non_notifications: Option<usize>,
    pub transmission_parameters: Option<TransmissionParameters>,
}

/// Settings resolved against defaults and the transport MTU.
#[derive(Debug, Clone)]
pub(crate) struct AppConfig {
    pub discoverable: bool,
    pub block_transfer: bool,
    pub block: BlockConfig,
    pub separate_response_after: Duration,
    pub max_non_notifications: usize,
    pub parameters: TransmissionParameters,
}

impl ConfigBuilder {
    pub(crate) fn resolve(&self, mtu: Option<u32>) -> AppConfig {
        let parameters = self.transmission_parameters.unwrap_or_default();
        let block_size = self
            .block_size
            .map(|size| size.clamp(16, 1024).next_power_of_two().min(1024))
            .unwrap_or_else(|| BlockConfig::block_size_for_mtu(mtu));
        AppConfig {
            discoverable: self.discoverable.unwrap_or(DEFAULT_DISCOVERABLE),
            block_transfer: self.block_transfer.unwrap_or(DEFAULT_BLOCK_TRANSFER),
            block: BlockConfig {
                block_size,
                max_block1_payload: self
                    .max_block1_payload
                    .unwrap_or(DEFAULT_MAX_BLOCK1_PAYLOAD),
                lifetime: parameters.exchange_lifetime(),
            },
            separate_response_after: self
                .separate_response_after
                .unwrap_or(DEFAULT_SEPARATE_RESPONSE_AFTER),
            max_non_notifications: self
                .max_non_notifications
                .unwrap_or(MAX_NON_NOTIFICATIONS),
            parameters,
        }
    }
}

impl<Endpoint: Send + Sync + 'static> Default for AppBuilder<Endpoint> {
    fn default() -> Self {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        Self {
            config: ConfigBuilder::default(),
            resources: Vec::new(),
            notifier: Notifier::new(changes_tx),
            changes_rx,
        }
    }
}

impl<Endpoint: Send + Sync + 'static> AppBuilder<Endpoint> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Enable resource discovery by default for all resources in the app.  To disable this
    /// on a per-resource level, see [`ResourceBuilder::not_discoverable`].
    ///
    /// For more information refer to [RFC 5785](https://datatracker.ietf.org/doc/html/rfc5785).
    pub fn discoverable(mut self) -> Self {
        self.config.discoverable = Some(true);
        self
    }

    /// Disable resource discovery by default for all resources in the app.  This can be
    /// overridden on a per-resource level.  When no resource is discoverable,
    /// `/.well-known/core` is not served at all.
    ///
    /// See [`AppBuilder::discoverable`].
    pub fn not_discoverable(mut self) -> Self {
        self.config.discoverable = Some(false);
        self
    }

    /// Enable block-wise transfer for the app.
    ///
    /// Block-wise transfer is a transparent handler that buffers in memory large requests or
    /// responses as they are being transferred from/to the peer, expiring after
    /// EXCHANGE_LIFETIME if the client does not gracefully exhaust the payload (e.g. if the
    /// client downloads only a portion of a large response then goes away).
    ///
    /// Handlers that set a Block2 option on their response themselves are left alone.
    ///
    /// For more information refer to [RFC 7959](https://datatracker.ietf.org/doc/html/rfc7959).
    pub fn block_transfer(mut self) -> Self {
        self.config.block_transfer = Some(true);
        self
    }

    /// Disable block-wise transfer for the app.
    ///
    /// See [`AppBuilder::block_transfer`].
    pub fn disable_block_transfer(mut self) -> Self {
        self.config.block_transfer = Some(false);
        self
    }

    /// Preferred Block2 size, rounded to a power of two between 16 and 1024.  Defaults to the
    /// largest size that fits the transport MTU.
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.config.block_size = Some(bytes);
        self
    }

    /// Largest request body accepted through Block1 reassembly.  Larger transfers fail with
    /// 4.13 Request Entity Too Large.
    pub fn max_block1_payload(mut self, bytes: usize) -> Self {
        self.config.max_block1_payload = Some(bytes);
        self
    }

    /// How long a Confirmable request may wait on its handler before it is acknowledged with
    /// an empty ACK and the response is sent separately.
    pub fn separate_response_after(mut self, delay: Duration) -> Self {
        self.config.separate_response_after = Some(delay);
        self
    }

    /// Consecutive Non-confirmable notifications after which one is sent Confirmable.
    pub fn max_non_notifications(mut self, count: usize) -> Self {
        self.config.max_non_notifications = Some(count);
        self
    }

    pub fn transmission_parameters(mut self, parameters: TransmissionParameters) -> Self {
        self.config.transmission_parameters = Some(parameters);
        self
    }

    /// Handle for reporting resource changes that happen outside of CoAP requests, so that
    /// observers are notified.
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Add a resource to the app by the configured path.
    pub fn resource(mut self, resource: ResourceBuilder<Endpoint>) -> Self {
        self.resources.push(resource);
        self
    }

    /// Convenience method to add multiple resources at once.
    pub fn resources(mut self, resources: Vec<ResourceBuilder<Endpoint>>) -> Self {
        self.resources.extend(resources);
        self
    }
}

impl<Endpoint> IntoHandler<AppHandler<Endpoint>, Endpoint> for AppBuilder<Endpoint>
where
    Endpoint: Debug + Clone + Eq + Hash + Send + Sync + 'static,
{
    fn into_handler(self, mtu: Option<u32>, relay: Relay<Endpoint>) -> AppHandler<Endpoint> {
        AppHandler::from_builder(self, mtu, relay)
    }
}
