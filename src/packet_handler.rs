use std::pin::Pin;

use futures::Stream;
use tokio::sync::mpsc::UnboundedSender;

use crate::msg::Message;

/// Channel for messages that are not direct replies to the packet being handled: separate
/// responses, Observe notifications and retransmissions.  The server drains it onto the
/// binding.
pub type Relay<Endpoint> = UnboundedSender<(Message, Endpoint)>;

/// "Low-level" raw message handler.  This is little more than a callback informing the
/// handler that a decoded message has arrived, allowing for an arbitrary number of replies
/// to be delivered back to the sending Endpoint.
///
/// Most customers should steer clear of this footgun.  It can be used in such a way that
/// breaks protocol norms and could confuse clients easily.  Prefer [`crate::app::new`] instead.
pub trait PacketHandler<Endpoint>: Clone {
    fn handle<'a>(
        &'a self,
        message: Message,
        peer: Endpoint,
    ) -> Pin<Box<dyn Stream<Item = Message> + Send + 'a>>;
}

pub trait IntoHandler<Handler, Endpoint>
where
    Handler: PacketHandler<Endpoint> + Send + 'static,
{
    fn into_handler(self, mtu: Option<u32>, relay: Relay<Endpoint>) -> Handler;
}

impl<Handler, Endpoint> IntoHandler<Handler, Endpoint> for Handler
where
    Handler: PacketHandler<Endpoint> + Send + 'static,
{
    fn into_handler(self, _mtu: Option<u32>, _relay: Relay<Endpoint>) -> Handler {
        self
    }
}
