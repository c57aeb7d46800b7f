use std::fmt::Debug;

use futures::stream::Fuse;
use futures::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::msg::{codec, Message};
use crate::packet_handler::{IntoHandler, PacketHandler};
use crate::transport::{
    BoxedFramedBinding, FramedItem, FramedReadError, Transport, TransportError,
};

/// Primary server API to configure, bind, and ultimately run the CoAP server.
pub struct CoapServer<Handler, Endpoint> {
    binding: Fuse<BoxedFramedBinding<Endpoint>>,
    packet_relay_rx: UnboundedReceiver<(Message, Endpoint)>,
    packet_relay_tx: UnboundedSender<(Message, Endpoint)>,
    handler: Option<Handler>,
}

impl<Handler, Endpoint: Debug + Send + Clone + 'static> CoapServer<Handler, Endpoint>
where
    Handler: PacketHandler<Endpoint> + Send + 'static,
{
    /// Bind the server to a specific source of incoming datagrams in a transport-agnostic way.
    /// Most customers will wish to use [`crate::udp::UdpTransport`].
    pub async fn bind<T: Transport<Endpoint = Endpoint>>(
        transport: T,
    ) -> Result<Self, TransportError> {
        let binding = transport.bind().await?;
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        Ok(Self {
            binding: binding.fuse(),
            packet_relay_rx: packet_rx,
            packet_relay_tx: packet_tx,
            handler: None,
        })
    }

    /// Run the server "forever".  Note that the function may return a fatal error if the server
    /// encounters unrecoverable issues, typically due to programmer error in this crate itself
    /// or transport errors not related to a specific peer.
    pub async fn serve(
        mut self,
        handler: impl IntoHandler<Handler, Endpoint>,
    ) -> Result<(), FatalServerError> {
        let mtu = self.binding.get_ref().mtu();
        self.handler = Some(handler.into_handler(mtu, self.packet_relay_tx.clone()));

        loop {
            tokio::select! {
                event = self.binding.select_next_some() => {
                    self.handle_rx_event(event)?;
                }
                Some(item) = self.packet_relay_rx.recv() => {
                    self.handle_packet_relay(item).await;
                }
            }
        }
    }

    fn handle_rx_event(
        &self,
        result: Result<FramedItem<Endpoint>, FramedReadError<Endpoint>>,
    ) -> Result<(), FatalServerError> {
        match result {
            Ok((datagram, peer)) => match codec::decode(&datagram) {
                Ok(message) => {
                    trace!("Incoming message from {peer:?}: {message:?}");
                    self.do_handle_request(message, peer)?
                }
                Err(e) => {
                    warn!("Malformed datagram from {peer:?}: {e}");
                    if let Some(reply) = codec::malformed_reply(&datagram, &e) {
                        self.relay(reply, peer);
                    }
                }
            },
            Err((transport_err, peer)) => {
                warn!("Error from {peer:?}: {transport_err}");
                if peer.is_none() {
                    return Err(transport_err.into());
                }
            }
        }

        Ok(())
    }

    fn do_handle_request(&self, message: Message, peer: Endpoint) -> Result<(), FatalServerError> {
        let handler = self
            .handler
            .as_ref()
            .ok_or_else(|| FatalServerError::InternalError("handler not set".to_string()))?;
        let reply_stream = Self::gen_and_send_responses(
            handler.clone(),
            self.packet_relay_tx.clone(),
            message,
            peer,
        );
        tokio::spawn(reply_stream);
        Ok(())
    }

    async fn gen_and_send_responses(
        handler: Handler,
        packet_tx: UnboundedSender<(Message, Endpoint)>,
        message: Message,
        peer: Endpoint,
    ) {
        let mut stream = handler.handle(message, peer.clone());
        while let Some(response) = stream.next().await {
            if packet_tx.send((response, peer.clone())).is_err() {
                warn!("Server shut down before reply to {peer:?} could be sent");
                break;
            }
        }
    }

    fn relay(&self, message: Message, peer: Endpoint) {
        if self.packet_relay_tx.send((message, peer)).is_err() {
            debug!("Relay closed, dropping reply");
        }
    }

    async fn handle_packet_relay(&mut self, (message, peer): (Message, Endpoint)) {
        trace!("Outgoing message to {peer:?}: {message:?}");
        let datagram = match codec::encode(&message) {
            Ok(datagram) => datagram,
            Err(e) => {
                error!("Cannot encode message for {peer:?}: {e}");
                return;
            }
        };
        if let Err(e) = self.binding.send((datagram, peer.clone())).await {
            error!("Error sending to {peer:?}: {e:?}");
        }
    }
}

/// Fatal error preventing the server from starting or continuing.  Typically the result of
/// programmer error or misconfiguration.
#[derive(thiserror::Error, Debug)]
pub enum FatalServerError {
    /// Programmer error within this crate, file a bug!
    #[error("internal error: {0}")]
    InternalError(String),

    /// Transport error that is not related to any individual peer but would prevent any future
    /// exchanges on the transport.  Must abort the server.
    #[error("fatal transport error: {0}")]
    Transport(#[from] TransportError),
}
