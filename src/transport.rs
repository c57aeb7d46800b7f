use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};

/// Generalization of the underlying datagram transport, intended primarily to make it easy to
/// swap UDP for an in-memory link in tests or for other datagram protocols.
#[async_trait]
pub trait Transport {
    type Endpoint: Debug + Send + Clone;

    /// Perform the binding, that is, begin accepting new datagrams from this transport even if
    /// there isn't yet a handler serving the data source.  We expect a continuous async stream
    /// of (datagram, Endpoint) pairs which distinguish each individual peer.
    async fn bind(self) -> Result<BoxedFramedBinding<Self::Endpoint>, TransportError>;
}

pub type BoxedFramedBinding<Endpoint> = Pin<Box<dyn FramedBinding<Endpoint>>>;

/// A socket exposed as both a stream and a sink of raw datagrams.  Decoding happens above
/// this layer so that malformed datagrams can still be answered with a Reset or an error
/// response addressed to the offending peer.
pub trait FramedBinding<Endpoint>:
    Send
    + Stream<Item = Result<FramedItem<Endpoint>, FramedReadError<Endpoint>>>
    + Sink<FramedItem<Endpoint>, Error = FramedWriteError>
{
    /// Access the link's MTU which can be used to determine things like the ideal block
    /// transfer size to recommend.  If it cannot be determined by the link, a suitable
    /// default one will be selected based on the CoAP specification.
    fn mtu(&self) -> Option<u32>;
}

/// Raw datagram paired with the remote peer, as designated by [`Endpoint`].
pub type FramedItem<Endpoint> = (Bytes, Endpoint);

/// Error when receiving from a remote peer.  Note that here [`Endpoint`] is optional as there may
/// be a generic read error unrelated to any remote peer, for example if the underlying bound
/// socket is closed.
pub type FramedReadError<Endpoint> = (TransportError, Option<Endpoint>);

/// Error when sending to a remote peer.  The endpoint is provided to the send APIs themselves
/// so the caller already knows which peer generated the error.
pub type FramedWriteError = TransportError;

/// Generalized errors indicating a range of transport-related issues such as being unable to
/// bind or disconnections from remote peers.  Most of these errors are non-fatal and the
/// server can happily continue serving other peers.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("unspecified: {0}")]
    Unspecified(String),
}
