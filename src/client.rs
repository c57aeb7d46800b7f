use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use crate::exchange::{
    new_empty_ack, new_reset, DuplicateDetector, InboundMatch, RetransmissionManager, SendFailed,
    TokenKey, TokenMatcher, TransmissionParameters,
};
use crate::msg::{
    self, codec, Message, MessageClass, MessageError, MessageId, MessageType, RequestType,
    ResponseType,
};
use crate::packet_handler::Relay;
use crate::transport::{BoxedFramedBinding, Transport, TransportError};

/// Default token length for outbound requests.
pub const DEFAULT_TOKEN_LENGTH: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub token_length: usize,
    /// Timeout used by the convenience methods ([`CoapClient::get`] and friends).
    pub default_timeout: Duration,
    pub parameters: TransmissionParameters,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let parameters = TransmissionParameters::default();
        Self {
            token_length: DEFAULT_TOKEN_LENGTH,
            default_timeout: parameters.max_transmit_wait(),
            parameters,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("no reply after {0} attempts")]
    NoReply(usize),

    #[error("request rejected with a reset")]
    Reset,

    #[error("client stopped")]
    Stopped,

    #[error("no pending request for this token")]
    UnknownToken,

    #[error("request cannot be encoded: {0}")]
    Encode(#[from] MessageError),

    #[error("transmission failed: {0}")]
    Transmission(String),
}

impl From<SendFailed> for ClientError {
    fn from(src: SendFailed) -> Self {
        match src {
            SendFailed::NoReply(attempts) => ClientError::NoReply(attempts),
            SendFailed::Reset => ClientError::Reset,
            SendFailed::Cancelled => ClientError::Stopped,
            e => ClientError::Transmission(e.to_string()),
        }
    }
}

type Delivery = Result<Option<Message>, ClientError>;

enum Waiter {
    /// A caller blocked in [`CoapClient::send_request`].
    Blocking(Option<oneshot::Sender<Delivery>>),
    /// Invoked for every response (every notification, for Observe); `None` on failure or stop.
    Callback(Box<dyn FnMut(Option<Message>) + Send>),
}

impl Waiter {
    fn complete(self, delivery: Delivery) {
        match self {
            Waiter::Blocking(Some(tx)) => {
                if tx.send(delivery).is_err() {
                    trace!("Caller stopped waiting before delivery");
                }
            }
            Waiter::Blocking(None) => {}
            Waiter::Callback(mut callback) => callback(delivery.ok().flatten()),
        }
    }
}

impl Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Waiter::Blocking(_) => f.write_str("Blocking"),
            Waiter::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    waiter: Waiter,
    /// Outbound request, kept for re-issuing it (Observe cancellation).
    request: Message,
    observe: bool,
    /// Message id of a Confirmable request still being retransmitted.
    message_id: Option<MessageId>,
}

struct ClientInner<Endpoint> {
    pending: Mutex<TokenMatcher<Endpoint, PendingRequest>>,
    duplicates: Mutex<DuplicateDetector<Endpoint>>,
    retransmission_manager: Mutex<RetransmissionManager<Endpoint>>,
    relay: Relay<Endpoint>,
    config: ClientConfig,
    stopped: AtomicBool,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

/// Issues requests over a bound transport and matches responses to them by token.  Requests
/// either block the caller until a response or timeout, or register a callback that sees
/// every response (Observe notifications included).
pub struct CoapClient<Endpoint> {
    inner: Arc<ClientInner<Endpoint>>,
}

impl<Endpoint> Clone for CoapClient<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Endpoint: Debug + Clone + Eq + Hash + Send + Sync + 'static> CoapClient<Endpoint> {
    /// Binds `transport` and starts servicing it in the background.  For UDP this is typically
    /// an ephemeral local address such as `0.0.0.0:0`.
    pub async fn bind<T: Transport<Endpoint = Endpoint>>(
        transport: T,
        config: ClientConfig,
    ) -> Result<Self, TransportError> {
        let binding = transport.bind().await?;
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let parameters = config.parameters;
        let inner = Arc::new(ClientInner {
            pending: Mutex::new(TokenMatcher::new(config.token_length)),
            duplicates: Mutex::new(DuplicateDetector::new(
                parameters.exchange_lifetime(),
                parameters.non_lifetime(),
            )),
            retransmission_manager: Mutex::new(RetransmissionManager::new(parameters)),
            relay: relay_tx,
            config,
            stopped: AtomicBool::new(false),
            io_task: Mutex::new(None),
        });
        let io_task = tokio::spawn(run_io(Arc::downgrade(&inner), binding, relay_rx));
        *inner.io_task.lock().await = Some(io_task);
        Ok(Self { inner })
    }

    /// Sends `request` and waits for its response.  Returns `Ok(None)` if `timeout` elapses
    /// first; the request is then abandoned and no longer retransmitted.
    pub async fn send_request(
        &self,
        request: Message,
        peer: Endpoint,
        timeout: Duration,
    ) -> Result<Option<Message>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let key = self
            .submit(request, peer, Waiter::Blocking(Some(tx)))
            .await?;
        match time::timeout(timeout, rx).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Err(ClientError::Stopped),
            Err(_) => {
                debug!("Request {:?} to {:?} timed out", key.token, key.peer);
                self.abandon(&key).await;
                Ok(None)
            }
        }
    }

    /// Sends `request` and returns immediately with its token.  `callback` receives every
    /// response for the token, or `None` if the request fails or the client stops.
    pub async fn send_request_with_callback<F>(
        &self,
        request: Message,
        peer: Endpoint,
        callback: F,
    ) -> Result<Vec<u8>, ClientError>
    where
        F: FnMut(Option<Message>) + Send + 'static,
    {
        let key = self
            .submit(request, peer, Waiter::Callback(Box::new(callback)))
            .await?;
        Ok(key.token)
    }

    pub async fn get(&self, peer: Endpoint, path: &str) -> Result<Option<Message>, ClientError> {
        let request = Message::request(RequestType::Get, MessageType::Confirmable, path);
        self.send_request(request, peer, self.inner.config.default_timeout)
            .await
    }

    pub async fn put(
        &self,
        peer: Endpoint,
        path: &str,
        payload: Vec<u8>,
    ) -> Result<Option<Message>, ClientError> {
        let mut request = Message::request(RequestType::Put, MessageType::Confirmable, path);
        request.payload = payload;
        self.send_request(request, peer, self.inner.config.default_timeout)
            .await
    }

    pub async fn post(
        &self,
        peer: Endpoint,
        path: &str,
        payload: Vec<u8>,
    ) -> Result<Option<Message>, ClientError> {
        let mut request = Message::request(RequestType::Post, MessageType::Confirmable, path);
        request.payload = payload;
        self.send_request(request, peer, self.inner.config.default_timeout)
            .await
    }

    pub async fn delete(&self, peer: Endpoint, path: &str) -> Result<Option<Message>, ClientError> {
        let request = Message::request(RequestType::Delete, MessageType::Confirmable, path);
        self.send_request(request, peer, self.inner.config.default_timeout)
            .await
    }

    /// Registers as an observer of `path`.  `callback` receives the initial response and every
    /// notification.  Returns the token to pass to [`CoapClient::cancel_observing`].
    pub async fn observe<F>(&self, peer: Endpoint, path: &str, callback: F) -> Result<Vec<u8>, ClientError>
    where
        F: FnMut(Option<Message>) + Send + 'static,
    {
        let mut request = Message::request(RequestType::Get, MessageType::Confirmable, path);
        request.set_observe_value(0);
        self.send_request_with_callback(request, peer, callback)
            .await
    }

    /// Stops observing.  With `explicit`, a GET with Observe=1 is sent on the same token and
    /// its response returned; otherwise the relation is forgotten locally and the next
    /// notification is answered with a Reset.
    pub async fn cancel_observing(
        &self,
        token: &[u8],
        peer: Endpoint,
        explicit: bool,
    ) -> Result<Option<Message>, ClientError> {
        let key = TokenKey {
            peer: peer.clone(),
            token: token.to_vec(),
        };
        let entry = self
            .inner
            .pending
            .lock()
            .await
            .remove(&key)
            .ok_or(ClientError::UnknownToken)?;
        if let Some(message_id) = entry.message_id {
            self.inner
                .retransmission_manager
                .lock()
                .await
                .cancel(&peer, message_id);
        }
        debug!("Cancelled observation {token:?} at {peer:?} (explicit={explicit})");
        if !explicit {
            return Ok(None);
        }

        let mut request = entry.request;
        request.set_observe_value(1);
        request.header.set_type(MessageType::Confirmable);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(
            key.clone(),
            PendingRequest {
                waiter: Waiter::Blocking(Some(tx)),
                request: request.clone(),
                observe: false,
                message_id: None,
            },
        );
        self.transmit(&key, request).await;
        match time::timeout(self.inner.config.default_timeout, rx).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Err(ClientError::Stopped),
            Err(_) => {
                self.abandon(&key).await;
                Ok(None)
            }
        }
    }

    /// CoAP "ping": an empty Confirmable.  True if the peer answered at all (a Reset is the
    /// expected answer).
    pub async fn ping(&self, peer: Endpoint) -> Result<bool, ClientError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(ClientError::Stopped);
        }
        let mut ping = Message::new();
        ping.header.code = MessageClass::Empty;
        let send = self
            .inner
            .retransmission_manager
            .lock()
            .await
            .send_reliably(ping, peer, self.inner.relay.clone());
        match send.into_future().await {
            Ok(()) | Err(SendFailed::Reset) => Ok(true),
            Err(SendFailed::NoReply(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Unblocks every waiting caller with `None`, invokes every pending callback with `None`,
    /// stops all retransmissions and releases the transport.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<_> = self.inner.pending.lock().await.drain().collect();
        debug!("Stopping client with {} pending requests", pending.len());
        for (_, entry) in pending {
            entry.waiter.complete(Ok(None));
        }
        self.inner.retransmission_manager.lock().await.cancel_all();
        if let Some(io_task) = self.inner.io_task.lock().await.take() {
            io_task.abort();
        }
    }

    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    async fn submit(
        &self,
        mut request: Message,
        peer: Endpoint,
        waiter: Waiter,
    ) -> Result<TokenKey<Endpoint>, ClientError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(ClientError::Stopped);
        }
        let observe = request.get_observe_value() == Some(0);
        let mut pending = self.inner.pending.lock().await;
        let token = pending.fresh_token();
        request.set_token(token.clone());
        codec::encode(&request)?;
        let key = TokenKey {
            peer,
            token,
        };
        pending.insert(
            key.clone(),
            PendingRequest {
                waiter,
                request: request.clone(),
                observe,
                message_id: None,
            },
        );
        drop(pending);

        self.transmit(&key, request).await;
        Ok(key)
    }

    /// Hands the request to the reliability layer (CON) or straight to the transport (NON).
    async fn transmit(&self, key: &TokenKey<Endpoint>, mut request: Message) {
        let peer = key.peer.clone();
        if request.header.get_type() != MessageType::Confirmable {
            request.header.message_id = self.inner.retransmission_manager.lock().await.next_message_id();
            if self.inner.relay.send((request, peer)).is_err() {
                self.fail(key, ClientError::Stopped).await;
            }
            return;
        }

        let send = self
            .inner
            .retransmission_manager
            .lock()
            .await
            .send_reliably(request, peer, self.inner.relay.clone());
        let message_id = send.get_message_id();
        if let Some(entry) = self.inner.pending.lock().await.get_mut(key) {
            entry.message_id = Some(message_id);
        }

        let client = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            match send.into_future().await {
                Ok(()) => {
                    if let Some(entry) = client.inner.pending.lock().await.get_mut(&key) {
                        entry.message_id = None;
                    }
                }
                Err(SendFailed::Cancelled) => {}
                Err(e) => {
                    debug!("Request {:?} to {:?} failed: {e}", key.token, key.peer);
                    client.fail(&key, e.into()).await;
                }
            }
        });
    }

    async fn fail(&self, key: &TokenKey<Endpoint>, error: ClientError) {
        let entry = self.inner.pending.lock().await.remove(key);
        if let Some(entry) = entry {
            entry.waiter.complete(Err(error));
        }
    }

    async fn abandon(&self, key: &TokenKey<Endpoint>) {
        let entry = self.inner.pending.lock().await.remove(key);
        if let Some(message_id) = entry.and_then(|e| e.message_id) {
            self.inner
                .retransmission_manager
                .lock()
                .await
                .cancel(&key.peer, message_id);
        }
    }
}

impl<Endpoint: Debug + Clone + Eq + Hash + Send + Sync + 'static> ClientInner<Endpoint> {
    /// Processes one inbound message and returns the replies (ACK or RST) it calls for.
    async fn handle_inbound(&self, message: Message, peer: Endpoint) -> Option<Message> {
        let mtype = message.header.get_type();
        match message.header.code {
            MessageClass::Empty => match mtype {
                MessageType::Acknowledgement | MessageType::Reset => {
                    let matched = self
                        .retransmission_manager
                        .lock()
                        .await
                        .maybe_handle_reply(&message, &peer);
                    if !matched {
                        let message_id = message.header.message_id;
                        debug!("Got {mtype:?} from {peer:?} for unrecognized message ID {message_id}");
                    }
                    None
                }
                MessageType::Confirmable => Some(new_reset(&message)),
                MessageType::NonConfirmable => None,
            },
            MessageClass::Response(_) => self.handle_response(message, peer).await,
            MessageClass::Request(_) | MessageClass::Reserved(_) => {
                warn!("Unexpected {:?} from {peer:?}, ignoring...", message.header.code);
                match mtype {
                    MessageType::Confirmable => Some(new_reset(&message)),
                    _ => None,
                }
            }
        }
    }

    async fn handle_response(&self, message: Message, peer: Endpoint) -> Option<Message> {
        let mtype = message.header.get_type();
        let message_id = message.header.message_id;
        match mtype {
            MessageType::Acknowledgement => {
                self.retransmission_manager
                    .lock()
                    .await
                    .maybe_handle_reply(&message, &peer);
            }
            MessageType::Confirmable | MessageType::NonConfirmable => {
                match self.duplicates.lock().await.match_inbound(&message, &peer) {
                    InboundMatch::New => {}
                    InboundMatch::Replay(reply) => {
                        debug!("Duplicate response {message_id} from {peer:?}, replaying reply");
                        return Some(reply);
                    }
                    InboundMatch::InProgress => {
                        debug!("Duplicate response {message_id} from {peer:?}, ignoring");
                        return None;
                    }
                }
            }
            MessageType::Reset => return None,
        }

        let key = TokenKey::new(&message, &peer);
        let reply_template = message.clone();
        let (known, retransmitting) = self.deliver(&key, message).await;
        if let Some(request_id) = retransmitting {
            // A separate response implies the request arrived, even if its ACK got lost.
            self.retransmission_manager
                .lock()
                .await
                .cancel(&peer, request_id);
        }

        let reply = match (mtype, known) {
            (MessageType::Confirmable, true) => new_empty_ack(&reply_template),
            (MessageType::Confirmable, false) | (MessageType::NonConfirmable, false) => {
                debug!("Response for unknown token {:?} from {peer:?}, rejecting", key.token);
                new_reset(&reply_template)
            }
            _ => return None,
        };
        self.duplicates
            .lock()
            .await
            .record_reply(&peer, message_id, reply.clone());
        Some(reply)
    }

    /// Hands a response to its waiter.  Returns whether the token was known, and the message
    /// id of the request if it was still being retransmitted.  User callbacks run with the
    /// pending table unlocked.
    async fn deliver(&self, key: &TokenKey<Endpoint>, message: Message) -> (bool, Option<MessageId>) {
        let mut pending = self.pending.lock().await;
        let status = message.status();
        let entry = match pending.get_mut(key) {
            Some(entry) => entry,
            None => return (false, None),
        };
        if !entry.observe
            && entry.request.get_observe_value().is_some()
            && message.get_observe_value().is_some()
        {
            // The deregistration request is still outstanding; only its own response ends it.
            debug!("Notification for {:?} while deregistering, ignoring", key.token);
            return (true, None);
        }
        let retransmitting = entry.message_id.take();
        if status == Some(ResponseType::Continue) {
            debug!("Continue for {:?}, still waiting", key.token);
            return (true, retransmitting);
        }

        let notification = entry.observe
            && message.get_observe_value().is_some()
            && status.map_or(false, msg::is_success);
        if !notification {
            let removed = pending.remove(key);
            drop(pending);
            if let Some(entry) = removed {
                entry.waiter.complete(Ok(Some(message)));
            }
            return (true, retransmitting);
        }

        let mut callback = match std::mem::replace(&mut entry.waiter, Waiter::Blocking(None)) {
            Waiter::Callback(callback) => callback,
            Waiter::Blocking(tx) => {
                if let Some(tx) = tx {
                    if tx.send(Ok(Some(message))).is_err() {
                        debug!("Waiter for {:?} went away", key.token);
                    }
                }
                return (true, retransmitting);
            }
        };
        drop(pending);
        callback(Some(message));

        let orphaned = match self.pending.lock().await.get_mut(key) {
            Some(entry) if entry.observe && matches!(entry.waiter, Waiter::Blocking(None)) => {
                entry.waiter = Waiter::Callback(callback);
                None
            }
            Some(_) => None,
            None => Some(callback),
        };
        if let Some(mut callback) = orphaned {
            // Stopped while the callback ran; it still owes the final `None`.
            if self.stopped.load(Ordering::SeqCst) {
                callback(None);
            }
        }
        (true, retransmitting)
    }
}

async fn run_io<Endpoint: Debug + Clone + Eq + Hash + Send + Sync + 'static>(
    inner: Weak<ClientInner<Endpoint>>,
    mut binding: BoxedFramedBinding<Endpoint>,
    mut outbound: UnboundedReceiver<(Message, Endpoint)>,
) {
    loop {
        tokio::select! {
            item = outbound.recv() => {
                let (message, peer) = match item {
                    Some(item) => item,
                    None => break,
                };
                trace!("Outgoing message to {peer:?}: {message:?}");
                let datagram = match codec::encode(&message) {
                    Ok(datagram) => datagram,
                    Err(e) => {
                        error!("Cannot encode message for {peer:?}: {e}");
                        continue;
                    }
                };
                if let Err(e) = binding.send((datagram, peer.clone())).await {
                    error!("Error sending to {peer:?}: {e:?}");
                }
            }
            event = binding.next() => {
                let (datagram, peer) = match event {
                    Some(Ok(item)) => item,
                    Some(Err((e, peer))) => {
                        warn!("Error from {peer:?}: {e}");
                        if peer.is_none() {
                            break;
                        }
                        continue;
                    }
                    None => break,
                };
                let message = match codec::decode(&datagram) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Malformed datagram from {peer:?}: {e}");
                        continue;
                    }
                };
                trace!("Incoming message from {peer:?}: {message:?}");
                let inner = match inner.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                if let Some(reply) = inner.handle_inbound(message, peer.clone()).await {
                    if inner.relay.send((reply, peer)).is_err() {
                        debug!("Relay closed, dropping reply");
                    }
                }
            }
        }
    }
    debug!("Client transport loop finished");
}
