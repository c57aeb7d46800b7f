use std::fmt::Debug;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{Future, Stream};
use log::{debug, warn};
use pin_project::pin_project;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};

use crate::app::app_builder::{AppBuilder, AppConfig};
use crate::app::block_handler::{Block1Step, BlockHandler};
use crate::app::core_handler::{handle_discovery, WELL_KNOWN_CORE};
use crate::app::error::CoapError;
use crate::app::observe_manager::{
    DeferredNotification, NotifyConditions, ObserveManager, ObserveRelation, PendingNotification,
};
use crate::app::resource::{Render, Resource, ResourceState};
use crate::app::resource_tree::ResourceTree;
use crate::app::{Request, Response};
use crate::exchange::{
    new_empty_ack, new_reset, DuplicateDetector, InboundMatch, RetransmissionManager,
    SendFailed, TokenKey,
};
use crate::msg::{
    self, option, CoapOption, Message, MessageClass, MessageType, ObserveOption, RequestType,
    ResponseType,
};
use crate::packet_handler::{PacketHandler, Relay};

/// Main PacketHandler for an application suite of resources.  Owns the resource tree and the
/// exchange state around it: deduplication, separate responses, observe relations and
/// blockwise contexts.
///
/// Shared tables are each behind their own lock and are always taken in the order resources,
/// observers, blocks, exchanges.  No lock is held while a resource handler runs or while a
/// message is handed to the transport.
pub struct AppHandler<Endpoint: Debug + Clone + Eq + Hash + Send + Sync + 'static> {
    resources: Arc<Mutex<ResourceTree<Endpoint>>>,
    observers: Arc<Mutex<ObserveManager<Endpoint>>>,
    block_handler: Option<Arc<Mutex<BlockHandler<Endpoint>>>>,
    duplicates: Arc<Mutex<DuplicateDetector<Endpoint>>>,
    retransmission_manager: Arc<Mutex<RetransmissionManager<Endpoint>>>,
    relay: Relay<Endpoint>,
    config: Arc<AppConfig>,
}

impl<Endpoint: Debug + Clone + Eq + Hash + Send + Sync + 'static> Clone for AppHandler<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            resources: self.resources.clone(),
            observers: self.observers.clone(),
            block_handler: self.block_handler.clone(),
            duplicates: self.duplicates.clone(),
            retransmission_manager: self.retransmission_manager.clone(),
            relay: self.relay.clone(),
            config: self.config.clone(),
        }
    }
}

#[pin_project]
struct PacketStream<F: Send> {
    #[pin]
    fut: F,
    response: Vec<Message>,
    fut_complete: bool,
}

impl<F: Future<Output = Vec<Message>> + Send> Stream for PacketStream<F> {
    type Item = Message;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if !*this.fut_complete {
            match this.fut.poll(cx) {
                Poll::Ready(response) => {
                    *this.response = response;
                    *this.fut_complete = true;
                    this.response.reverse();
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }

        Poll::Ready(this.response.pop())
    }
}

impl<Endpoint: Debug + Clone + Eq + Hash + Send + Sync + 'static> PacketHandler<Endpoint>
    for AppHandler<Endpoint>
{
    fn handle<'a>(
        &'a self,
        message: Message,
        peer: Endpoint,
    ) -> Pin<Box<dyn Stream<Item = Message> + Send + 'a>> {
        let handler = self.handle_packet(message, peer);
        Box::pin(PacketStream {
            fut: handler,
            response: vec![],
            fut_complete: false,
        })
    }
}

impl<Endpoint: Debug + Clone + Eq + Hash + Send + Sync + 'static> AppHandler<Endpoint> {
    pub fn from_builder(builder: AppBuilder<Endpoint>, mtu: Option<u32>, relay: Relay<Endpoint>) -> Self {
        let config = builder.config.resolve(mtu);
        let parameters = config.parameters;

        let mut tree = ResourceTree::new();
        for resource in builder.resources {
            let (state, handler) = resource.build(config.discoverable);
            tree.insert(state, handler);
        }

        let block_handler = if config.block_transfer {
            Some(Arc::new(Mutex::new(BlockHandler::new(config.block))))
        } else {
            None
        };

        let handler = Self {
            resources: Arc::new(Mutex::new(tree)),
            observers: Arc::new(Mutex::new(ObserveManager::new(config.max_non_notifications))),
            block_handler,
            duplicates: Arc::new(Mutex::new(DuplicateDetector::new(
                parameters.exchange_lifetime(),
                parameters.non_lifetime(),
            ))),
            retransmission_manager: Arc::new(Mutex::new(RetransmissionManager::new(parameters))),
            relay,
            config: Arc::new(config),
        };
        handler.spawn_change_listener(builder.changes_rx);
        handler
    }

    fn spawn_change_listener(&self, mut changes_rx: UnboundedReceiver<String>) {
        let handler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes_rx.recv() => match change {
                        Some(path) => handler.notify(&path).await,
                        None => break,
                    },
                    _ = handler.relay.closed() => break,
                }
            }
        });
    }

    async fn handle_packet(&self, message: Message, peer: Endpoint) -> Vec<Message> {
        match message.header.code {
            MessageClass::Request(_) => self.handle_request(message, peer).await.into_iter().collect(),
            // Unassigned method codes still get a 4.05 from the dispatcher.
            MessageClass::Reserved(_) if message.is_request() => {
                self.handle_request(message, peer).await.into_iter().collect()
            }
            MessageClass::Response(code) => {
                if message.header.get_type() == MessageType::Confirmable {
                    warn!("Spurious {code:?} response from {peer:?}, rejecting...");
                    vec![new_reset(&message)]
                } else {
                    warn!("Spurious {code:?} response from {peer:?}, ignoring...");
                    vec![]
                }
            }
            MessageClass::Empty => match message.header.get_type() {
                MessageType::Acknowledgement | MessageType::Reset => {
                    self.handle_reply(&message, &peer).await;
                    vec![]
                }
                MessageType::Confirmable => {
                    // A common way in CoAP to trigger a cheap "ping" to make sure
                    // the server is alive.
                    vec![new_reset(&message)]
                }
                MessageType::NonConfirmable => {
                    debug!("Ignoring Non-Confirmable Empty message from {peer:?}");
                    vec![]
                }
            },
            MessageClass::Reserved(code) => {
                warn!("Unhandled message code {code} from {peer:?}, ignoring...");
                if message.header.get_type() == MessageType::Confirmable {
                    vec![new_reset(&message)]
                } else {
                    vec![]
                }
            }
        }
    }

    async fn handle_reply(&self, message: &Message, peer: &Endpoint) {
        let t = message.header.get_type();
        let message_id = message.header.message_id;
        let matched = self
            .retransmission_manager
            .lock()
            .await
            .maybe_handle_reply(message, peer);
        if !matched {
            debug!("Got {t:?} from {peer:?} for unrecognized message ID {message_id}");
        }
        if t == MessageType::Reset {
            self.observers.lock().await.on_reset(peer, message_id);
        }
    }

    async fn handle_request(&self, message: Message, peer: Endpoint) -> Option<Message> {
        let message_id = message.header.message_id;
        match self.duplicates.lock().await.match_inbound(&message, &peer) {
            InboundMatch::New => {}
            InboundMatch::Replay(reply) => {
                debug!("Duplicate message ID {message_id} from {peer:?}, replaying reply");
                return Some(reply);
            }
            InboundMatch::InProgress => {
                debug!("Duplicate message ID {message_id} from {peer:?} still in progress");
                return None;
            }
        }

        let mut request = Request::new(message, peer);
        let mut acked = false;
        let response = match self.dispatch(&mut request, &mut acked).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request from {:?} failed: {e}", request.source);
                let mut response = e.into_response(&request);
                if let Err(e) = self.slice_response(&request, &mut response.message).await {
                    debug!("Error response left whole: {e}");
                }
                response
            }
        };
        self.deliver(&request, response.message, acked).await
    }

    async fn dispatch(
        &self,
        request: &mut Request<Endpoint>,
        acked: &mut bool,
    ) -> Result<Response, CoapError> {
        if let Err(number) = request.original.validate_options() {
            return Err(CoapError::bad_option(number));
        }
        request.original.normalize_elective_repeats();

        let path = request.path();
        if log::log_enabled!(log::Level::Debug) {
            let peer = &request.source;
            let method = request.method();
            debug!("Received from [{peer:?}]: {method:?} /{path}");
        }

        let mut block1 = None;
        if let Some(blocks) = &self.block_handler {
            let mut blocks = blocks.lock().await;
            match blocks.intercept_request(&request.source, &mut request.original)? {
                Block1Step::Continue(block) => {
                    let mut response = Response::new(&request.original);
                    response.set_status(ResponseType::Continue);
                    response.message.set_block1(block);
                    return Ok(response);
                }
                Block1Step::Complete(block) => block1 = block,
            }
            if let Some(cached) = blocks.serve_cached(&request.source, &request.original)? {
                return Ok(Response { message: cached });
            }
        }

        let discovery = path == WELL_KNOWN_CORE && self.serves_discovery().await;
        let mut response = if discovery {
            let resources = self.resources.lock().await;
            handle_discovery(request, resources.traverse().into_iter().map(|n| &n.state))?
        } else {
            match request.method() {
                Some(RequestType::Get) => self.handle_get(request, acked).await?,
                Some(RequestType::Put) => self.handle_put(request, acked).await?,
                Some(RequestType::Post) => self.handle_post(request, acked).await?,
                Some(RequestType::Delete) => self.handle_delete(request, acked).await?,
                _ => return Err(CoapError::method_not_allowed()),
            }
        };
        if let Some(block) = block1 {
            response.message.set_block1(block);
        }
        self.slice_response(request, &mut response.message).await?;
        Ok(response)
    }

    async fn serves_discovery(&self) -> bool {
        self.config.discoverable
            || self
                .resources
                .lock()
                .await
                .traverse()
                .iter()
                .any(|node| node.state.is_visible())
    }

    async fn slice_response(
        &self,
        request: &Request<Endpoint>,
        message: &mut Message,
    ) -> Result<(), CoapError> {
        match &self.block_handler {
            // Handlers that do their own Block2 handling are left alone.
            Some(_) if message.has_option(CoapOption::Block2) => Ok(()),
            Some(blocks) => blocks
                .lock()
                .await
                .intercept_response(&request.source, &request.original, message),
            None => Ok(()),
        }
    }

    /// Runs a handler, switching to a separate response if it has not finished within
    /// `separate_response_after` or if it asks for one.
    async fn run_handler(
        &self,
        request: &Request<Endpoint>,
        mut fut: BoxFuture<'_, Render<Endpoint>>,
        acked: &mut bool,
    ) -> Render<Endpoint> {
        let mut render = if request.original.header.get_type() == MessageType::Confirmable && !*acked {
            let timer = time::sleep(self.config.separate_response_after);
            tokio::pin!(timer);
            let finished = tokio::select! {
                biased;
                render = &mut fut => Some(render),
                _ = &mut timer => None,
            };
            match finished {
                Some(render) => render,
                None => {
                    self.acknowledge(request, acked).await;
                    fut.await
                }
            }
        } else {
            fut.await
        };
        while let Render::Separate(next) = render {
            self.acknowledge(request, acked).await;
            render = next.await;
        }
        render
    }

    /// Empty ACK for a Confirmable request whose response will follow separately.
    async fn acknowledge(&self, request: &Request<Endpoint>, acked: &mut bool) {
        if *acked || request.original.header.get_type() != MessageType::Confirmable {
            return;
        }
        let peer = &request.source;
        let message_id = request.original.header.message_id;
        let ack = new_empty_ack(&request.original);
        self.duplicates
            .lock()
            .await
            .record_reply(peer, message_id, ack.clone());
        debug!("Acknowledging message ID {message_id} from {peer:?}, response to follow");
        if self.relay.send((ack, peer.clone())).is_err() {
            warn!("Server shut down before ACK to {peer:?} could be sent");
        }
        *acked = true;
    }

    /// Final message type and id: piggybacked on the ACK, sent Non-confirmable in answer to a
    /// NON, or sent Confirmable after an earlier empty ACK.
    async fn deliver(
        &self,
        request: &Request<Endpoint>,
        mut message: Message,
        acked: bool,
    ) -> Option<Message> {
        let peer = &request.source;
        let request_id = request.original.header.message_id;
        message.set_token(request.original.get_token().to_vec());
        match request.original.header.get_type() {
            MessageType::Confirmable if !acked => {
                message.header.set_type(MessageType::Acknowledgement);
                message.header.message_id = request_id;
                self.duplicates
                    .lock()
                    .await
                    .record_reply(peer, request_id, message.clone());
                Some(message)
            }
            MessageType::Confirmable => {
                self.send_confirmable(message, peer.clone(), |result| {
                    if let Err(e) = result {
                        warn!("Separate response not delivered: {e}");
                    }
                })
                .await;
                None
            }
            _ => {
                message.header.set_type(MessageType::NonConfirmable);
                message.header.message_id = self.retransmission_manager.lock().await.next_message_id();
                self.duplicates
                    .lock()
                    .await
                    .record_reply(peer, request_id, message.clone());
                Some(message)
            }
        }
    }

    /// Sends `message` reliably in the background.  `on_complete` observes the outcome.
    async fn send_confirmable<F>(&self, message: Message, peer: Endpoint, on_complete: F)
    where
        F: FnOnce(Result<(), SendFailed>) + Send + 'static,
    {
        let send = self
            .retransmission_manager
            .lock()
            .await
            .send_reliably(message, peer, self.relay.clone());
        tokio::spawn(async move { on_complete(send.into_future().await) });
    }

    async fn handle_get(
        &self,
        request: &Request<Endpoint>,
        acked: &mut bool,
    ) -> Result<Response, CoapError> {
        let path = request.path();
        let (state, handler) = self
            .resources
            .lock()
            .await
            .snapshot(&path)
            .ok_or_else(CoapError::not_found)?;
        let render = self
            .run_handler(request, handler.render_get(request, &state), acked)
            .await;
        let mut response = represent_render(request, render)?;
        self.handle_observe(request, &path, &mut response).await?;
        Ok(response)
    }

    async fn handle_observe(
        &self,
        request: &Request<Endpoint>,
        path: &str,
        response: &mut Response,
    ) -> Result<(), CoapError> {
        let observe = match request.original.get_observe_value() {
            Some(value) => option::observe_flag(value),
            None => return Ok(()),
        };
        let key = TokenKey::new(&request.original, &request.source);
        match observe {
            Some(ObserveOption::Register) => {
                if !msg::is_success(response.get_status()) {
                    let removed = self.observers.lock().await.deregister(&key);
                    if let Some(relation) = removed {
                        self.cancel_in_flight(&relation).await;
                    }
                    return Ok(());
                }
                let conditions = NotifyConditions::from_queries(&request.queries())?;
                let fallback = conditions.fallback_interval();

                let resources = self.resources.lock().await;
                let sequence = match resources.get(path) {
                    Some(node) if node.state.is_observable() => node.state.observe_sequence(),
                    _ => return Ok(()),
                };
                let (generation, _) =
                    self.observers
                        .lock()
                        .await
                        .register(request, path, sequence, conditions);
                drop(resources);

                response.message.set_observe_value(sequence);
                if let Some(delay) = fallback {
                    self.schedule_recheck(key, generation, delay);
                }
            }
            Some(ObserveOption::Deregister) => {
                let removed = self.observers.lock().await.deregister(&key);
                if let Some(relation) = removed {
                    self.cancel_in_flight(&relation).await;
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn handle_put(
        &self,
        request: &Request<Endpoint>,
        acked: &mut bool,
    ) -> Result<Response, CoapError> {
        let path = request.path();
        let (state, handler) = self
            .resources
            .lock()
            .await
            .snapshot(&path)
            .ok_or_else(CoapError::not_found)?;
        check_preconditions(request, &state)?;

        let render = self
            .run_handler(request, handler.render_put(request, &state), acked)
            .await;
        match render {
            Render::Resource(updated) => {
                let etag = {
                    let mut resources = self.resources.lock().await;
                    // The handler ran unlocked; the resource may have changed under it.
                    let current = resources.get(&path).ok_or_else(CoapError::not_found)?;
                    check_preconditions(request, &current.state)?;
                    resources.update(updated);
                    resources
                        .get(&path)
                        .and_then(|node| node.state.etag().map(<[u8]>::to_vec))
                };
                let mut response = request.new_response();
                response.set_status(ResponseType::Changed);
                if let Some(etag) = etag {
                    response.message.set_option(CoapOption::ETag, etag);
                }
                self.notify(&path).await;
                Ok(response)
            }
            other => render_outcome(request, other),
        }
    }

    async fn handle_post(
        &self,
        request: &mut Request<Endpoint>,
        acked: &mut bool,
    ) -> Result<Response, CoapError> {
        let path = request.path();
        let (state, handler) = {
            let resources = self.resources.lock().await;
            match resources.snapshot(&path) {
                Some(found) => found,
                None => {
                    let (parent, matched) = resources
                        .creation_parent(&path)
                        .ok_or_else(CoapError::method_not_allowed)?;
                    request.unmatched_path = request
                        .original
                        .get_path_as_vec()?
                        .into_iter()
                        .skip(matched)
                        .collect();
                    debug!("POST to missing /{path} routed to /{parent}");
                    resources
                        .snapshot(&parent)
                        .ok_or_else(|| CoapError::internal("Creation parent vanished"))?
                }
            }
        };

        let request = &*request;
        let render = self
            .run_handler(request, handler.render_post(request, &state), acked)
            .await;
        match render {
            Render::Resource(updated) if updated.path() == state.path() => {
                let updated_path = updated.path().to_string();
                let etag = {
                    let mut resources = self.resources.lock().await;
                    if !resources.update(updated) {
                        return Err(CoapError::not_found());
                    }
                    resources
                        .get(&updated_path)
                        .and_then(|node| node.state.etag().map(<[u8]>::to_vec))
                };
                let mut response = request.new_response();
                response.set_status(ResponseType::Changed);
                if let Some(etag) = etag {
                    response.message.set_option(CoapOption::ETag, etag);
                }
                self.notify(&updated_path).await;
                Ok(response)
            }
            Render::Resource(created) => {
                let child_handler = dyn_clone::clone_box(&*handler);
                self.create(request, created, child_handler).await
            }
            Render::Created(created, child_handler) => {
                self.create(request, created, child_handler).await
            }
            other => render_outcome(request, other),
        }
    }

    async fn create(
        &self,
        request: &Request<Endpoint>,
        state: ResourceState,
        handler: Box<dyn Resource<Endpoint>>,
    ) -> Result<Response, CoapError> {
        let location = state.path().to_string();
        {
            let mut resources = self.resources.lock().await;
            if resources.get(&location).is_some() {
                debug!("Refusing to create /{location} over an existing resource");
                return Err(CoapError::for_code(
                    ResponseType::Forbidden,
                    "Resource already exists",
                ));
            }
            resources.insert(state, handler);
        }
        debug!("Created /{location}");

        let mut response = request.new_response();
        response.set_status(ResponseType::Created);
        response.message.set_location_path(&location);
        Ok(response)
    }

    async fn handle_delete(
        &self,
        request: &Request<Endpoint>,
        acked: &mut bool,
    ) -> Result<Response, CoapError> {
        let path = request.path();
        let (state, handler) = self
            .resources
            .lock()
            .await
            .snapshot(&path)
            .ok_or_else(CoapError::not_found)?;
        let render = self
            .run_handler(request, handler.render_delete(request, &state), acked)
            .await;
        match render {
            Render::Resource(_) => {
                let relations = {
                    let mut resources = self.resources.lock().await;
                    let mut observers = self.observers.lock().await;
                    let removed = resources.remove_subtree(&path);
                    debug!("Deleted {removed:?}");
                    removed
                        .iter()
                        .flat_map(|p| observers.remove_for_path(p))
                        .collect::<Vec<_>>()
                };
                for relation in relations {
                    self.notify_deletion(relation).await;
                }
                let mut response = request.new_response();
                response.set_status(ResponseType::Deleted);
                Ok(response)
            }
            other => render_outcome(request, other),
        }
    }

    /// Notifies observers of `path` and of every resource below it.
    pub(crate) async fn notify(&self, path: &str) {
        let now = Instant::now();
        let (pending, deferred, torn_down) = {
            let mut resources = self.resources.lock().await;
            let mut observers = self.observers.lock().await;
            let mut pending = Vec::new();
            let mut deferred = Vec::new();
            let mut torn_down = Vec::new();
            for p in resources.subtree_paths(path) {
                if !observers.has_relations(&p) {
                    continue;
                }
                let node = match resources.get_mut(&p) {
                    Some(node) => node,
                    None => continue,
                };
                if !node.state.is_observable() {
                    torn_down.extend(observers.remove_for_path(&p));
                    continue;
                }
                let sequence = node.state.bump_observe_sequence();
                let (ready, held) = observers.prepare_notifications(&p, sequence, now);
                pending.extend(ready);
                deferred.extend(held);
            }
            (pending, deferred, torn_down)
        };

        for relation in torn_down {
            debug!("/{} is no longer observable, dropping {:?}", relation.resource_path, relation.key);
            self.cancel_in_flight(&relation).await;
        }
        for DeferredNotification { key, generation, delay } in deferred {
            self.schedule_recheck(key, generation, delay);
        }
        for notification in pending {
            self.send_notification(notification).await;
        }
    }

    /// Arms a timer that sends the resource's current state to one observer, unless the
    /// relation has been notified or removed by the time it fires.
    fn schedule_recheck(&self, key: TokenKey<Endpoint>, generation: u64, delay: Duration) {
        let handler = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            handler.fire_recheck(key, generation).await;
        });
    }

    async fn fire_recheck(&self, key: TokenKey<Endpoint>, generation: u64) {
        let pending = {
            let mut resources = self.resources.lock().await;
            let mut observers = self.observers.lock().await;
            if !observers.is_current(&key, generation) {
                return;
            }
            let path = match observers.get(&key) {
                Some(relation) => relation.resource_path.clone(),
                None => return,
            };
            let sequence = match resources.get_mut(&path) {
                Some(node) => node.state.bump_observe_sequence(),
                None => return,
            };
            observers.prepare_fallback(&key, generation, sequence, Instant::now())
        };
        if let Some(notification) = pending {
            self.send_notification(notification).await;
        }
    }

    async fn send_notification(&self, notification: PendingNotification<Endpoint>) {
        let PendingNotification {
            key,
            request,
            sequence,
            confirmable,
            replaces,
            generation,
            fallback,
        } = notification;

        let snapshot = self.resources.lock().await.snapshot(&request.path());
        let rendered = match snapshot {
            Some((state, handler)) => {
                let mut render = handler.render_get(&request, &state).await;
                while let Render::Separate(next) = render {
                    render = next.await;
                }
                represent_render(&request, render)
            }
            None => Err(CoapError::not_found()),
        };
        let (mut message, keep) = match rendered {
            Ok(response) if msg::is_success(response.get_status()) => (response.message, true),
            Ok(response) => (response.message, false),
            Err(e) => (e.into_response(&request).message, false),
        };
        if keep {
            message.set_observe_value(sequence);
        } else {
            debug!("Observe relation {key:?} ends with {:?}", message.status());
            self.observers.lock().await.deregister(&key);
        }
        if let Err(e) = self.slice_response(&request, &mut message).await {
            warn!("Notification for {key:?} could not be sliced: {e}");
        }
        message.set_token(key.token.clone());

        let peer = key.peer.clone();
        if confirmable {
            let send = {
                let mut manager = self.retransmission_manager.lock().await;
                if let Some(previous) = replaces {
                    manager.cancel(&peer, previous);
                }
                manager.send_reliably(message, peer, self.relay.clone())
            };
            let message_id = send.get_message_id();
            if keep {
                self.observers
                    .lock()
                    .await
                    .record_sent(&key, message_id, true);
            }
            let handler = self.clone();
            let relation = key.clone();
            tokio::spawn(async move {
                match send.into_future().await {
                    Ok(()) => handler.observers.lock().await.complete(&relation, message_id),
                    // Superseded by a newer notification or the relation was torn down.
                    Err(SendFailed::Cancelled) => {}
                    Err(e) => {
                        warn!("Notification to {:?} failed: {e}", relation.peer);
                        handler.observers.lock().await.fail(&relation, message_id);
                    }
                }
            });
        } else {
            message.header.set_type(MessageType::NonConfirmable);
            let message_id = self.retransmission_manager.lock().await.next_message_id();
            message.header.message_id = message_id;
            if keep {
                self.observers
                    .lock()
                    .await
                    .record_sent(&key, message_id, false);
            }
            if self.relay.send((message, peer)).is_err() {
                warn!("Server shut down before notification for {key:?} could be sent");
            }
        }

        if keep {
            if let Some(delay) = fallback {
                self.schedule_recheck(key, generation, delay);
            }
        }
    }

    /// Final 4.04 to an observer of a deleted resource.
    async fn notify_deletion(&self, relation: ObserveRelation<Endpoint>) {
        self.cancel_in_flight(&relation).await;
        let mut response = Response::new(&relation.request.original);
        response.set_status(ResponseType::NotFound);
        let mut message = response.message;
        let peer = relation.key.peer.clone();
        if relation.request.original.header.get_type() == MessageType::Confirmable {
            self.send_confirmable(message, peer, |result| {
                if let Err(e) = result {
                    debug!("Deletion notice not delivered: {e}");
                }
            })
            .await;
        } else {
            message.header.set_type(MessageType::NonConfirmable);
            message.header.message_id = self.retransmission_manager.lock().await.next_message_id();
            if self.relay.send((message, peer)).is_err() {
                debug!("Server shut down before the deletion notice for {:?} went out", relation.key);
            }
        }
    }

    async fn cancel_in_flight(&self, relation: &ObserveRelation<Endpoint>) {
        if let Some(message_id) = relation.in_flight {
            self.retransmission_manager
                .lock()
                .await
                .cancel(&relation.key.peer, message_id);
        }
    }
}

/// If-Match passes when it is absent, empty, or lists the current ETag.  If-None-Match always
/// fails since the target exists.
fn check_preconditions<Endpoint>(
    request: &Request<Endpoint>,
    state: &ResourceState,
) -> Result<(), CoapError> {
    if request.original.has_option(CoapOption::IfNoneMatch) {
        return Err(CoapError::precondition_failed());
    }
    if let Some(conditions) = request.original.get_option(CoapOption::IfMatch) {
        let current = state.etag();
        let satisfied = conditions
            .iter()
            .any(|etag| etag.is_empty() || Some(etag.as_slice()) == current);
        if !satisfied {
            return Err(CoapError::precondition_failed());
        }
    }
    Ok(())
}

/// Response for a GET render: representation selected by Accept, validated by ETag.
fn represent_render<Endpoint: Send + Sync + 'static>(
    request: &Request<Endpoint>,
    render: Render<Endpoint>,
) -> Result<Response, CoapError> {
    let state = match render {
        Render::Resource(state) => state,
        other => return render_outcome(request, other),
    };

    let accept = match request.original.get_accept_number() {
        Some(number) => Some(option::content_format(number).ok_or_else(CoapError::not_acceptable)?),
        None => None,
    };
    let mut response = request.new_response();
    response.set_status(ResponseType::Content);
    match state.representation(accept) {
        Some((format, payload)) => {
            response.message.set_content_format(format);
            let etag = state.etag();
            if let Some(etag) = etag {
                response.message.set_option(CoapOption::ETag, etag.to_vec());
            }
            let validated = match (request.original.get_option(CoapOption::ETag), etag) {
                (Some(candidates), Some(etag)) => candidates.iter().any(|c| c == etag),
                _ => false,
            };
            if validated {
                response.set_status(ResponseType::Valid);
            } else {
                response.message.payload = payload.to_vec();
            }
        }
        None if accept.is_some() => return Err(CoapError::not_acceptable()),
        None => {}
    }
    if let Some(max_age) = state.max_age() {
        response.message.set_uint_option(CoapOption::MaxAge, max_age);
    }
    Ok(response)
}

fn render_outcome<Endpoint: Send + Sync + 'static>(
    request: &Request<Endpoint>,
    render: Render<Endpoint>,
) -> Result<Response, CoapError> {
    match render {
        Render::Status(code) => {
            let mut response = request.new_response();
            response.set_status(code);
            Ok(response)
        }
        Render::Response(response) => Ok(response),
        Render::Unsupported => Err(CoapError::method_not_allowed()),
        other => Err(CoapError::internal(format!("Unexpected handler result {other:?}"))),
    }
}
