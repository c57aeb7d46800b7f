#![allow(dead_code)]

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use coap_engine::app::{self, AppBuilder, Render, Request, Resource, ResourceState};
use coap_engine::msg::{codec, ContentFormat, Message, ResponseType};
use coap_engine::transport::{BoxedFramedBinding, FramedBinding, Transport, TransportError};
use coap_engine::CoapServer;
use futures::{Sink, Stream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time;

pub type Endpoint = u32;

pub const SERVER: Endpoint = 1;

/// In-process datagram network: every bound endpoint gets an inbox keyed by its id.
#[derive(Default, Clone)]
pub struct Hub {
    inboxes: Arc<Mutex<HashMap<Endpoint, UnboundedSender<(Bytes, Endpoint)>>>>,
}

impl Hub {
    pub fn transport(&self, id: Endpoint) -> MemoryTransport {
        MemoryTransport {
            id,
            hub: self.clone(),
        }
    }

    fn attach(&self, id: Endpoint) -> UnboundedReceiver<(Bytes, Endpoint)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().unwrap().insert(id, tx);
        rx
    }

    fn deliver(&self, from: Endpoint, to: Endpoint, datagram: Bytes) {
        if let Some(inbox) = self.inboxes.lock().unwrap().get(&to) {
            let _ = inbox.send((datagram, from));
        }
    }

    /// A peer driven by hand, for exercising the message layer directly.
    pub fn raw_peer(&self, id: Endpoint) -> RawPeer {
        RawPeer {
            id,
            inbox: self.attach(id),
            hub: self.clone(),
        }
    }
}

pub struct MemoryTransport {
    id: Endpoint,
    hub: Hub,
}

#[async_trait]
impl Transport for MemoryTransport {
    type Endpoint = Endpoint;

    async fn bind(self) -> Result<BoxedFramedBinding<Endpoint>, TransportError> {
        let inbox = self.hub.attach(self.id);
        Ok(Box::pin(MemoryBinding {
            id: self.id,
            inbox,
            hub: self.hub,
        }))
    }
}

struct MemoryBinding {
    id: Endpoint,
    inbox: UnboundedReceiver<(Bytes, Endpoint)>,
    hub: Hub,
}

impl FramedBinding<Endpoint> for MemoryBinding {
    fn mtu(&self) -> Option<u32> {
        None
    }
}

impl Stream for MemoryBinding {
    type Item = Result<(Bytes, Endpoint), (TransportError, Option<Endpoint>)>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbox.poll_recv(cx).map(|item| item.map(Ok))
    }
}

impl Sink<(Bytes, Endpoint)> for MemoryBinding {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, (datagram, to): (Bytes, Endpoint)) -> Result<(), Self::Error> {
        self.hub.deliver(self.id, to, datagram);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

pub struct RawPeer {
    pub id: Endpoint,
    inbox: UnboundedReceiver<(Bytes, Endpoint)>,
    hub: Hub,
}

impl RawPeer {
    pub fn send(&self, message: &Message) {
        self.send_to(SERVER, message);
    }

    pub fn send_to(&self, to: Endpoint, message: &Message) {
        let datagram = codec::encode(message).unwrap();
        self.hub.deliver(self.id, to, datagram);
    }

    pub fn send_bytes(&self, datagram: &[u8]) {
        self.hub
            .deliver(self.id, SERVER, Bytes::copy_from_slice(datagram));
    }

    /// Next message addressed to this peer, or `None` if nothing arrives within `within`.
    pub async fn recv_within(&mut self, within: Duration) -> Option<Message> {
        match time::timeout(within, self.inbox.recv()).await {
            Ok(Some((datagram, _))) => Some(codec::decode(&datagram).unwrap()),
            _ => None,
        }
    }

    pub async fn recv(&mut self) -> Message {
        self.recv_within(Duration::from_secs(1))
            .await
            .expect("no message for raw peer")
    }
}

pub async fn start_server(hub: &Hub, app: AppBuilder<Endpoint>) {
    let server = CoapServer::bind(hub.transport(SERVER)).await.unwrap();
    tokio::spawn(async move {
        let _ = server.serve(app).await;
    });
    tokio::task::yield_now().await;
}

/// Registration endpoint in the style of a CoRE Resource Directory: POST with `?ep=` creates a
/// `rd/<n>` registration holding the posted links.
#[derive(Clone, Default)]
pub struct RegistrationResource {
    next_id: Arc<AtomicUsize>,
}

#[async_trait]
impl Resource<Endpoint> for RegistrationResource {
    async fn render_post(&self, request: &Request<Endpoint>, _state: &ResourceState) -> Render<Endpoint> {
        let queries = request.queries();
        if !queries.contains_key("ep") {
            return Render::Status(ResponseType::BadRequest);
        }
        if let Some(lt) = queries.get("lt") {
            match lt.parse::<u64>() {
                Ok(lt) if (60..=4_294_967_295).contains(&lt) => {}
                _ => return Render::Status(ResponseType::BadRequest),
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut registration = ResourceState::new(&format!("rd/{id}"));
        registration.set_payload(
            ContentFormat::ApplicationLinkFormat,
            request.original.payload.clone(),
        );
        Render::Created(registration, Box::new(app::BasicResource))
    }
}

/// A small resource directory tree: `rd` plus three lookup interfaces.
pub fn directory_app() -> AppBuilder<Endpoint> {
    app::new()
        .resource(
            app::resource("rd")
                .handler(RegistrationResource::default())
                .resource_type("core.rd")
                .content_format(ContentFormat::ApplicationLinkFormat)
                .allow_children(),
        )
        .resource(app::resource("rd-lookup").resource_type("core.rd-lookup"))
        .resource(
            app::resource("rd-lookup/res")
                .resource_type("core.rd-lookup-res")
                .content_format(ContentFormat::ApplicationLinkFormat)
                .observable()
                .payload(ContentFormat::ApplicationLinkFormat, ""),
        )
        .resource(
            app::resource("rd-lookup/ep")
                .resource_type("core.rd-lookup-ep")
                .content_format(ContentFormat::ApplicationLinkFormat)
                .payload(ContentFormat::ApplicationLinkFormat, ""),
        )
}
