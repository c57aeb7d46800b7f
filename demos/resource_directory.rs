use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coap_engine::app::{self, AppBuilder, Render, Request, Resource, ResourceState};
use coap_engine::msg::{ContentFormat, ResponseType};
use coap_engine::{CoapServer, FatalServerError, UdpTransport};
use log::info;
use tokio::time::{self, Instant};

#[tokio::main]
async fn main() -> Result<(), FatalServerError> {
    env_logger::init();
    let server = CoapServer::bind(UdpTransport::new("0.0.0.0:5683")).await?;
    server.serve(build_app()).await
}

fn build_app() -> AppBuilder<SocketAddr> {
    let app = app::new()
        .resource(
            app::resource("/rd")
                // Try `coap-client -m post -e '</temp>' "coap://localhost/rd?ep=node1"`.
                .handler(Registrations::default())
                .resource_type("core.rd")
                .allow_children(),
        )
        .resource(
            app::resource("/uptime")
                // Try `coap-client -s 30 -m get coap://localhost/uptime`.
                .handler(Uptime {
                    started: Instant::now(),
                })
                .resource_type("uptime")
                .observable(),
        );

    let notifier = app.notifier();
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            notifier.notify_change("/uptime");
        }
    });
    app
}

#[derive(Clone, Default)]
struct Registrations {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl Resource<SocketAddr> for Registrations {
    async fn render_post(&self, request: &Request<SocketAddr>, _state: &ResourceState) -> Render<SocketAddr> {
        let queries = request.queries();
        let endpoint = match queries.get("ep") {
            Some(ep) => ep,
            None => return Render::Status(ResponseType::BadRequest),
        };
        let id = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Registered {endpoint} from {} as rd/{id}", request.source);
        let mut registration = ResourceState::new(&format!("rd/{id}"));
        registration.set_payload(
            ContentFormat::ApplicationLinkFormat,
            request.original.payload.clone(),
        );
        Render::Created(registration, Box::new(app::BasicResource))
    }
}

#[derive(Clone)]
struct Uptime {
    started: Instant,
}

#[async_trait]
impl Resource<SocketAddr> for Uptime {
    async fn render_get(&self, request: &Request<SocketAddr>, _state: &ResourceState) -> Render<SocketAddr> {
        let mut response = request.new_response();
        response.message.set_content_format(ContentFormat::TextPlain);
        response.message.payload = format!("{}s", self.started.elapsed().as_secs()).into_bytes();
        Render::Response(response)
    }
}
