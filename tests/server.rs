mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use coap_engine::app::{self, Render, Request, Resource, ResourceState};
use coap_engine::msg::option::block_value;
use coap_engine::msg::{
    CoapOption, ContentFormat, Message, MessageClass, MessageType, RequestType, ResponseType,
};
use common::{directory_app, start_server, Endpoint, Hub};

fn request(method: RequestType, mtype: MessageType, path: &str, message_id: u16, token: u8) -> Message {
    let mut message = Message::request(method, mtype, path);
    message.header.message_id = message_id;
    message.set_token(vec![token]);
    message
}

fn con(method: RequestType, path: &str, message_id: u16, token: u8) -> Message {
    request(method, MessageType::Confirmable, path, message_id, token)
}

fn ack_for(peer: &common::RawPeer, message: &Message) {
    let mut ack = Message::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = message.header.message_id;
    peer.send(&ack);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_lists_directory() {
    let _ = env_logger::builder().is_test(true).try_init();
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut client = hub.raw_peer(10);

    client.send(&con(RequestType::Get, ".well-known/core", 1, 0xa1));
    let response = client.recv().await;
    assert_eq!(response.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(response.header.message_id, 1);
    assert_eq!(response.get_token(), &[0xa1]);
    assert_eq!(response.status(), Some(ResponseType::Content));
    assert_eq!(
        response.get_content_format(),
        Some(ContentFormat::ApplicationLinkFormat)
    );

    let payload = String::from_utf8(response.payload).unwrap();
    let links: BTreeSet<_> = payload.split(',').collect();
    let expected: BTreeSet<_> = [
        r#"</rd>;rt="core.rd";ct=40"#,
        r#"</rd-lookup>;rt="core.rd-lookup""#,
        r#"</rd-lookup/res>;rt="core.rd-lookup-res";ct=40;obs"#,
        r#"</rd-lookup/ep>;rt="core.rd-lookup-ep";ct=40"#,
    ]
    .into_iter()
    .collect();
    assert_eq!(links, expected);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_query_filter() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut client = hub.raw_peer(10);

    let mut query = con(RequestType::Get, ".well-known/core", 1, 1);
    query.add_query("rt=core.rd-lookup-*");
    client.send(&query);
    let payload = String::from_utf8(client.recv().await.payload).unwrap();
    assert!(payload.contains("</rd-lookup/res>"));
    assert!(payload.contains("</rd-lookup/ep>"));
    assert!(!payload.contains("</rd>"));
}

#[tokio::test(start_paused = true)]
async fn test_registration() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut client = hub.raw_peer(10);

    client.send(&con(RequestType::Post, "rd", 1, 1));
    let response = client.recv().await;
    assert_eq!(response.status(), Some(ResponseType::BadRequest));

    let mut register = con(RequestType::Post, "rd", 2, 2);
    register.add_query("ep=node1");
    register.add_query("lt=10");
    client.send(&register);
    assert_eq!(client.recv().await.status(), Some(ResponseType::BadRequest));

    let mut register = con(RequestType::Post, "rd", 3, 3);
    register.add_query("ep=node1");
    register.set_content_format(ContentFormat::ApplicationLinkFormat);
    register.payload = b"</sensors/temp>;rt=\"temperature\"".to_vec();
    client.send(&register);
    let response = client.recv().await;
    assert_eq!(response.status(), Some(ResponseType::Created));
    assert_eq!(response.get_location_path().unwrap(), vec!["rd", "1"]);

    client.send(&con(RequestType::Get, "rd/1", 4, 4));
    let response = client.recv().await;
    assert_eq!(response.status(), Some(ResponseType::Content));
    assert_eq!(response.payload, b"</sensors/temp>;rt=\"temperature\"");
}

#[derive(Clone)]
struct FixedSlot;

#[async_trait]
impl Resource<Endpoint> for FixedSlot {
    async fn render_post(&self, request: &Request<Endpoint>, _state: &ResourceState) -> Render<Endpoint> {
        let mut slot = ResourceState::new("slot");
        slot.set_payload(ContentFormat::TextPlain, request.original.payload.clone());
        Render::Created(slot, Box::new(app::BasicResource))
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_refuses_existing_path() {
    let hub = Hub::default();
    let app = app::new().resource(app::resource("slots").handler(FixedSlot));
    start_server(&hub, app).await;
    let mut client = hub.raw_peer(10);

    let mut post = con(RequestType::Post, "slots", 1, 1);
    post.payload = b"first".to_vec();
    client.send(&post);
    let response = client.recv().await;
    assert_eq!(response.status(), Some(ResponseType::Created));
    assert_eq!(response.get_location_path().unwrap(), vec!["slot"]);

    let mut post = con(RequestType::Post, "slots", 2, 2);
    post.payload = b"second".to_vec();
    client.send(&post);
    assert_eq!(client.recv().await.status(), Some(ResponseType::Forbidden));

    client.send(&con(RequestType::Get, "slot", 3, 3));
    assert_eq!(client.recv().await.payload, b"first");
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_request_answered_once() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut client = hub.raw_peer(10);

    let mut register = con(RequestType::Post, "rd", 77, 1);
    register.add_query("ep=node1");
    client.send(&register);
    let first = client.recv().await;
    client.send(&register);
    let second = client.recv().await;
    assert_eq!(first, second);
    assert_eq!(first.status(), Some(ResponseType::Created));

    // Only one registration was created.
    client.send(&con(RequestType::Get, "rd/2", 78, 2));
    assert_eq!(client.recv().await.status(), Some(ResponseType::NotFound));
}

#[tokio::test(start_paused = true)]
async fn test_conditional_put() {
    let hub = Hub::default();
    let app = app::new().resource(
        app::resource("config").payload(ContentFormat::TextPlain, "v1"),
    );
    start_server(&hub, app).await;
    let mut client = hub.raw_peer(10);

    let mut put = con(RequestType::Put, "config", 1, 1);
    put.add_option(CoapOption::IfMatch, b"nope".to_vec());
    put.payload = b"v2".to_vec();
    client.send(&put);
    assert_eq!(
        client.recv().await.status(),
        Some(ResponseType::PreconditionFailed)
    );

    client.send(&con(RequestType::Get, "config", 2, 2));
    let current = client.recv().await;
    assert_eq!(current.payload, b"v1");
    let etag = current.get_etag().unwrap().to_vec();

    let mut put = con(RequestType::Put, "config", 3, 3);
    put.add_option(CoapOption::IfMatch, etag);
    put.payload = b"v2".to_vec();
    client.send(&put);
    let response = client.recv().await;
    assert_eq!(response.status(), Some(ResponseType::Changed));

    let mut create_only = con(RequestType::Put, "config", 4, 4);
    create_only.add_option(CoapOption::IfNoneMatch, Vec::new());
    client.send(&create_only);
    assert_eq!(
        client.recv().await.status(),
        Some(ResponseType::PreconditionFailed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_delete() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut client = hub.raw_peer(10);

    client.send(&con(RequestType::Delete, "rd-lookup/ep", 1, 1));
    assert_eq!(client.recv().await.status(), Some(ResponseType::Deleted));
    client.send(&con(RequestType::Get, "rd-lookup/ep", 2, 2));
    assert_eq!(client.recv().await.status(), Some(ResponseType::NotFound));
    client.send(&con(RequestType::Get, "rd-lookup/res", 3, 3));
    assert_eq!(client.recv().await.status(), Some(ResponseType::Content));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_method_and_path() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut client = hub.raw_peer(10);

    client.send(&con(RequestType::Get, "missing", 1, 1));
    assert_eq!(client.recv().await.status(), Some(ResponseType::NotFound));
    client.send(&con(RequestType::Fetch, "rd", 2, 2));
    assert_eq!(
        client.recv().await.status(),
        Some(ResponseType::MethodNotAllowed)
    );
    client.send(&con(RequestType::Post, "nowhere/child", 3, 3));
    assert_eq!(
        client.recv().await.status(),
        Some(ResponseType::MethodNotAllowed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_accept_mismatch_not_acceptable() {
    let hub = Hub::default();
    let app = app::new().resource(app::resource("config").payload(ContentFormat::TextPlain, "v1"));
    start_server(&hub, app).await;
    let mut client = hub.raw_peer(10);

    let mut get = con(RequestType::Get, "config", 1, 1);
    get.set_accept(ContentFormat::ApplicationJSON);
    client.send(&get);
    let response = client.recv().await;
    assert_eq!(response.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(response.status(), Some(ResponseType::NotAcceptable));

    // A format number nobody has registered cannot be served either.
    let mut get = con(RequestType::Get, "config", 2, 2);
    get.set_uint_option(CoapOption::Accept, 65000);
    client.send(&get);
    assert_eq!(client.recv().await.status(), Some(ResponseType::NotAcceptable));

    let mut get = con(RequestType::Get, "config", 3, 3);
    get.set_accept(ContentFormat::TextPlain);
    client.send(&get);
    let response = client.recv().await;
    assert_eq!(response.status(), Some(ResponseType::Content));
    assert_eq!(response.payload, b"v1");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_critical_option_rejected() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut client = hub.raw_peer(10);

    let mut get = con(RequestType::Get, "rd-lookup/ep", 0x4242, 0x33);
    get.add_option(CoapOption::Unknown(2051), vec![1]);
    client.send(&get);
    let response = client.recv().await;
    assert_eq!(response.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(response.header.message_id, 0x4242);
    assert_eq!(response.get_token(), &[0x33]);
    assert_eq!(response.status(), Some(ResponseType::BadOption));

    // Unknown elective options are ignored.
    let mut get = con(RequestType::Get, "rd-lookup/ep", 0x4243, 0x34);
    get.add_option(CoapOption::Unknown(2050), vec![1]);
    client.send(&get);
    assert_eq!(client.recv().await.status(), Some(ResponseType::Content));
}

#[tokio::test(start_paused = true)]
async fn test_observe_notifies_on_change() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut observer = hub.raw_peer(10);
    let mut writer = hub.raw_peer(11);

    let mut observe = request(RequestType::Get, MessageType::NonConfirmable, "rd-lookup/res", 1, 0x0b);
    observe.set_observe_value(0);
    observer.send(&observe);
    let registered = observer.recv().await;
    assert_eq!(registered.header.get_type(), MessageType::NonConfirmable);
    assert_eq!(registered.status(), Some(ResponseType::Content));
    let first_seq = registered.get_observe_value().unwrap();

    let mut put = con(RequestType::Put, "rd-lookup/res", 1, 1);
    put.set_content_format(ContentFormat::ApplicationLinkFormat);
    put.payload = b"</a>".to_vec();
    writer.send(&put);
    assert_eq!(writer.recv().await.status(), Some(ResponseType::Changed));

    let notification = observer.recv().await;
    assert_eq!(notification.get_token(), &[0x0b]);
    assert_eq!(notification.header.get_type(), MessageType::NonConfirmable);
    assert_eq!(notification.get_observe_value(), Some(first_seq + 1));
    assert_eq!(notification.payload, b"</a>");

    // Deregistration stops further notifications.
    let mut cancel = request(RequestType::Get, MessageType::NonConfirmable, "rd-lookup/res", 2, 0x0b);
    cancel.set_observe_value(1);
    observer.send(&cancel);
    let response = observer.recv().await;
    assert_eq!(response.get_observe_value(), None);

    let mut put = con(RequestType::Put, "rd-lookup/res", 2, 2);
    put.payload = b"</b>".to_vec();
    writer.send(&put);
    writer.recv().await;
    assert!(observer.recv_within(Duration::from_secs(5)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_observe_pmin_coalesces() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut observer = hub.raw_peer(10);
    let mut writer = hub.raw_peer(11);

    let mut observe = request(RequestType::Get, MessageType::NonConfirmable, "rd-lookup/res", 1, 7);
    observe.set_observe_value(0);
    observe.add_query("pmin=10");
    observer.send(&observe);
    observer.recv().await;

    for (i, payload) in [&b"</a>"[..], &b"</b>"[..]].into_iter().enumerate() {
        let mut put = con(RequestType::Put, "rd-lookup/res", i as u16 + 1, 1);
        put.payload = payload.to_vec();
        writer.send(&put);
        writer.recv().await;
    }

    assert!(observer.recv_within(Duration::from_secs(5)).await.is_none());
    let notification = observer
        .recv_within(Duration::from_secs(10))
        .await
        .expect("deferred notification");
    assert_eq!(notification.payload, b"</b>");
    assert!(observer.recv_within(Duration::from_secs(30)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_observe_delete_sends_not_found() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut observer = hub.raw_peer(10);
    let mut writer = hub.raw_peer(11);

    let mut observe = request(RequestType::Get, MessageType::NonConfirmable, "rd-lookup/res", 1, 9);
    observe.set_observe_value(0);
    observer.send(&observe);
    observer.recv().await;

    writer.send(&con(RequestType::Delete, "rd-lookup/res", 1, 1));
    assert_eq!(writer.recv().await.status(), Some(ResponseType::Deleted));

    let last = observer.recv().await;
    assert_eq!(last.get_token(), &[9]);
    assert_eq!(last.status(), Some(ResponseType::NotFound));
    assert_eq!(last.get_observe_value(), None);
}

#[tokio::test(start_paused = true)]
async fn test_observe_reset_cancels_relation() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut observer = hub.raw_peer(10);
    let mut writer = hub.raw_peer(11);

    let mut observe = con(RequestType::Get, "rd-lookup/res", 1, 0x0c);
    observe.set_observe_value(0);
    observer.send(&observe);
    let registered = observer.recv().await;
    assert_eq!(registered.header.get_type(), MessageType::Acknowledgement);
    assert!(registered.get_observe_value().is_some());

    let mut put = con(RequestType::Put, "rd-lookup/res", 1, 1);
    put.payload = b"</a>".to_vec();
    writer.send(&put);
    writer.recv().await;

    let notification = observer.recv().await;
    assert_eq!(notification.header.get_type(), MessageType::Confirmable);
    assert_eq!(notification.get_token(), &[0x0c]);
    let mut reset = Message::new();
    reset.header.set_type(MessageType::Reset);
    reset.header.code = MessageClass::Empty;
    reset.header.message_id = notification.header.message_id;
    observer.send(&reset);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut put = con(RequestType::Put, "rd-lookup/res", 2, 2);
    put.payload = b"</b>".to_vec();
    writer.send(&put);
    assert_eq!(writer.recv().await.status(), Some(ResponseType::Changed));

    // Neither a retransmission of the reset notification nor a new one.
    assert!(observer.recv_within(Duration::from_secs(60)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_observe_pmax_fallback() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut observer = hub.raw_peer(10);

    let mut observe = request(RequestType::Get, MessageType::NonConfirmable, "rd-lookup/res", 1, 0x0d);
    observe.set_observe_value(0);
    observe.add_query("pmax=20");
    observer.send(&observe);
    let registered = observer.recv().await;
    let first_seq = registered.get_observe_value().unwrap();

    // Nothing changes, yet the observer hears from the resource before pmax runs out.
    let fallback = observer
        .recv_within(Duration::from_secs(20))
        .await
        .expect("fallback notification");
    assert_eq!(fallback.get_token(), &[0x0d]);
    assert_eq!(fallback.status(), Some(ResponseType::Content));
    assert_eq!(fallback.get_observe_value(), Some(first_seq + 1));
    assert_eq!(fallback.payload, registered.payload);

    let again = observer
        .recv_within(Duration::from_secs(20))
        .await
        .expect("second fallback notification");
    assert_eq!(again.get_observe_value(), Some(first_seq + 2));
}

#[tokio::test(start_paused = true)]
async fn test_non_notifications_escalate_to_confirmable() {
    let hub = Hub::default();
    let app = app::new().max_non_notifications(2).resource(
        app::resource("level")
            .observable()
            .payload(ContentFormat::TextPlain, "0"),
    );
    start_server(&hub, app).await;
    let mut observer = hub.raw_peer(10);
    let mut writer = hub.raw_peer(11);

    let mut observe = request(RequestType::Get, MessageType::NonConfirmable, "level", 1, 0x0e);
    observe.set_observe_value(0);
    observer.send(&observe);
    observer.recv().await;

    let mut types = Vec::new();
    let mut last = None;
    for i in 1..=3u16 {
        let mut put = con(RequestType::Put, "level", i, i as u8);
        put.payload = i.to_string().into_bytes();
        writer.send(&put);
        writer.recv().await;
        let notification = observer.recv().await;
        assert_eq!(notification.payload, i.to_string().into_bytes());
        types.push(notification.header.get_type());
        last = Some(notification);
    }
    assert_eq!(
        types,
        vec![
            MessageType::NonConfirmable,
            MessageType::NonConfirmable,
            MessageType::Confirmable
        ]
    );

    ack_for(&observer, &last.unwrap());
    assert!(observer.recv_within(Duration::from_secs(60)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_ping_and_stray_messages() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut client = hub.raw_peer(10);

    let mut ping = Message::new();
    ping.header.set_type(MessageType::Confirmable);
    ping.header.code = MessageClass::Empty;
    ping.header.message_id = 0x1234;
    client.send(&ping);
    let reset = client.recv().await;
    assert_eq!(reset.header.get_type(), MessageType::Reset);
    assert_eq!(reset.header.message_id, 0x1234);

    // A Confirmable response nobody asked for is rejected.
    let mut stray = Message::new();
    stray.header.set_type(MessageType::Confirmable);
    stray.header.code = MessageClass::Response(ResponseType::Content);
    stray.header.message_id = 0x2222;
    client.send(&stray);
    let reset = client.recv().await;
    assert_eq!(reset.header.get_type(), MessageType::Reset);
    assert_eq!(reset.header.message_id, 0x2222);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_request_rejected() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let mut client = hub.raw_peer(10);

    // CON GET with one byte token 0x7f and a payload marker but no payload.
    client.send_bytes(&[0x41, 0x01, 0x00, 0x05, 0x7f, 0xff]);
    let response = client.recv().await;
    assert_eq!(response.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(response.header.message_id, 5);
    assert_eq!(response.get_token(), &[0x7f]);
    assert_eq!(response.status(), Some(ResponseType::BadRequest));

    // Wrong version is dropped silently.
    client.send_bytes(&[0x81, 0x01, 0x00, 0x06, 0x7f]);
    assert!(client.recv_within(Duration::from_secs(1)).await.is_none());
}

#[derive(Clone)]
struct SlowResource;

#[async_trait]
impl Resource<Endpoint> for SlowResource {
    async fn render_get(&self, request: &Request<Endpoint>, _state: &ResourceState) -> Render<Endpoint> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        let mut response = request.new_response();
        response.message.payload = b"done".to_vec();
        Render::Response(response)
    }
}

#[tokio::test(start_paused = true)]
async fn test_separate_response() {
    let hub = Hub::default();
    let app = app::new().resource(app::resource("slow").handler(SlowResource));
    start_server(&hub, app).await;
    let mut client = hub.raw_peer(10);

    client.send(&con(RequestType::Get, "slow", 40, 4));
    let ack = client.recv_within(Duration::from_secs(2)).await.unwrap();
    assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(ack.header.code, MessageClass::Empty);
    assert_eq!(ack.header.message_id, 40);

    let response = client.recv_within(Duration::from_secs(5)).await.unwrap();
    assert_eq!(response.header.get_type(), MessageType::Confirmable);
    assert_ne!(response.header.message_id, 40);
    assert_eq!(response.get_token(), &[4]);
    assert_eq!(response.payload, b"done");
    ack_for(&client, &response);

    // Acknowledged, so nothing is retransmitted.
    assert!(client.recv_within(Duration::from_secs(60)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_blockwise_download() {
    let hub = Hub::default();
    let body = vec![b'x'; 150];
    let app = app::new()
        .block_size(64)
        .resource(app::resource("big").payload(ContentFormat::ApplicationOctetStream, body.clone()));
    start_server(&hub, app).await;
    let mut client = hub.raw_peer(10);

    let mut received = Vec::new();
    for num in 0..3u32 {
        let mut get = con(RequestType::Get, "big", 100 + num as u16, 5);
        if num > 0 {
            get.set_block2(block_value(num, false, 64).unwrap());
        }
        client.send(&get);
        let response = client.recv().await;
        assert_eq!(response.status(), Some(ResponseType::Content));
        let block = response.get_block2().unwrap().unwrap();
        assert_eq!(block.num as u32, num);
        assert_eq!(block.more, num < 2);
        assert_eq!(response.get_uint_option(CoapOption::Size2), Some(150));
        received.extend_from_slice(&response.payload);
    }
    assert_eq!(received, body);
}

#[tokio::test(start_paused = true)]
async fn test_blockwise_upload() {
    let hub = Hub::default();
    let app = app::new().resource(app::resource("upload").payload(ContentFormat::ApplicationOctetStream, ""));
    start_server(&hub, app).await;
    let mut client = hub.raw_peer(10);

    let body: Vec<u8> = (0..40u8).collect();
    for (num, chunk) in body.chunks(16).enumerate() {
        let more = (num + 1) * 16 < body.len();
        let mut put = con(RequestType::Put, "upload", 200 + num as u16, 6);
        put.set_content_format(ContentFormat::ApplicationOctetStream);
        put.set_block1(block_value(num as u32, more, 16).unwrap());
        put.payload = chunk.to_vec();
        client.send(&put);
        let response = client.recv().await;
        let expected = if more {
            ResponseType::Continue
        } else {
            ResponseType::Changed
        };
        assert_eq!(response.status(), Some(expected));
        assert_eq!(response.get_block1().unwrap().unwrap().num as usize, num);
    }

    client.send(&con(RequestType::Get, "upload", 300, 7));
    assert_eq!(client.recv().await.payload, body);
}
