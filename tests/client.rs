mod common;

use std::time::Duration;

use coap_engine::app;
use coap_engine::msg::{
    ContentFormat, Message, MessageClass, MessageType, RequestType, ResponseType,
};
use coap_engine::{ClientConfig, ClientError, CoapClient};
use common::{directory_app, start_server, Endpoint, Hub, SERVER};
use futures::executor::block_on;
use tokio::sync::mpsc;
use tokio::time;

async fn client(hub: &Hub, id: Endpoint) -> CoapClient<Endpoint> {
    CoapClient::bind(hub.transport(id), ClientConfig::default())
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_request_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let client = client(&hub, 20).await;

    let response = client.get(SERVER, ".well-known/core").await.unwrap().unwrap();
    assert_eq!(response.status(), Some(ResponseType::Content));
    assert!(String::from_utf8(response.payload).unwrap().contains("</rd>"));

    let mut register = Message::request(RequestType::Post, MessageType::Confirmable, "rd");
    register.add_query("ep=node7");
    register.set_content_format(ContentFormat::ApplicationLinkFormat);
    register.payload = b"</light>".to_vec();
    let response = client
        .send_request(register, SERVER, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), Some(ResponseType::Created));
    let location = response.get_location_path().unwrap().join("/");

    let response = client
        .put(SERVER, &location, b"</light>;rt=\"lamp\"".to_vec())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), Some(ResponseType::Changed));

    let response = client.delete(SERVER, &location).await.unwrap().unwrap();
    assert_eq!(response.status(), Some(ResponseType::Deleted));
    let response = client.get(SERVER, &location).await.unwrap().unwrap();
    assert_eq!(response.status(), Some(ResponseType::NotFound));
    assert_eq!(client.pending_requests().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_non_confirmable_request() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let client = client(&hub, 20).await;

    let request = Message::request(RequestType::Get, MessageType::NonConfirmable, "rd-lookup/res");
    let response = client
        .send_request(request, SERVER, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.header.get_type(), MessageType::NonConfirmable);
    assert_eq!(response.status(), Some(ResponseType::Content));
}

#[tokio::test(start_paused = true)]
async fn test_observe_and_cancel() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let client = client(&hub, 20).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let token = client
        .observe(SERVER, "rd-lookup/res", move |message| {
            let _ = tx.send(message);
        })
        .await
        .unwrap();

    let first = rx.recv().await.unwrap().unwrap();
    assert_eq!(first.status(), Some(ResponseType::Content));
    let first_seq = first.get_observe_value().unwrap();

    client
        .put(SERVER, "rd-lookup/res", b"</a>".to_vec())
        .await
        .unwrap();
    let notification = time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(notification.get_token(), token.as_slice());
    assert_eq!(notification.get_observe_value(), Some(first_seq + 1));
    assert_eq!(notification.payload, b"</a>");

    let response = client
        .cancel_observing(&token, SERVER, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), Some(ResponseType::Content));
    assert_eq!(response.get_observe_value(), None);

    client
        .put(SERVER, "rd-lookup/res", b"</b>".to_vec())
        .await
        .unwrap();
    assert!(time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .map_or(true, |m| m.is_none()));
    assert!(matches!(
        client.cancel_observing(&token, SERVER, false).await,
        Err(ClientError::UnknownToken)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_callback_may_use_client() {
    let hub = Hub::default();
    start_server(&hub, directory_app()).await;
    let client = client(&hub, 20).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client.clone();
    client
        .observe(SERVER, "rd-lookup/res", move |message| {
            if message.is_some() {
                let _ = tx.send(block_on(handle.pending_requests()));
            }
        })
        .await
        .unwrap();

    let pending = time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending, 1);

    // The callback is back in place for the next notification.  The PUT may still be
    // pending while it runs.
    client
        .put(SERVER, "rd-lookup/res", b"</a>".to_vec())
        .await
        .unwrap();
    let pending = time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(pending >= 1);
}

fn content_reply(request: &Message, mtype: MessageType, payload: &[u8]) -> Message {
    let mut message = Message::new();
    message.header.set_type(mtype);
    message.header.code = MessageClass::Response(ResponseType::Content);
    message.set_token(request.get_token().to_vec());
    message.payload = payload.to_vec();
    message
}

#[tokio::test(start_paused = true)]
async fn test_notification_during_cancel_is_not_the_answer() {
    let hub = Hub::default();
    let mut server = hub.raw_peer(SERVER);
    let client = client(&hub, 20).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let token = client
        .observe(SERVER, "temp", move |message| {
            let _ = tx.send(message);
        })
        .await
        .unwrap();

    let register = server.recv().await;
    assert_eq!(register.get_observe_value(), Some(0));
    let mut registered = content_reply(&register, MessageType::Acknowledgement, b"21");
    registered.header.message_id = register.header.message_id;
    registered.set_observe_value(5);
    server.send_to(20, &registered);
    assert_eq!(rx.recv().await.unwrap().unwrap().payload, b"21");

    let canceller = client.clone();
    let cancel =
        tokio::spawn(async move { canceller.cancel_observing(&token, SERVER, true).await });
    let deregister = server.recv().await;
    assert_eq!(deregister.get_observe_value(), Some(1));

    // A notification sent before the server saw the deregistration overtakes its response.
    let mut late = content_reply(&deregister, MessageType::Confirmable, b"22");
    late.header.message_id = 0x7001;
    late.set_observe_value(6);
    server.send_to(20, &late);
    let ack = server.recv().await;
    assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(ack.header.message_id, 0x7001);

    let mut done = content_reply(&deregister, MessageType::Acknowledgement, b"23");
    done.header.message_id = deregister.header.message_id;
    server.send_to(20, &done);

    let response = cancel.await.unwrap().unwrap().unwrap();
    assert_eq!(response.payload, b"23");
    assert_eq!(response.get_observe_value(), None);
    assert!(rx.try_recv().is_err());
    assert_eq!(client.pending_requests().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_ping() {
    let hub = Hub::default();
    start_server(&hub, app::new()).await;
    let client = client(&hub, 20).await;

    assert!(client.ping(SERVER).await.unwrap());
    // Nobody is bound at 99, so every retransmission goes unanswered.
    assert!(!client.ping(99).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_abandons_request() {
    let hub = Hub::default();
    let client = client(&hub, 20).await;

    let request = Message::request(RequestType::Get, MessageType::Confirmable, "anything");
    let response = client
        .send_request(request, 99, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(response.is_none());
    assert_eq!(client.pending_requests().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_releases_waiters() {
    let hub = Hub::default();
    let client = client(&hub, 20).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let request = Message::request(RequestType::Get, MessageType::Confirmable, "anything");
    client
        .send_request_with_callback(request, 99, move |message| {
            let _ = tx.send(message);
        })
        .await
        .unwrap();

    client.stop().await;
    assert!(rx.recv().await.unwrap().is_none());
    assert!(matches!(
        client.get(99, "anything").await,
        Err(ClientError::Stopped)
    ));
}
