use super::*;
use std::sync::atomic::AtomicUsize;
use tokio::sync::mpsc;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(100);

fn channel() -> (Arc<MemoryTransport>, CommandChannel) {
    let transport = Arc::new(MemoryTransport::new());
    let channel = CommandChannel::new(transport.clone(), CONNECT_TIMEOUT, PUBLISH_TIMEOUT);
    (transport, channel)
}

/// Callback that forwards every payload into a test-side receiver
fn forwarding_callback() -> (Callback, mpsc::UnboundedReceiver<(String, String)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: Callback = Arc::new(move |address: &str, payload: &str| {
        let _ = tx.send((address.to_string(), payload.to_string()));
    });
    (callback, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<(String, String)>) -> (String, String) {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("callback not invoked in time")
        .expect("callback channel closed")
}

#[tokio::test]
async fn test_connect_succeeds() {
    let (transport, channel) = channel();

    let connected = channel.connect().await.unwrap();

    assert_eq!(connected.resubscribed, 0);
    assert!(channel.is_connected());
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn test_connect_times_out() {
    let (transport, channel) = channel();
    transport.hang_connections(true);

    let err = channel.connect().await.unwrap_err();

    assert!(matches!(err, ConnectError::Timeout(t) if t == CONNECT_TIMEOUT));
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn test_connect_refused() {
    let (transport, channel) = channel();
    transport.refuse_connections(true);

    let err = channel.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Refused(_)));
}

#[tokio::test]
async fn test_subscribe_routes_inbound_payloads() {
    let (transport, channel) = channel();
    channel.connect().await.unwrap();

    let (callback, mut rx) = forwarding_callback();
    let subscribed = channel.subscribe("pixelbot.a.status", callback).await.unwrap();
    assert!(!subscribed.replaced);

    assert_eq!(transport.deliver("pixelbot.a.status", "1"), 1);

    let (address, payload) = recv(&mut rx).await;
    assert_eq!(address, "pixelbot.a.status");
    assert_eq!(payload, "1");
    assert_eq!(channel.delivered_count(), 1);
}

#[tokio::test]
async fn test_subscribe_connects_when_disconnected() {
    let (transport, channel) = channel();
    let (callback, mut rx) = forwarding_callback();

    channel.subscribe("pixelbot.b.status", callback).await.unwrap();

    assert!(channel.is_connected());
    transport.deliver("pixelbot.b.status", "hello");
    assert_eq!(recv(&mut rx).await.1, "hello");
}

#[tokio::test]
async fn test_resubscribe_replaces_callback() {
    let (transport, channel) = channel();
    channel.connect().await.unwrap();

    let first_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&first_calls);
    let first: Callback = Arc::new(move |_: &str, _: &str| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    channel.subscribe("pixelbot.c.status", first).await.unwrap();

    let (second, mut rx) = forwarding_callback();
    let subscribed = channel.subscribe("pixelbot.c.status", second).await.unwrap();
    assert!(subscribed.replaced);

    transport.deliver("pixelbot.c.status", "1");
    recv(&mut rx).await;

    assert_eq!(first_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let (transport, channel) = channel();
    let (callback, mut rx) = forwarding_callback();
    channel.subscribe("pixelbot.d.status", callback).await.unwrap();

    transport.drop_connection();
    assert_eq!(transport.deliver("pixelbot.d.status", "lost"), 0);

    let connected = channel.connect().await.unwrap();
    assert_eq!(connected.resubscribed, 1);

    transport.deliver("pixelbot.d.status", "back");
    assert_eq!(recv(&mut rx).await.1, "back");
}

#[tokio::test]
async fn test_unrouted_message_is_discarded() {
    let (_transport, channel) = channel();

    assert_eq!(channel.on_message("pixelbot.x.status", "1"), Dispatch::Unrouted);
    assert_eq!(channel.unrouted_count(), 1);
    assert_eq!(channel.delivered_count(), 0);
}

#[tokio::test]
async fn test_on_message_dispatches_synchronously() {
    let (_transport, channel) = channel();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let callback: Callback = Arc::new(move |_: &str, _: &str| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    channel.subscribe("pixelbot.e.status", callback).await.unwrap();

    assert_eq!(channel.on_message("pixelbot.e.status", "1"), Dispatch::Delivered);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unsubscribe_removes_route() {
    let (_transport, channel) = channel();
    let (callback, _rx) = forwarding_callback();
    channel.subscribe("pixelbot.f.status", callback).await.unwrap();

    assert!(channel.unsubscribe("pixelbot.f.status"));
    assert!(!channel.unsubscribe("pixelbot.f.status"));
    assert_eq!(channel.on_message("pixelbot.f.status", "1"), Dispatch::Unrouted);
}

#[tokio::test]
async fn test_publish_records_payload() {
    let (transport, channel) = channel();
    channel.connect().await.unwrap();

    let sent = channel.publish("pixelbot.a.cmd", "***run", true).await.unwrap();

    assert_eq!(sent.bytes, 6);
    assert!(sent.confirmed);
    assert_eq!(transport.published_to("pixelbot.a.cmd"), vec!["***run"]);
}

#[tokio::test]
async fn test_publish_reconnects_once_after_failure() {
    let (transport, channel) = channel();
    channel.connect().await.unwrap();
    transport.fail_next_publishes(1);

    channel.publish("pixelbot.a.cmd", "***stop", false).await.unwrap();

    assert_eq!(transport.connect_count(), 2);
    assert_eq!(transport.published_to("pixelbot.a.cmd"), vec!["***stop"]);
}

#[tokio::test]
async fn test_publish_connects_when_disconnected() {
    let (transport, channel) = channel();

    channel.publish("pixelbot.a.cmd", "***run", false).await.unwrap();

    assert_eq!(transport.connect_count(), 1);
    assert_eq!(transport.published().len(), 1);
}

#[tokio::test]
async fn test_publish_surfaces_failure_after_retry() {
    let (transport, channel) = channel();
    channel.connect().await.unwrap();
    transport.fail_next_publishes(2);

    let err = channel.publish("pixelbot.a.cmd", "***run", false).await.unwrap_err();

    assert!(matches!(err, PublishError::Transport { .. }));
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn test_publish_surfaces_reconnect_failure() {
    let (transport, channel) = channel();
    channel.connect().await.unwrap();
    transport.drop_connection();
    transport.refuse_connections(true);

    let err = channel.publish("pixelbot.a.cmd", "***run", true).await.unwrap_err();

    assert!(matches!(
        err,
        PublishError::Reconnect {
            source: ConnectError::Refused(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_publish_command_uses_encoded_payload() {
    let (transport, channel) = channel();
    channel.connect().await.unwrap();

    let command = Command::drive(0, 15, 200).unwrap();
    let sent = channel.publish_command("pixelbot.a.cmd", &command).await.unwrap();

    assert!(sent.confirmed);
    assert_eq!(
        transport.published_to("pixelbot.a.cmd"),
        vec!["***angle=15\n***dist=200"]
    );
}
