use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use bproxy_protocol::RelayEvent;
use bproxy_relay::{ChannelSignal, DequeueError, QueueItem, RelayChannel, RequestMultiplexer};

fn chunk(request_id: &str, data: &str) -> RelayEvent {
    RelayEvent::Chunk {
        request_id: request_id.to_string(),
        data: data.to_string(),
    }
}

#[tokio::test]
async fn events_arrive_in_order() {
    let mux = RequestMultiplexer::new();
    let mut queue = mux.create_queue("r1");

    mux.deliver(chunk("r1", "a"));
    mux.deliver(chunk("r1", "b"));
    mux.deliver(RelayEvent::StreamClose {
        request_id: "r1".to_string(),
    });

    let wait = Duration::from_millis(100);
    assert!(matches!(queue.recv(wait).await.unwrap(), QueueItem::Chunk(d) if d == "a"));
    assert!(matches!(queue.recv(wait).await.unwrap(), QueueItem::Chunk(d) if d == "b"));
    assert!(matches!(
        queue.recv(wait).await.unwrap(),
        QueueItem::StreamEnd
    ));
}

#[tokio::test]
async fn remove_queue_is_idempotent_and_fails_pending_recv() {
    let mux = Arc::new(RequestMultiplexer::new());
    let mut queue = mux.create_queue("r1");

    let waiter = tokio::spawn(async move { queue.recv(Duration::from_secs(5)).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    mux.remove_queue("r1");
    mux.remove_queue("r1");

    let result = timeout(Duration::from_millis(200), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err(), DequeueError::Closed);
}

#[tokio::test]
async fn events_for_unknown_ids_are_dropped() {
    let mux = RequestMultiplexer::new();
    let mut queue = mux.create_queue("known");

    mux.deliver(chunk("unknown", "x"));
    mux.deliver(chunk("known", "y"));

    let item = queue.recv(Duration::from_millis(100)).await.unwrap();
    assert!(matches!(item, QueueItem::Chunk(d) if d == "y"));
}

#[tokio::test]
async fn recv_times_out_without_events() {
    let mux = RequestMultiplexer::new();
    let mut queue = mux.create_queue("r1");
    let result = queue.recv(Duration::from_millis(30)).await;
    assert_eq!(result.unwrap_err(), DequeueError::Timeout);
}

#[tokio::test]
async fn reconnect_within_grace_keeps_queues_alive() {
    let mux = Arc::new(RequestMultiplexer::new());
    let channel = RelayChannel::new(mux.clone(), Duration::from_millis(100));
    let mut signals = channel.subscribe();

    let (tx1, _rx1) = mpsc::unbounded_channel();
    let id1 = channel.register(tx1);
    assert_eq!(signals.recv().await.unwrap(), ChannelSignal::ConnectionAdded);

    let mut queue = mux.create_queue("r1");
    channel.unregister(id1);
    assert!(!channel.is_connected());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let (tx2, _rx2) = mpsc::unbounded_channel();
    channel.register(tx2);
    assert_eq!(signals.recv().await.unwrap(), ChannelSignal::ConnectionAdded);

    // Past the original grace deadline; the queue must still be routable.
    tokio::time::sleep(Duration::from_millis(120)).await;
    mux.deliver(chunk("r1", "still-here"));
    let item = queue.recv(Duration::from_millis(100)).await.unwrap();
    assert!(matches!(item, QueueItem::Chunk(d) if d == "still-here"));
}

#[tokio::test]
async fn grace_expiry_closes_queues_and_signals_loss() {
    let mux = Arc::new(RequestMultiplexer::new());
    let channel = RelayChannel::new(mux.clone(), Duration::from_millis(50));
    let mut signals = channel.subscribe();

    let (tx, _rx) = mpsc::unbounded_channel();
    let id = channel.register(tx);
    assert_eq!(signals.recv().await.unwrap(), ChannelSignal::ConnectionAdded);

    let mut queue = mux.create_queue("r1");
    channel.unregister(id);

    let signal = timeout(Duration::from_millis(500), signals.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(signal, ChannelSignal::ConnectionLost);

    let result = queue.recv(Duration::from_millis(100)).await;
    assert_eq!(result.unwrap_err(), DequeueError::Closed);
    assert_eq!(mux.live_count(), 0);
}

#[tokio::test]
async fn outbound_frames_go_to_the_primary_connection() {
    let mux = Arc::new(RequestMultiplexer::new());
    let channel = RelayChannel::new(mux, Duration::from_millis(50));

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let id1 = channel.register(tx1);
    channel.register(tx2);

    channel.send_cancel("r1").unwrap();
    let sent = rx1.recv().await.unwrap();
    assert!(sent.contains("cancel_request"));
    assert!(rx2.try_recv().is_err());

    // Primary role moves to the oldest survivor.
    channel.unregister(id1);
    channel.send_cancel("r2").unwrap();
    let sent = rx2.recv().await.unwrap();
    assert!(sent.contains("r2"));
}

#[tokio::test]
async fn unparsable_frames_are_dropped_silently() {
    let mux = Arc::new(RequestMultiplexer::new());
    let channel = RelayChannel::new(mux.clone(), Duration::from_millis(50));
    let mut queue = mux.create_queue("r1");

    channel.handle_text("not json");
    channel.handle_text(r#"{"event_type":"chunk","data":"no id"}"#);
    channel.handle_text(r#"{"event_type":"chunk","request_id":"r1","data":"ok"}"#);

    let item = queue.recv(Duration::from_millis(100)).await.unwrap();
    assert!(matches!(item, QueueItem::Chunk(d) if d == "ok"));
}
