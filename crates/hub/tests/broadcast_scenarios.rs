use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tickhub_hub::{BroadcastHub, ClientSink, ConnectionId, HubError};
use tickhub_schema::{ServerMessage, TopicId};

#[derive(Default)]
struct CountingSink {
    received: AtomicUsize,
}

#[async_trait]
impl ClientSink for CountingSink {
    async fn send_text(&self, _text: Arc<str>) -> Result<(), HubError> {
        self.received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn full_hub_rejects_without_state_change() {
    let hub = BroadcastHub::new(100, Duration::from_secs(30));
    let sinks: Vec<Arc<CountingSink>> = (0..100).map(|_| Arc::new(CountingSink::default())).collect();

    for sink in &sinks {
        let id = hub.next_connection_id();
        assert!(hub.connect(id, sink.clone()));
        assert!(hub.subscribe(id, &[TopicId(1)]));
    }
    assert_eq!(hub.connection_count(), 100);

    let extra = hub.next_connection_id();
    assert!(!hub.connect(extra, Arc::new(CountingSink::default())));
    assert!(!hub.subscribe(extra, &[TopicId(1)]));
    assert_eq!(hub.connection_count(), 100);
    assert_eq!(hub.subscriber_count(TopicId(1)), 100);

    assert_eq!(hub.broadcast(TopicId(1), &ServerMessage::pong()).await, 100);
    assert!(sinks.iter().all(|s| s.received.load(Ordering::SeqCst) == 1));
}

#[tokio::test]
async fn concurrent_subscribers_all_receive() {
    let hub = BroadcastHub::new(1000, Duration::from_secs(30));
    let mut tasks = Vec::new();
    for _ in 0..50 {
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            let sink = Arc::new(CountingSink::default());
            let id = hub.next_connection_id();
            hub.connect(id, sink.clone());
            hub.subscribe(id, &[TopicId(3), TopicId(4)]);
            (id, sink)
        }));
    }
    let mut clients: Vec<(ConnectionId, Arc<CountingSink>)> = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }

    assert_eq!(hub.subscriber_count(TopicId(3)), 50);
    assert_eq!(hub.broadcast(TopicId(3), &ServerMessage::pong()).await, 50);

    for (id, _) in &clients[..10] {
        hub.disconnect(*id);
    }
    assert_eq!(hub.broadcast(TopicId(4), &ServerMessage::pong()).await, 40);
    assert_eq!(clients[0].1.received.load(Ordering::SeqCst), 1);
    assert_eq!(clients[49].1.received.load(Ordering::SeqCst), 2);

    hub.close_all();
    assert_eq!(hub.connection_count(), 0);
    assert_eq!(hub.topic_count(), 0);
}
