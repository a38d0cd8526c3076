//! Broadcast hub: connection admission, the subscription index and fan-out.
//!
//! Connections and topics are indexed both ways behind one mutex. Every
//! index change happens under a single lock acquisition with no await in
//! between; sends always happen after the lock is released.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use tickhub_schema::{ServerMessage, TopicId};

use crate::error::HubError;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Write half of one client connection
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send_text(&self, text: Arc<str>) -> Result<(), HubError>;

    /// Called once when the hub drops the connection
    fn on_disconnect(&self) {}
}

struct ConnEntry {
    sink: Arc<dyn ClientSink>,
    topics: HashSet<TopicId>,
    heartbeat: AbortHandle,
}

#[derive(Default)]
struct Index {
    conns: HashMap<ConnectionId, ConnEntry>,
    topics: HashMap<TopicId, HashSet<ConnectionId>>,
}

struct Inner {
    index: Mutex<Index>,
    max_connections: usize,
    heartbeat_interval: Duration,
    next_id: AtomicU64,
}

/// Cheap to clone; all clones share one index.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<Inner>,
}

impl BroadcastHub {
    pub fn new(max_connections: usize, heartbeat_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                index: Mutex::new(Index::default()),
                max_connections,
                heartbeat_interval,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.inner.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    /// Admit a connection and start its heartbeat.
    ///
    /// Returns false, without touching the index, when the hub is full or the
    /// id is already admitted.
    pub fn connect(&self, id: ConnectionId, sink: Arc<dyn ClientSink>) -> bool {
        let count = {
            let mut index = self.lock();
            if index.conns.len() >= self.inner.max_connections {
                drop(index);
                metrics::inc_rejected();
                warn!(conn = %id, max = self.inner.max_connections, "Connection rejected, hub at capacity");
                return false;
            }
            if index.conns.contains_key(&id) {
                return false;
            }
            let heartbeat = tokio::spawn(heartbeat(
                Arc::downgrade(&self.inner),
                id,
                self.inner.heartbeat_interval,
            ))
            .abort_handle();
            index.conns.insert(
                id,
                ConnEntry {
                    sink,
                    topics: HashSet::new(),
                    heartbeat,
                },
            );
            index.conns.len()
        };
        metrics::set_connections(count);
        info!(conn = %id, connections = count, "Client connected");
        true
    }

    /// Returns false if the connection was never admitted
    pub fn subscribe(&self, id: ConnectionId, topic_ids: &[TopicId]) -> bool {
        let mut index = self.lock();
        let Index { conns, topics } = &mut *index;
        let Some(entry) = conns.get_mut(&id) else {
            warn!(conn = %id, "Subscribe from unknown connection ignored");
            return false;
        };
        for &topic in topic_ids {
            entry.topics.insert(topic);
            topics.entry(topic).or_default().insert(id);
        }
        true
    }

    pub fn unsubscribe(&self, id: ConnectionId, topic_ids: &[TopicId]) -> bool {
        let mut index = self.lock();
        let Index { conns, topics } = &mut *index;
        let Some(entry) = conns.get_mut(&id) else {
            return false;
        };
        for topic in topic_ids {
            entry.topics.remove(topic);
            remove_subscriber(topics, *topic, id);
        }
        true
    }

    /// Drop a connection and all its subscriptions. Unknown ids are a no-op.
    pub fn disconnect(&self, id: ConnectionId) {
        let (entry, count) = {
            let mut index = self.lock();
            let Some(entry) = index.conns.remove(&id) else {
                return;
            };
            for topic in &entry.topics {
                remove_subscriber(&mut index.topics, *topic, id);
            }
            (entry, index.conns.len())
        };
        entry.heartbeat.abort();
        entry.sink.on_disconnect();
        metrics::set_connections(count);
        info!(conn = %id, connections = count, "Client disconnected");
    }

    /// Send `message` to every current subscriber of `topic`. Connections
    /// whose write fails are disconnected after all writes complete.
    pub async fn broadcast(&self, topic: TopicId, message: &ServerMessage) -> usize {
        let targets: Vec<(ConnectionId, Arc<dyn ClientSink>)> = {
            let index = self.lock();
            match index.topics.get(&topic) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| index.conns.get(id).map(|e| (*id, Arc::clone(&e.sink))))
                    .collect(),
                None => return 0,
            }
        };
        if targets.is_empty() {
            return 0;
        }

        let text: Arc<str> = match serde_json::to_string(message) {
            Ok(text) => text.into(),
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to serialize broadcast");
                return 0;
            }
        };

        let results = join_all(targets.into_iter().map(|(id, sink)| {
            let text = Arc::clone(&text);
            async move { (id, sink.send_text(text).await) }
        }))
        .await;

        let mut sent = 0;
        for (id, result) in results {
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!(conn = %id, error = %e, "Broadcast write failed");
                    metrics::inc_send_failure();
                    self.disconnect(id);
                }
            }
        }
        metrics::inc_broadcast();
        metrics::add_sent(message.type_name(), sent);
        sent
    }

    /// Write one message to one connection, disconnecting it on failure
    pub async fn send(&self, id: ConnectionId, message: &ServerMessage) -> bool {
        let sink = {
            let index = self.lock();
            index.conns.get(&id).map(|e| Arc::clone(&e.sink))
        };
        let Some(sink) = sink else {
            return false;
        };
        let text: Arc<str> = match serde_json::to_string(message) {
            Ok(text) => text.into(),
            Err(e) => {
                error!(conn = %id, error = %e, "Failed to serialize message");
                return false;
            }
        };
        match sink.send_text(text).await {
            Ok(()) => {
                metrics::add_sent(message.type_name(), 1);
                true
            }
            Err(e) => {
                debug!(conn = %id, error = %e, "Write failed");
                metrics::inc_send_failure();
                self.disconnect(id);
                false
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().conns.len()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.lock().conns.contains_key(&id)
    }

    pub fn subscriber_count(&self, topic: TopicId) -> usize {
        self.lock().topics.get(&topic).map_or(0, HashSet::len)
    }

    /// The given topics that have at least one subscriber
    pub fn subscribed_among(&self, candidates: &[TopicId]) -> Vec<TopicId> {
        let index = self.lock();
        candidates
            .iter()
            .copied()
            .filter(|t| index.topics.contains_key(t))
            .collect()
    }

    pub fn topic_count(&self) -> usize {
        self.lock().topics.len()
    }

    pub fn subscriptions(&self, id: ConnectionId) -> Vec<TopicId> {
        let index = self.lock();
        let mut topics: Vec<TopicId> = index
            .conns
            .get(&id)
            .map(|e| e.topics.iter().copied().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Disconnect every client
    pub fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.lock().conns.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
    }
}

fn remove_subscriber(
    topics: &mut HashMap<TopicId, HashSet<ConnectionId>>,
    topic: TopicId,
    id: ConnectionId,
) {
    if let Some(subscribers) = topics.get_mut(&topic) {
        subscribers.remove(&id);
        if subscribers.is_empty() {
            topics.remove(&topic);
        }
    }
}

async fn heartbeat(inner: Weak<Inner>, id: ConnectionId, every: Duration) {
    loop {
        tokio::time::sleep(every).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let hub = BroadcastHub { inner };
        if !hub.send(id, &ServerMessage::ping()).await {
            debug!(conn = %id, "Heartbeat failed, connection dropped");
            return;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;

    fn hub(max: usize) -> BroadcastHub {
        BroadcastHub::new(max, Duration::from_secs(30))
    }

    fn pong() -> ServerMessage {
        ServerMessage::pong()
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let hub = hub(100);
        for _ in 0..100 {
            assert!(hub.connect(hub.next_connection_id(), RecordingSink::new()));
        }
        assert_eq!(hub.connection_count(), 100);

        let rejected = hub.next_connection_id();
        assert!(!hub.connect(rejected, RecordingSink::new()));
        assert_eq!(hub.connection_count(), 100);
        assert!(!hub.is_connected(rejected));

        hub.disconnect(ConnectionId(1));
        assert!(hub.connect(rejected, RecordingSink::new()));
        assert_eq!(hub.connection_count(), 100);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_exactly_current_subscribers() {
        let hub = hub(10);
        let (a, b, c) = (RecordingSink::new(), RecordingSink::new(), RecordingSink::new());
        hub.connect(ConnectionId(1), a.clone());
        hub.connect(ConnectionId(2), b.clone());
        hub.connect(ConnectionId(3), c.clone());

        hub.subscribe(ConnectionId(1), &[TopicId(5)]);
        hub.subscribe(ConnectionId(2), &[TopicId(5), TopicId(6)]);
        hub.subscribe(ConnectionId(3), &[TopicId(5)]);
        hub.unsubscribe(ConnectionId(3), &[TopicId(5)]);

        assert_eq!(hub.broadcast(TopicId(5), &pong()).await, 2);
        assert_eq!(a.count_of("pong"), 1);
        assert_eq!(b.count_of("pong"), 1);
        assert_eq!(c.count_of("pong"), 0);

        hub.disconnect(ConnectionId(1));
        assert_eq!(hub.broadcast(TopicId(5), &pong()).await, 1);
        assert_eq!(a.count_of("pong"), 1);
    }

    #[tokio::test]
    async fn test_failed_write_disconnects_after_broadcast() {
        let hub = hub(10);
        let good = RecordingSink::new();
        let bad = RecordingSink::failing();
        hub.connect(ConnectionId(1), good.clone());
        hub.connect(ConnectionId(2), bad.clone());
        hub.subscribe(ConnectionId(1), &[TopicId(5)]);
        hub.subscribe(ConnectionId(2), &[TopicId(5), TopicId(9)]);

        assert_eq!(hub.broadcast(TopicId(5), &pong()).await, 1);
        assert!(!hub.is_connected(ConnectionId(2)));
        assert!(bad.disconnected.load(Ordering::SeqCst));
        assert_eq!(hub.subscriber_count(TopicId(5)), 1);
        assert_eq!(hub.subscriber_count(TopicId(9)), 0);
        assert_eq!(good.count_of("pong"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_a_noop() {
        let hub = hub(10);
        hub.connect(ConnectionId(1), RecordingSink::new());
        hub.subscribe(ConnectionId(1), &[TopicId(5)]);

        hub.disconnect(ConnectionId(1));
        hub.disconnect(ConnectionId(1));
        hub.disconnect(ConnectionId(42));

        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_topics_are_pruned() {
        let hub = hub(10);
        hub.connect(ConnectionId(1), RecordingSink::new());
        hub.connect(ConnectionId(2), RecordingSink::new());
        hub.subscribe(ConnectionId(1), &[TopicId(5), TopicId(6)]);
        hub.subscribe(ConnectionId(2), &[TopicId(5)]);

        hub.unsubscribe(ConnectionId(1), &[TopicId(5), TopicId(6)]);
        assert_eq!(hub.topic_count(), 1);
        assert_eq!(hub.subscriber_count(TopicId(5)), 1);
        assert_eq!(hub.subscribed_among(&[TopicId(5), TopicId(6)]), vec![TopicId(5)]);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_connection_is_ignored() {
        let hub = hub(10);
        assert!(!hub.subscribe(ConnectionId(7), &[TopicId(5)]));
        assert_eq!(hub.subscriber_count(TopicId(5)), 0);
    }

    #[tokio::test]
    async fn test_send_to_single_connection() {
        let hub = hub(10);
        let sink = RecordingSink::new();
        hub.connect(ConnectionId(1), sink.clone());

        assert!(hub.send(ConnectionId(1), &pong()).await);
        assert!(!hub.send(ConnectionId(2), &pong()).await);

        sink.fail.store(true, Ordering::SeqCst);
        assert!(!hub.send(ConnectionId(1), &pong()).await);
        assert!(!hub.is_connected(ConnectionId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_and_drops_dead_connections() {
        let hub = BroadcastHub::new(10, Duration::from_secs(30));
        let sink = RecordingSink::new();
        hub.connect(ConnectionId(1), sink.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(sink.count_of("ping"), 2);

        sink.fail.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!hub.is_connected(ConnectionId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_heartbeat() {
        let hub = BroadcastHub::new(10, Duration::from_secs(30));
        let sink = RecordingSink::new();
        hub.connect(ConnectionId(1), sink.clone());
        hub.disconnect(ConnectionId(1));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(sink.count_of("ping"), 0);
    }
}
