//! Enrichment and broadcast of change events.
//!
//! Events are spread over a fixed set of workers by key, so events for one
//! topic are handled in the order they arrived while different topics
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use tickhub_hub::BroadcastHub;
use tickhub_schema::{PairId, ServerMessage, TopicId};
use tickhub_store::RecordLookup;

use crate::error::BridgeError;
use crate::messages::{Channel, ChangeEvent};
use crate::metrics;

/// Turns one change event into broadcasts.
///
/// Funding and open interest notifications carry a pair id. The pair to
/// topic map is loaded by `refresh_pairs`, never per event, so a pair with
/// no subscribers costs no store query.
pub struct EventHandler {
    hub: BroadcastHub,
    lookup: Arc<dyn RecordLookup>,
    pair_topics: RwLock<HashMap<PairId, Vec<TopicId>>>,
}

impl EventHandler {
    pub fn new(hub: BroadcastHub, lookup: Arc<dyn RecordLookup>) -> Self {
        Self {
            hub,
            lookup,
            pair_topics: RwLock::new(HashMap::new()),
        }
    }

    /// Reload the pair to topic map. Returns the number of pairs.
    ///
    /// On failure the previous map stays in place.
    pub async fn refresh_pairs(&self) -> Result<usize, BridgeError> {
        let pairs = self.lookup.pair_topics().await?;
        let count = pairs.len();
        *self.pair_topics.write().unwrap_or_else(PoisonError::into_inner) = pairs;
        debug!(pairs = count, "Pair topic map refreshed");
        Ok(count)
    }

    /// Enrich and broadcast. Returns the number of client sends.
    pub async fn handle(&self, event: &ChangeEvent) -> Result<usize, BridgeError> {
        match event.channel {
            Channel::Candle => {
                let topic = TopicId(event.key);
                if self.hub.subscriber_count(topic) == 0 {
                    metrics::inc_skipped(event.channel.name());
                    return Ok(0);
                }
                match self.lookup.candle_update(topic, event.time).await? {
                    Some(update) => Ok(self.hub.broadcast(topic, &ServerMessage::Candle(update)).await),
                    None => {
                        warn!(topic = %topic, time = %event.time, "Changed candle not found");
                        Ok(0)
                    }
                }
            }
            Channel::Funding | Channel::OpenInterest => {
                let topics = self.topics_for_pair(PairId(event.key));
                let subscribed = self.hub.subscribed_among(&topics);
                if subscribed.is_empty() {
                    metrics::inc_skipped(event.channel.name());
                    return Ok(0);
                }
                let mut sent = 0;
                for topic in subscribed {
                    let message = match event.channel {
                        Channel::Funding => self
                            .lookup
                            .funding_update(topic, event.time)
                            .await?
                            .map(ServerMessage::Funding),
                        _ => self
                            .lookup
                            .open_interest_update(topic, event.time)
                            .await?
                            .map(ServerMessage::OpenInterest),
                    };
                    match message {
                        Some(message) => sent += self.hub.broadcast(topic, &message).await,
                        None => {
                            warn!(topic = %topic, pair = event.key, time = %event.time, "Changed row not found")
                        }
                    }
                }
                Ok(sent)
            }
        }
    }

    fn topics_for_pair(&self, pair: PairId) -> Vec<TopicId> {
        self.pair_topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pair)
            .cloned()
            .unwrap_or_default()
    }
}

/// Keyed worker pool in front of an `EventHandler`
pub struct Dispatcher {
    queues: Vec<mpsc::Sender<ChangeEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(handler: Arc<EventHandler>, workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            queues.push(tx);
            handles.push(tokio::spawn(run_worker(worker, Arc::clone(&handler), rx)));
        }
        Self {
            queues,
            workers: handles,
        }
    }

    /// Queue an event without waiting. A full queue drops the event.
    pub fn dispatch(&self, event: ChangeEvent) -> bool {
        let slot = event.key.unsigned_abs() as usize % self.queues.len();
        match self.queues[slot].try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = event.channel.name(), key = event.key, error = %e, "Worker queue full, notification dropped");
                metrics::inc_dropped(event.channel.name());
                false
            }
        }
    }

    /// Let queued events drain, then stop the workers
    pub async fn shutdown(self) {
        drop(self.queues);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Bridge worker panicked");
            }
        }
    }
}

async fn run_worker(worker: usize, handler: Arc<EventHandler>, mut rx: mpsc::Receiver<ChangeEvent>) {
    while let Some(event) = rx.recv().await {
        match handler.handle(&event).await {
            Ok(sent) => {
                debug!(worker, channel = event.channel.name(), key = event.key, sent, "Notification handled")
            }
            Err(e) => {
                error!(worker, channel = event.channel.name(), key = event.key, time = %event.time, error = %e, "Notification handling failed");
                metrics::inc_failed(event.channel.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;
    use rust_decimal_macros::dec;
    use tickhub_hub::{ClientSink, ConnectionId, HubError};
    use tickhub_schema::{Candle, FundingSnapshot, Topic};
    use tickhub_store::{MemoryStore, RecordWriter};

    #[derive(Default)]
    struct Sink {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClientSink for Sink {
        async fn send_text(&self, text: Arc<str>) -> Result<(), HubError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn topic(id: i32, pair: i32, interval: &str) -> Topic {
        Topic {
            id: TopicId(id),
            pair_id: PairId(pair),
            exchange: "hyperliquid".to_string(),
            base: "ETH".to_string(),
            quote: "USD".to_string(),
            market_type: "perps".to_string(),
            interval: interval.to_string(),
        }
    }

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    async fn setup() -> (BroadcastHub, Arc<MemoryStore>, EventHandler) {
        let store = Arc::new(MemoryStore::new());
        store.add_topic(topic(11, 3, "1m")).await;
        store.add_topic(topic(12, 3, "5m")).await;
        store.add_topic(topic(13, 3, "1h")).await;
        store
            .upsert_candles(&[Candle {
                time: t(),
                topic: TopicId(11),
                open: dec!(10),
                high: dec!(11),
                low: dec!(9),
                close: dec!(10),
                volume: dec!(1),
                num_trades: None,
            }])
            .await
            .unwrap();
        store
            .upsert_funding(&[FundingSnapshot {
                time: t(),
                pair: PairId(3),
                funding_rate: dec!(0.0001),
                premium: None,
                mark_price: Some(dec!(3000)),
                index_price: None,
                oracle_price: None,
                mid_price: None,
                next_funding_time: None,
            }])
            .await
            .unwrap();

        let hub = BroadcastHub::new(10, Duration::from_secs(30));
        let handler = EventHandler::new(hub.clone(), store.clone());
        assert_eq!(handler.refresh_pairs().await.unwrap(), 1);
        (hub, store, handler)
    }

    fn event(channel: Channel, key: i32) -> ChangeEvent {
        ChangeEvent {
            channel,
            key,
            time: t(),
        }
    }

    #[tokio::test]
    async fn test_funding_fans_out_to_subscribed_interval_topics() {
        let (hub, _store, handler) = setup().await;
        let a = Arc::new(Sink::default());
        let b = Arc::new(Sink::default());
        hub.connect(ConnectionId(1), a.clone());
        hub.connect(ConnectionId(2), b.clone());
        hub.subscribe(ConnectionId(1), &[TopicId(11)]);
        hub.subscribe(ConnectionId(2), &[TopicId(12), TopicId(11)]);

        let sent = handler.handle(&event(Channel::Funding, 3)).await.unwrap();
        assert_eq!(sent, 3);

        let received: Vec<serde_json::Value> = b
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect();
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|m| m["type"] == "funding"));
        assert_eq!(a.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_pair_skips_enrichment() {
        let (_hub, store, handler) = setup().await;
        let before = store.enrichment_queries();
        assert_eq!(handler.handle(&event(Channel::OpenInterest, 3)).await.unwrap(), 0);
        assert_eq!(handler.handle(&event(Channel::Candle, 11)).await.unwrap(), 0);
        assert_eq!(store.enrichment_queries(), before);
    }

    #[tokio::test]
    async fn test_pair_events_without_subscribers_never_query_the_store() {
        let (_hub, store, handler) = setup().await;
        let before = store.enrichment_queries();
        let skipped = metrics::skipped(Channel::Funding.name());

        for pair in [3, 3, 4, 5, 3] {
            assert_eq!(handler.handle(&event(Channel::Funding, pair)).await.unwrap(), 0);
        }
        assert_eq!(store.enrichment_queries(), before);
        assert!(metrics::skipped(Channel::Funding.name()) >= skipped + 5);
    }

    #[tokio::test]
    async fn test_pairs_added_after_refresh_are_picked_up() {
        let (hub, store, handler) = setup().await;
        store.add_topic(topic(21, 4, "1m")).await;
        store
            .upsert_funding(&[FundingSnapshot {
                time: t(),
                pair: PairId(4),
                funding_rate: dec!(0.0003),
                premium: None,
                mark_price: None,
                index_price: None,
                oracle_price: None,
                mid_price: None,
                next_funding_time: None,
            }])
            .await
            .unwrap();
        let sink = Arc::new(Sink::default());
        hub.connect(ConnectionId(1), sink.clone());
        hub.subscribe(ConnectionId(1), &[TopicId(21)]);

        assert_eq!(handler.handle(&event(Channel::Funding, 4)).await.unwrap(), 0);
        assert_eq!(handler.refresh_pairs().await.unwrap(), 2);
        assert_eq!(handler.handle(&event(Channel::Funding, 4)).await.unwrap(), 1);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_map() {
        let (hub, store, handler) = setup().await;
        hub.connect(ConnectionId(1), Arc::new(Sink::default()));
        hub.subscribe(ConnectionId(1), &[TopicId(13)]);

        store.set_unavailable(true);
        assert!(handler.refresh_pairs().await.is_err());
        store.set_unavailable(false);
        assert_eq!(handler.handle(&event(Channel::Funding, 3)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_row_sends_nothing() {
        let (hub, store, handler) = setup().await;
        hub.connect(ConnectionId(1), Arc::new(Sink::default()));
        hub.subscribe(ConnectionId(1), &[TopicId(12)]);
        let before = store.enrichment_queries();

        assert_eq!(handler.handle(&event(Channel::Candle, 12)).await.unwrap(), 0);
        assert_eq!(store.enrichment_queries(), before + 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let (hub, store, handler) = setup().await;
        hub.connect(ConnectionId(1), Arc::new(Sink::default()));
        hub.subscribe(ConnectionId(1), &[TopicId(11)]);
        store.set_unavailable(true);

        assert!(handler.handle(&event(Channel::Candle, 11)).await.is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_order_and_drains_on_shutdown() {
        let (hub, _store, handler) = setup().await;
        let sink = Arc::new(Sink::default());
        hub.connect(ConnectionId(1), sink.clone());
        hub.subscribe(ConnectionId(1), &[TopicId(11)]);

        let dispatcher = Dispatcher::spawn(Arc::new(handler), 4, 16);
        for _ in 0..5 {
            assert!(dispatcher.dispatch(event(Channel::Candle, 11)));
        }
        dispatcher.shutdown().await;

        assert_eq!(sink.sent.lock().unwrap().len(), 5);
    }
}
