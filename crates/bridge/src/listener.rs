//! Dedicated LISTEN connection with keep-alive and reconnect.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_postgres::{AsyncMessage, NoTls, Notification};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tickhub_hub::BroadcastHub;
use tickhub_metadata::BridgeConfig;
use tickhub_store::RecordLookup;

use crate::dispatcher::{Dispatcher, EventHandler};
use crate::error::BridgeError;
use crate::messages::{parse_notification, Channel};
use crate::metrics;

const NOTIFICATION_BUFFER: usize = 1024;
const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

pub struct ChangeBridge {
    database_url: String,
    config: BridgeConfig,
    handler: Arc<EventHandler>,
    listening: Arc<AtomicBool>,
}

impl ChangeBridge {
    pub fn new(
        database_url: impl Into<String>,
        config: BridgeConfig,
        hub: BroadcastHub,
        lookup: Arc<dyn RecordLookup>,
    ) -> Self {
        let handler = Arc::new(EventHandler::new(hub, lookup));
        Self {
            database_url: database_url.into(),
            config,
            handler,
            listening: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while a LISTEN connection is up
    pub fn listening(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.listening)
    }

    /// Listen until `shutdown` is cancelled, reconnecting after any failure.
    pub async fn run(self, shutdown: CancellationToken) {
        let refresher = tokio::spawn(refresh_pairs(
            Arc::clone(&self.handler),
            self.config.pair_refresh_interval(),
            self.config.reconnect_delay(),
            shutdown.child_token(),
        ));
        let dispatcher = Dispatcher::spawn(
            Arc::clone(&self.handler),
            self.config.workers,
            self.config.queue_depth,
        );

        loop {
            let result = self.listen(&dispatcher, &shutdown).await;
            self.listening.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, delay = ?self.config.reconnect_delay(), "Change listener failed, reconnecting");
                    metrics::inc_reconnect();
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
            }
        }

        dispatcher.shutdown().await;
        refresher.abort();
        info!("Change bridge stopped");
    }

    /// One connection's lifetime. Ok only on shutdown.
    async fn listen(
        &self,
        dispatcher: &Dispatcher,
        shutdown: &CancellationToken,
    ) -> Result<(), BridgeError> {
        let connect = timeout(
            self.config.connect_timeout(),
            tokio_postgres::connect(&self.database_url, NoTls),
        );
        let (client, mut connection) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            connected = connect => match connected {
                Ok(result) => result?,
                Err(_) => return Err(BridgeError::ConnectionLost("connect timed out".to_string())),
            },
        };

        // The connection only yields notifications when polled directly
        let (tx, mut rx) = mpsc::channel::<Notification>(NOTIFICATION_BUFFER);
        let mut driver = tokio::spawn(async move {
            let mut messages = futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message? {
                    AsyncMessage::Notification(n) => {
                        if tx.send(n).await.is_err() {
                            break;
                        }
                    }
                    AsyncMessage::Notice(notice) => debug!(notice = %notice, "PostgreSQL notice"),
                    _ => {}
                }
            }
            Ok::<(), tokio_postgres::Error>(())
        });

        let listen_sql: String = Channel::ALL
            .iter()
            .map(|c| format!("LISTEN {};", c.name()))
            .collect();
        if let Err(e) = client.batch_execute(&listen_sql).await {
            driver.abort();
            return Err(e.into());
        }
        self.listening.store(true, Ordering::SeqCst);
        info!(channels = ?Channel::ALL.map(|c| c.name()), "Listening for change notifications");

        let every = self.config.keepalive_interval().max(MIN_KEEPALIVE_INTERVAL);
        let mut keepalive = interval_at(Instant::now() + every, every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = keepalive.tick() => {
                    match timeout(every, client.simple_query("SELECT 1")).await {
                        Ok(Ok(_)) => debug!("Listener keep-alive ok"),
                        Ok(Err(e)) => break Err(BridgeError::Postgres(e)),
                        Err(_) => break Err(BridgeError::ConnectionLost("keep-alive timed out".to_string())),
                    }
                }
                notification = rx.recv() => match notification {
                    Some(n) => self.on_notification(&n, dispatcher),
                    None => {
                        break Err(match (&mut driver).await {
                            Ok(Err(e)) => BridgeError::Postgres(e),
                            _ => BridgeError::ConnectionLost("notification stream ended".to_string()),
                        })
                    }
                }
            }
        };

        driver.abort();
        result
    }

    fn on_notification(&self, notification: &Notification, dispatcher: &Dispatcher) {
        metrics::inc_received(notification.channel());
        match parse_notification(notification.channel(), notification.payload()) {
            Ok(event) => {
                dispatcher.dispatch(event);
            }
            Err(e) => {
                warn!(channel = notification.channel(), payload = notification.payload(), error = %e, "Unreadable notification skipped");
                metrics::inc_failed(notification.channel());
            }
        }
    }
}

/// Keep the handler's pair map current. A failed load is retried after
/// `retry`; until the first load succeeds pair events reach nobody.
async fn refresh_pairs(
    handler: Arc<EventHandler>,
    every: Duration,
    retry: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let wait = match handler.refresh_pairs().await {
            Ok(pairs) => {
                debug!(pairs, "Loaded pair topic map");
                every
            }
            Err(e) => {
                warn!(error = %e, retry = ?retry, "Pair topic map refresh failed");
                retry
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
