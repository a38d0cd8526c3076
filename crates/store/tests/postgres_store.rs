//! PostgreSQL store tests.
//!
//! Require a scratch database: `DATABASE_URL=postgres://... cargo test -- --ignored`

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use std::time::Duration;

use tickhub_schema::{Candle, FundingSnapshot, PairId, TopicId};
use tickhub_store::{
    create_pool, run_migrations, HistorySource, PgStore, RecordLookup, RecordWriter, TopicSource,
};

async fn setup_test_store() -> (PgStore, i32, i32) {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = create_pool(&url, Some(4)).expect("pool");
    run_migrations(&pool).await.expect("migrations");

    let client = pool.get().await.expect("client");
    client
        .batch_execute(
            "TRUNCATE candles, funding_rates, open_interest, topics, pairs, intervals,
                      market_types, assets, exchanges RESTART IDENTITY CASCADE;
             INSERT INTO exchanges (name) VALUES ('hyperliquid');
             INSERT INTO assets (symbol) VALUES ('BTC'), ('USD');
             INSERT INTO market_types (name) VALUES ('perps');
             INSERT INTO intervals (name, seconds) VALUES ('1m', 60), ('15m', 900);
             INSERT INTO pairs (exchange_id, base_asset_id, quote_asset_id, market_type_id)
                 VALUES (1, 1, 2, 1);
             INSERT INTO topics (pair_id, interval_id) VALUES (1, 1), (1, 2);",
        )
        .await
        .expect("seed");

    (PgStore::new(pool, Duration::from_secs(5)), 1, 1)
}

#[tokio::test]
#[ignore]
async fn test_active_topics_loaded_with_metadata() {
    let (store, _, _) = setup_test_store().await;

    let topics = store.active_topics("hyperliquid").await.unwrap();
    assert_eq!(topics.len(), 2);
    assert_eq!(topics[0].base, "BTC");
    assert_eq!(topics[0].interval, "1m");
    assert_eq!(topics[1].pair_id, topics[0].pair_id);
}

#[tokio::test]
#[ignore]
async fn test_candle_upsert_is_idempotent_and_enriched() {
    let (store, topic, _) = setup_test_store().await;
    let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
    let mut candle = Candle {
        time,
        topic: TopicId(topic),
        open: dec!(100),
        high: dec!(105),
        low: dec!(95),
        close: dec!(102),
        volume: dec!(10),
        num_trades: Some(5),
    };

    store.upsert_candles(&[candle.clone()]).await.unwrap();
    candle.close = dec!(103);
    store.upsert_candles(&[candle]).await.unwrap();

    let update = store
        .candle_update(TopicId(topic), time)
        .await
        .unwrap()
        .expect("row");
    assert_eq!(update.meta.trading_pair, "BTC/USD");
    assert_eq!(update.data.close, dec!(103));

    let history = store.candle_history(&[TopicId(topic)], 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].count, 1);
}

#[tokio::test]
#[ignore]
async fn test_funding_fans_out_to_every_interval() {
    let (store, _, pair) = setup_test_store().await;
    let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 31, 0).unwrap();
    store
        .upsert_funding(&[FundingSnapshot {
            time,
            pair: PairId(pair),
            funding_rate: dec!(0.0002),
            premium: None,
            mark_price: Some(dec!(50000)),
            index_price: None,
            oracle_price: None,
            mid_price: None,
            next_funding_time: None,
        }])
        .await
        .unwrap();

    let pairs = store.pair_topics().await.unwrap();
    let topics = pairs[&PairId(pair)].clone();
    assert_eq!(topics, vec![TopicId(1), TopicId(2)]);
    for topic in topics {
        let update = store.funding_update(topic, time).await.unwrap().expect("row");
        assert_eq!(update.meta.topic_id, topic);
        assert_eq!(update.data.funding_rate, dec!(0.0002));
    }

    let history = store.funding_history(&[TopicId(2)], 5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].meta.interval, "15m");
}
