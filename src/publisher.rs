//! The fan-out bus publisher: after a commit, sends structured deltas to
//! Redis pub/sub. One dedicated task per pair drains a bounded channel so
//! the matcher never blocks on network I/O; sends are fire-and-forget and
//! failures are logged and swallowed (§7).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{OrderSide, Pair};

const GLOBAL_CHANNEL: &str = "market";
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Event {
    Order { pair: String, book: BookSnapshot },
    Trade(Vec<TradeEvent>),
    Balance(HashMap<Uuid, HashMap<String, BalanceEvent>>),
    Market(Vec<MarketEvent>),
}

#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub sell: Vec<(Decimal, Decimal)>,
    pub buy: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeEvent {
    pub id: Uuid,
    pub pair: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub side: OrderSide,
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceEvent {
    pub amount: Decimal,
    pub locked_amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketEvent {
    pub pair: String,
    #[serde(rename = "currentPrice")]
    pub current_price: Decimal,
}

/// The matcher-facing handle: cloneable, backed by a bounded channel.
#[derive(Clone)]
pub struct PublisherHandle {
    pair_channel: String,
    sender: mpsc::Sender<(String, Event)>,
}

impl PublisherHandle {
    /// Queue `event` for the pair's own channel, dropping it (and logging)
    /// if the publisher task has fallen behind rather than blocking the
    /// matcher (§4.7, §5).
    pub fn publish(&self, event: Event) {
        if let Err(e) = self.sender.try_send((self.pair_channel.clone(), event)) {
            log::warn!(target: "publisher", "publisher channel full/closed, dropping event: {}", e);
        }
    }

    /// Queue a `market` event on the process-wide global channel.
    pub fn publish_global(&self, event: Event) {
        if let Err(e) = self.sender.try_send((GLOBAL_CHANNEL.to_string(), event)) {
            log::warn!(target: "publisher", "publisher channel full/closed, dropping event: {}", e);
        }
    }
}

/// Spawns the dedicated drain task for one pair and returns the handle the
/// worker hands off to.
pub fn spawn(redis_url: &str, pair: &Pair) -> PublisherHandle {
    let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
    let pair_channel = format!("order_book.{}", pair.lowercase());
    let redis_url = redis_url.to_string();
    tokio::spawn(drain(redis_url, receiver));
    PublisherHandle { pair_channel, sender }
}

async fn drain(redis_url: String, mut receiver: mpsc::Receiver<(String, Event)>) {
    let client = match Client::open(redis_url.as_str()) {
        Ok(client) => client,
        Err(e) => {
            log::error!(target: "publisher", "invalid bus url, publisher task exiting: {}", e);
            return;
        }
    };
    let mut conn = None;
    while let Some((channel, event)) = receiver.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!(target: "publisher", "failed to serialize event: {}", e);
                continue;
            }
        };
        if conn.is_none() {
            conn = client.get_multiplexed_async_connection().await.ok();
        }
        let Some(active) = conn.as_mut() else {
            log::warn!(target: "publisher", "bus unreachable, dropping event on {}", channel);
            continue;
        };
        let result: redis::RedisResult<()> = active.publish(&channel, &payload).await;
        if let Err(e) = result {
            log::warn!(target: "publisher", "publish to {} failed: {}", channel, e);
            conn = None;
        }
    }
}
