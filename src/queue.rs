//! The durable per-pair command queue, over Redis Streams.
//!
//! Each pair owns a stream named `order_book.<pair_lowercase>` and a single
//! consumer group. `XREADGROUP COUNT 1` gives the prefetch=1 backpressure;
//! `XACK` is the manual ack; unacked entries are reclaimed with
//! `XAUTOCLAIM` after a visibility timeout, giving at-least-once redelivery.

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::model::{Order, OrderSide, Pair};

/// A deserialized command body, tagged the way §6 specifies on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    Place { order: PlaceOrder },
    Cancel { order_ids: Vec<Uuid> },
}

/// The wire shape of a place command's order payload (§6). Carries no
/// lifecycle fields — those are assigned once it's admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub side: OrderSide,
    pub volume: Decimal,
    pub remaining_volume: Decimal,
    pub price: Decimal,
    pub base_currency: String,
    pub quote_currency: String,
}

impl PlaceOrder {
    pub fn into_order(self, created_at: DateTime<Utc>) -> Order {
        Order {
            id: self.id,
            user_id: self.user_id,
            created_at,
            side: self.side,
            base_currency: self.base_currency,
            quote_currency: self.quote_currency,
            volume: self.volume,
            remaining_volume: self.remaining_volume,
            price: self.price,
            filled_at: None,
            canceled_at: None,
        }
    }
}

/// One delivered message: its stream entry id (needed to ack or to exclude
/// from the next claim) and the decoded command.
pub struct Delivery {
    pub entry_id: String,
    pub command: Command,
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct StreamConsumer {
    client: Client,
    conn: Option<MultiplexedConnection>,
    stream_key: String,
    group: String,
    consumer_name: String,
    backoff: Duration,
}

impl StreamConsumer {
    pub fn new(redis_url: &str, pair: &Pair, group: &str, consumer_name: &str) -> Result<Self, Error> {
        let client = Client::open(redis_url).map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            client,
            conn: None,
            stream_key: format!("order_book.{}", pair.lowercase()),
            group: group.to_string(),
            consumer_name: consumer_name.to_string(),
            backoff: Duration::from_millis(200),
        })
    }

    async fn connection(&mut self) -> Result<&mut MultiplexedConnection, Error> {
        if self.conn.is_none() {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    self.conn = Some(conn);
                    self.backoff = Duration::from_millis(200);
                }
                Err(e) => {
                    log::warn!(target: "queue", "redis connect failed, retrying in {:?}: {}", self.backoff, e);
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                    return Err(Error::Transport(e.to_string()));
                }
            }
        }
        Ok(self.conn.as_mut().expect("just initialized"))
    }

    /// `XGROUP CREATE ... MKSTREAM`, tolerating the group already existing.
    pub async fn ensure_group(&mut self) -> Result<(), Error> {
        let stream_key = self.stream_key.clone();
        let group = self.group.clone();
        let conn = self.connection().await?;
        let result: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&stream_key, &group, "$")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => {
                self.conn = None;
                Err(Error::Transport(e.to_string()))
            }
        }
    }

    /// Block up to `poll_interval` for the next undelivered entry.
    pub async fn next_command(
        &mut self,
        poll_interval: Duration,
    ) -> Result<Option<Delivery>, Error> {
        let stream_key = self.stream_key.clone();
        let group = self.group.clone();
        let consumer_name = self.consumer_name.clone();
        let conn = self.connection().await?;
        let opts = StreamReadOptions::default()
            .group(&group, &consumer_name)
            .count(1)
            .block(poll_interval.as_millis() as usize);
        let reply: StreamReadReply = match conn
            .xread_options(&[&stream_key], &[">"], &opts)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                self.conn = None;
                return Err(Error::Transport(e.to_string()));
            }
        };
        Ok(decode_first(reply))
    }

    /// Reclaim entries idle longer than `min_idle` from crashed consumers.
    pub async fn reclaim_stale(&mut self, min_idle: Duration) -> Result<Vec<Delivery>, Error> {
        let stream_key = self.stream_key.clone();
        let group = self.group.clone();
        let consumer_name = self.consumer_name.clone();
        let conn = self.connection().await?;
        let reply: redis::streams::StreamAutoClaimReply = match conn
            .xautoclaim_options(
                &stream_key,
                &group,
                &consumer_name,
                min_idle.as_millis() as i64,
                "0",
                redis::streams::StreamAutoClaimOptions::default(),
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.conn = None;
                return Err(Error::Transport(e.to_string()));
            }
        };
        Ok(reply
            .claimed
            .into_iter()
            .filter_map(|entry| decode_entry(&entry.id, &entry.map))
            .collect())
    }

    pub async fn ack(&mut self, entry_id: &str) -> Result<(), Error> {
        let stream_key = self.stream_key.clone();
        let group = self.group.clone();
        let conn = self.connection().await?;
        let _: i64 = conn
            .xack(&stream_key, &group, &[entry_id])
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(())
    }
}

fn decode_first(reply: StreamReadReply) -> Option<Delivery> {
    reply
        .keys
        .into_iter()
        .flat_map(|k| k.ids)
        .find_map(|entry| decode_entry(&entry.id, &entry.map))
}

fn decode_entry(
    entry_id: &str,
    map: &std::collections::HashMap<String, redis::Value>,
) -> Option<Delivery> {
    let payload = map.get("payload")?;
    let redis::Value::BulkString(bytes) = payload else {
        return None;
    };
    match serde_json::from_slice::<Command>(bytes) {
        Ok(command) => Some(Delivery { entry_id: entry_id.to_string(), command }),
        Err(e) => {
            log::error!(target: "queue", "undecodable command at {}: {}", entry_id, e);
            None
        }
    }
}
