//! The per-pair order book worker: the single writer that owns one
//! trading pair's book, matcher, settlement, candle aggregator and
//! publisher hand-off (§2, §4.6, §5).

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::watch;

use crate::book::Book;
use crate::candles::{self, CandleAggregator};
use crate::config::WorkerConfig;
use crate::error::Error;
use crate::matcher;
use crate::model::{CandleUnit, Market, Order, Pair, AVAILABLE_CANDLE_UNITS};
use crate::persistence;
use crate::publisher::{self, BalanceEvent, BookSnapshot, Event, MarketEvent, PublisherHandle, TradeEvent};
use crate::queue::{Command, Delivery, StreamConsumer};
use crate::settlement::{self, BalanceSheet, FeeSchedule};

const RECLAIM_EVERY: u32 = 50;
const RECLAIM_MIN_IDLE: Duration = Duration::from_secs(30);
const BOOK_DEPTH: usize = 10;

pub struct PairWorker {
    pool: PgPool,
    market: Market,
    book: Book,
    aggregator: CandleAggregator,
    fees: FeeSchedule,
    consumer: StreamConsumer,
    publisher: PublisherHandle,
    config: WorkerConfig,
    loop_count: u32,
}

impl PairWorker {
    /// Acquires the pair ownership check (§4.6 step 1; a best-effort,
    /// point-in-time `SELECT ... FOR UPDATE SKIP LOCKED` rather than a
    /// lock held for the worker's lifetime — §1's non-goals explicitly
    /// leave true HA mutual exclusion to an external supervisor), loads
    /// the resting book and seeds the candle aggregator from storage.
    pub async fn start(
        pool: PgPool,
        queue_url: &str,
        bus_url: &str,
        pair: Pair,
        config: WorkerConfig,
    ) -> Result<Option<Self>, Error> {
        let Some(market) = persistence::try_lock_market(&pool, &pair).await? else {
            log::warn!(target: "engine", "pair {} already owned by another worker, skipping", pair);
            return Ok(None);
        };

        let mut book = Book::new();
        for (sequence, order) in persistence::load_active_orders(&pool, &pair).await?.into_iter().enumerate() {
            book.insert_with_sequence(order, sequence as u64);
        }

        let mut aggregator = CandleAggregator::new(pair.clone(), config.candle_flush_every);
        let last_candles = persistence::fetch_last_candles(&pool, &pair).await?;
        for unit in AVAILABLE_CANDLE_UNITS {
            let unit = CandleUnit(unit);
            aggregator.seed(unit, last_candles.get(&unit).cloned());
        }
        repair_candle_gaps(&pool, &pair, &mut aggregator, &last_candles).await?;

        let mut fees = FeeSchedule::new();
        for fee_override in persistence::load_fee_overrides(&pool, &pair).await? {
            fees.put(fee_override);
        }

        let consumer_name = format!("{}-{}", config.consumer_group, uuid::Uuid::new_v4());
        let mut consumer = StreamConsumer::new(queue_url, &pair, &config.consumer_group, &consumer_name)?;
        consumer.ensure_group().await?;

        let publisher = publisher::spawn(bus_url, &pair);

        log::info!(target: "engine", "worker for {} started: {} resting orders", pair, book.len());

        Ok(Some(Self {
            pool,
            market,
            book,
            aggregator,
            fees,
            consumer,
            publisher,
            config,
            loop_count: 0,
        }))
    }

    /// The worker's main loop. Runs until `shutdown` fires, finishing the
    /// in-flight message first (§5's cooperative shutdown).
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                delivery = self.consumer.next_command(poll_interval) => {
                    match delivery {
                        Ok(Some(delivery)) => self.handle_delivery(delivery).await,
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!(target: "queue", "transport error, backing off: {}", e);
                        }
                    }
                }
            }

            self.loop_count += 1;
            if self.loop_count % RECLAIM_EVERY == 0 {
                match self.consumer.reclaim_stale(RECLAIM_MIN_IDLE).await {
                    Ok(reclaimed) => {
                        for delivery in reclaimed {
                            self.handle_delivery(delivery).await;
                        }
                    }
                    Err(e) => log::warn!(target: "queue", "reclaim failed: {}", e),
                }
            }
        }

        for candle in self.aggregator.flush_all() {
            if let Err(e) = self.persist_candle(&candle).await {
                log::error!(target: "candles", "flush on shutdown failed: {}", e);
            }
        }
        log::info!(target: "engine", "worker for {} shut down", self.market.pair());
    }

    async fn handle_delivery(&mut self, delivery: Delivery) {
        let entry_id = delivery.entry_id.clone();
        match self.process_command(delivery.command).await {
            Ok(()) => {
                if let Err(e) = self.consumer.ack(&entry_id).await {
                    log::warn!(target: "queue", "ack failed for {}: {}", entry_id, e);
                }
            }
            Err(e) => {
                if e.should_ack() {
                    log::warn!(target: "engine", "command {} rejected, acking: {}", entry_id, e);
                    if let Err(e) = self.consumer.ack(&entry_id).await {
                        log::warn!(target: "queue", "ack failed for {}: {}", entry_id, e);
                    }
                } else {
                    log::error!(target: "engine", "command {} failed transiently, leaving unacked: {}", entry_id, e);
                    self.reload_book().await;
                }
            }
        }
    }

    async fn reload_book(&mut self) {
        self.book.clear();
        match persistence::load_active_orders(&self.pool, &self.market.pair()).await {
            Ok(orders) => {
                for (sequence, order) in orders.into_iter().enumerate() {
                    self.book.insert_with_sequence(order, sequence as u64);
                }
            }
            Err(e) => log::error!(target: "engine", "failed to reload book after rollback: {}", e),
        }
    }

    async fn process_command(&mut self, command: Command) -> Result<(), Error> {
        match command {
            Command::Place { order } => self.process_place(order.into_order(Utc::now())).await,
            Command::Cancel { order_ids } => self.process_cancel(order_ids).await,
        }
    }

    async fn process_place(&mut self, order: Order) -> Result<(), Error> {
        if order.base_currency != self.market.base_currency || order.quote_currency != self.market.quote_currency {
            return Err(Error::MarketNotFound { base: order.base_currency, quote: order.quote_currency });
        }

        let now = Utc::now();
        let Some(outcome) = matcher::match_order(&mut self.book, &self.market, order, now)? else {
            return Ok(());
        };

        let maker_orders: HashMap<_, _> =
            outcome.touched_makers.iter().map(|o| (o.id, o.clone())).collect();

        let mut keys = Vec::new();
        let fee_user = crate::model::fee_user_id();
        for user_id in maker_orders.values().map(|o| o.user_id).chain([outcome.incoming.user_id, fee_user]) {
            keys.push((user_id, self.market.base_currency.clone()));
            keys.push((user_id, self.market.quote_currency.clone()));
        }

        let mut db = self.pool.begin().await.map_err(Error::Database)?;
        let loaded = persistence::load_balances_for_update(&mut db, &keys).await?;
        let mut sheet = BalanceSheet::new();
        for balance in loaded.into_values() {
            sheet.put(balance);
        }

        let transactions = match settlement::settle_batch(
            &outcome.trades,
            &self.market,
            &outcome.incoming,
            &maker_orders,
            &self.fees,
            &mut sheet,
        ) {
            Ok(transactions) => transactions,
            Err(e) => {
                db.rollback().await.map_err(Error::Database)?;
                self.reload_book().await;
                return Err(e);
            }
        };

        persistence::insert_order(&mut db, &outcome.incoming).await?;
        for maker in maker_orders.values() {
            persistence::update_order_fill(&mut db, maker).await?;
        }
        for trade in &outcome.trades {
            persistence::insert_trade(&mut db, trade).await?;
        }
        for tx in &transactions {
            persistence::insert_transaction(&mut db, tx).await?;
        }
        let touched_balances = sheet.into_touched();
        for (_, balance) in &touched_balances {
            persistence::upsert_balance(&mut db, balance).await?;
        }

        // Applied to a scratch copy, not `self.aggregator`, so a persistence
        // failure below leaves the live aggregator untouched rather than
        // desynced from a trade the database never actually committed.
        let mut aggregator = self.aggregator.clone();
        let mut candles_to_persist = Vec::new();
        for trade in &outcome.trades {
            candles_to_persist.extend(aggregator.apply_trade(trade, now));
        }
        for candle in &candles_to_persist {
            persistence::upsert_candle(&mut db, candle).await?;
        }

        let new_price = outcome.trades.last().map(|t| t.price);
        let price_changed = match new_price {
            Some(price) if price != self.market.current_price => {
                persistence::update_market_current_price(&mut db, &self.market.pair(), price).await?;
                true
            }
            _ => false,
        };

        db.commit().await.map_err(Error::Database)?;

        self.aggregator = aggregator;
        if let Some(price) = new_price {
            self.market.current_price = price;
        }

        self.publish_place_results(&outcome.trades, price_changed, &touched_balances);
        Ok(())
    }

    async fn process_cancel(&mut self, order_ids: Vec<uuid::Uuid>) -> Result<(), Error> {
        let mut db = self.pool.begin().await.map_err(Error::Database)?;
        let now = Utc::now();
        let canceled = persistence::cancel_active_orders(&mut db, &order_ids, now).await?;
        if canceled.is_empty() {
            db.commit().await.map_err(Error::Database)?;
            return Ok(());
        }

        let keys: Vec<_> = canceled
            .iter()
            .map(|(_, user_id, currency, _)| (*user_id, currency.clone()))
            .collect();
        let loaded = persistence::load_balances_for_update(&mut db, &keys).await?;
        let mut sheet = BalanceSheet::new();
        for balance in loaded.into_values() {
            sheet.put(balance);
        }
        for (_, user_id, currency, remaining_locked_amount) in &canceled {
            sheet.adjust_locked(*user_id, currency, -*remaining_locked_amount);
        }
        if let Err(e) = sheet.validate() {
            db.rollback().await.map_err(Error::Database)?;
            return Err(e);
        }
        for (_, balance) in sheet.into_touched() {
            persistence::upsert_balance(&mut db, &balance).await?;
        }
        db.commit().await.map_err(Error::Database)?;

        for (order_id, ..) in &canceled {
            self.book.remove(*order_id);
        }
        Ok(())
    }

    fn publish_place_results(
        &self,
        trades: &[crate::model::Trade],
        price_changed: bool,
        touched_balances: &[((uuid::Uuid, String), crate::model::Balance)],
    ) {
        let book_snapshot = BookSnapshot {
            sell: self.book.top_n(crate::model::OrderSide::Sell, BOOK_DEPTH),
            buy: self.book.top_n(crate::model::OrderSide::Buy, BOOK_DEPTH),
        };
        self.publisher.publish(Event::Order { pair: self.market.pair().to_string(), book: book_snapshot });

        if !touched_balances.is_empty() {
            let mut by_user: HashMap<uuid::Uuid, HashMap<String, BalanceEvent>> = HashMap::new();
            for ((user_id, currency), balance) in touched_balances {
                by_user.entry(*user_id).or_default().insert(
                    currency.clone(),
                    BalanceEvent { amount: balance.amount, locked_amount: balance.locked_amount },
                );
            }
            self.publisher.publish(Event::Balance(by_user));
        }

        if !trades.is_empty() {
            let trade_events: Vec<TradeEvent> = trades
                .iter()
                .map(|t| TradeEvent {
                    id: t.id,
                    pair: t.pair().to_string(),
                    created_at: t.created_at,
                    side: t.side,
                    price: t.price,
                    volume: t.volume,
                })
                .collect();
            self.publisher.publish(Event::Trade(trade_events));
        }

        if price_changed {
            self.publisher.publish_global(Event::Market(vec![MarketEvent {
                pair: self.market.pair().to_string(),
                current_price: self.market.current_price,
            }]));
        }
    }

    async fn persist_candle(&self, candle: &crate::model::Candle) -> Result<(), Error> {
        let mut db = self.pool.begin().await.map_err(Error::Database)?;
        persistence::upsert_candle(&mut db, candle).await?;
        db.commit().await.map_err(Error::Database)?;
        Ok(())
    }
}

/// Gap repair at startup (§4.5): synthesize fragments from any trade newer
/// than the last persisted 1-minute candle and merge them forward.
async fn repair_candle_gaps(
    pool: &PgPool,
    pair: &Pair,
    aggregator: &mut CandleAggregator,
    last_candles: &HashMap<CandleUnit, crate::model::Candle>,
) -> Result<(), Error> {
    let one_minute = CandleUnit(1);
    let Some(last) = last_candles.get(&one_minute) else {
        return Ok(());
    };
    let trades = persistence::fetch_trades_since(pool, pair, last.timestamp).await?;
    if trades.is_empty() {
        return Ok(());
    }
    let fragments = candles::synthesize_from_trades(pair, one_minute, &trades);
    if let Some(repaired) = candles::merge_fragments(
        std::iter::once(last.clone()).chain(fragments).collect(),
    ) {
        aggregator.seed(one_minute, Some(repaired));
    }
    Ok(())
}
