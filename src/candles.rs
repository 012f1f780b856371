//! The candle aggregator: folds trades into the open candle of every
//! supported bucket width and decides when to flush to storage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::{Candle, CandleUnit, Pair, Trade, AVAILABLE_CANDLE_UNITS};

/// Default bound on write amplification: the open candle is persisted every
/// this many in-place updates even if its bucket hasn't closed yet.
/// Overridable per worker via configuration.
pub const DEFAULT_FLUSH_EVERY: u32 = 100;

#[derive(Clone)]
struct OpenCandle {
    candle: Candle,
    updates_since_flush: u32,
}

/// One pair's aggregator state: one open candle per supported bucket width.
///
/// Cloneable so a worker can speculatively apply a batch of trades to a copy
/// and only swap it in after the matching persistence writes commit.
#[derive(Clone)]
pub struct CandleAggregator {
    pair: Pair,
    open: HashMap<CandleUnit, OpenCandle>,
    flush_every: u32,
}

impl CandleAggregator {
    pub fn new(pair: Pair, flush_every: u32) -> Self {
        Self { pair, open: HashMap::new(), flush_every }
    }

    /// Seed the aggregator at startup with the most recently persisted
    /// candle for a bucket, if any (cold start, §4.5).
    pub fn seed(&mut self, unit: CandleUnit, candle: Option<Candle>) {
        if let Some(candle) = candle {
            self.open.insert(unit, OpenCandle { candle, updates_since_flush: 0 });
        }
    }

    /// Fold one trade into every bucket's open candle.
    ///
    /// Returns the candles that need to be (re-)persisted this step: a
    /// candle whose bucket just rolled over is flushed once in its final
    /// state before the new bucket starts; a candle updated in place is
    /// flushed (upserted) every `FLUSH_EVERY` updates to bound write
    /// amplification, and remains the open candle afterwards.
    pub fn apply_trade(&mut self, trade: &Trade, now: DateTime<Utc>) -> Vec<Candle> {
        let mut to_persist = Vec::new();
        for unit in AVAILABLE_CANDLE_UNITS {
            let unit = CandleUnit(unit);
            match self.open.get_mut(&unit) {
                Some(open) if trade.created_at < open.candle.next_timestamp() => {
                    open.candle.apply_trade(trade.price, trade.volume, now);
                    open.updates_since_flush += 1;
                    if open.updates_since_flush >= self.flush_every {
                        to_persist.push(open.candle.clone());
                        open.updates_since_flush = 0;
                    }
                }
                Some(open) => {
                    to_persist.push(open.candle.clone());
                    let bucket_ts = unit.bucket_start(trade.created_at);
                    let fresh = Candle::new(
                        &self.pair,
                        unit,
                        bucket_ts,
                        trade.created_at,
                        trade.price,
                        trade.volume,
                        trade.quote_volume(),
                    );
                    to_persist.push(fresh.clone());
                    self.open.insert(unit, OpenCandle { candle: fresh, updates_since_flush: 0 });
                }
                None => {
                    let bucket_ts = unit.bucket_start(trade.created_at);
                    let fresh = Candle::new(
                        &self.pair,
                        unit,
                        bucket_ts,
                        trade.created_at,
                        trade.price,
                        trade.volume,
                        trade.quote_volume(),
                    );
                    to_persist.push(fresh.clone());
                    self.open.insert(unit, OpenCandle { candle: fresh, updates_since_flush: 0 });
                }
            }
        }
        to_persist
    }

    /// Flush every open candle unconditionally, e.g. at cooperative shutdown.
    pub fn flush_all(&self) -> Vec<Candle> {
        self.open.values().map(|o| o.candle.clone()).collect()
    }

    pub fn open_candle(&self, unit: CandleUnit) -> Option<&Candle> {
        self.open.get(&unit).map(|o| &o.candle)
    }
}

/// Gap repair (§4.5): group a trade tape into per-bucket OHLCV fragments,
/// ordered by `(created_at, index)`, then merge them forward onto the last
/// persisted candle. `trades` must already be sorted by `(created_at, index)`.
pub fn synthesize_from_trades(pair: &Pair, unit: CandleUnit, trades: &[Trade]) -> Vec<Candle> {
    let mut candles: Vec<Candle> = Vec::new();
    for trade in trades {
        let bucket_ts = unit.bucket_start(trade.created_at);
        match candles.last_mut() {
            Some(last) if last.timestamp == bucket_ts => {
                last.apply_trade(trade.price, trade.volume, trade.created_at);
            }
            _ => {
                candles.push(Candle::new(
                    pair,
                    unit,
                    bucket_ts,
                    trade.created_at,
                    trade.price,
                    trade.volume,
                    trade.quote_volume(),
                ));
            }
        }
    }
    candles
}

/// Merge a chronologically-ordered list of candle fragments into one,
/// combining OHLCV the way `Candle::merge` does pairwise. Used both for gap
/// repair (merging synthesized fragments onto the last persisted candle) and
/// for the rolling daily view (§4.5's "combine at most three fragments").
pub fn merge_fragments(mut fragments: Vec<Candle>) -> Option<Candle> {
    if fragments.is_empty() {
        return None;
    }
    let mut merged = fragments.remove(0);
    for fragment in fragments {
        merged.merge(&fragment);
    }
    Some(merged)
}

/// The rolling 24h view: the caller fetches at most three 1-minute
/// fragments (yesterday's boundary bucket, a fully-contained middle window
/// already pre-aggregated over 1-minute candles, and today's boundary
/// bucket) and this merges whichever of them exist, in chronological order.
pub fn daily_view(
    yesterday_boundary: Option<Candle>,
    middle_window: Option<Candle>,
    today_boundary: Option<Candle>,
) -> Option<Candle> {
    let fragments: Vec<Candle> = [yesterday_boundary, middle_window, today_boundary]
        .into_iter()
        .flatten()
        .collect();
    merge_fragments(fragments)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::*;
    use crate::model::OrderSide;

    fn pair() -> Pair {
        Pair::new("BTC", "USDT")
    }

    fn trade_at(ts: DateTime<Utc>, price: rust_decimal::Decimal, volume: rust_decimal::Decimal) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            created_at: ts,
            base_currency: "BTC".to_string(),
            quote_currency: "USDT".to_string(),
            buy_order_id: Uuid::new_v4(),
            sell_order_id: Uuid::new_v4(),
            side: OrderSide::Buy,
            volume,
            price,
            index: 0,
        }
    }

    /// S4: a trade at 12:00:30 opens the 12:00 one-minute bucket; a trade at
    /// 12:01:05 rolls it over, closing 12:00 and opening 12:01.
    #[test]
    fn one_minute_candle_rolls_over_on_bucket_boundary() {
        let mut aggregator = CandleAggregator::new(pair(), DEFAULT_FLUSH_EVERY);
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 5).unwrap();

        let persisted_first = aggregator.apply_trade(&trade_at(t1, dec!(10), dec!(1)), t1);
        assert_eq!(persisted_first.len(), AVAILABLE_CANDLE_UNITS.len());

        let one_min = aggregator.open_candle(CandleUnit(1)).unwrap();
        assert_eq!(one_min.open, dec!(10));
        assert_eq!(one_min.close, dec!(10));
        assert_eq!(one_min.volume, dec!(1));
        assert_eq!(one_min.quote_volume, dec!(10));

        let persisted_second = aggregator.apply_trade(&trade_at(t2, dec!(11), dec!(2)), t2);
        // the 1-minute bucket rolled: its closed final state plus the fresh
        // bucket are both flushed; wider buckets (3m and up) stay open.
        let rolled: Vec<_> = persisted_second
            .iter()
            .filter(|c| c.unit_key() == CandleUnit(1))
            .collect();
        assert_eq!(rolled.len(), 2);
        assert_eq!(rolled[0].close, dec!(10));
        assert_eq!(rolled[0].volume, dec!(1));
        assert_eq!(rolled[1].open, dec!(11));
        assert_eq!(rolled[1].volume, dec!(2));
        assert_eq!(rolled[1].quote_volume, dec!(22));

        let now_open = aggregator.open_candle(CandleUnit(1)).unwrap();
        assert_eq!(now_open.open, dec!(11));
        assert_eq!(now_open.high, dec!(11));
        assert_eq!(now_open.low, dec!(11));
        assert_eq!(now_open.volume, dec!(2));
    }

    #[test]
    fn flush_every_bounds_in_place_update_write_amplification() {
        let mut aggregator = CandleAggregator::new(pair(), 2);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let first = aggregator.apply_trade(&trade_at(t0, dec!(10), dec!(1)), t0);
        assert!(!first.is_empty());
        let second = aggregator.apply_trade(&trade_at(t0, dec!(10), dec!(1)), t0);
        assert!(second.iter().all(|c| c.unit_key() != CandleUnit(1)));
        let third = aggregator.apply_trade(&trade_at(t0, dec!(10), dec!(1)), t0);
        assert!(third.iter().any(|c| c.unit_key() == CandleUnit(1)));
    }

    #[test]
    fn merge_fragments_combines_ohlcv_in_chronological_order() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let early = Candle::new(&pair(), CandleUnit(1440), t0, t0, dec!(10), dec!(1), dec!(10));
        let mut later = Candle::new(&pair(), CandleUnit(1440), t0, t1, dec!(8), dec!(2), dec!(16));
        later.high = dec!(12);

        let merged = merge_fragments(vec![early, later]).unwrap();
        assert_eq!(merged.open, dec!(10));
        assert_eq!(merged.close, dec!(8));
        assert_eq!(merged.high, dec!(12));
        assert_eq!(merged.low, dec!(8));
        assert_eq!(merged.volume, dec!(3));
        assert_eq!(merged.quote_volume, dec!(26));
    }

    #[test]
    fn synthesize_from_trades_groups_by_bucket() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 45).unwrap();
        let t3 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 5).unwrap();
        let trades = vec![
            trade_at(t1, dec!(10), dec!(1)),
            trade_at(t2, dec!(12), dec!(1)),
            trade_at(t3, dec!(11), dec!(2)),
        ];

        let candles = synthesize_from_trades(&pair(), CandleUnit(1), &trades);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].volume, dec!(2));
        assert_eq!(candles[0].high, dec!(12));
        assert_eq!(candles[1].volume, dec!(2));
    }

    #[test]
    fn daily_view_merges_only_the_fragments_present() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let middle = Candle::new(&pair(), CandleUnit(1440), t0, t0, dec!(10), dec!(5), dec!(50));

        let view = daily_view(None, Some(middle.clone()), None).unwrap();
        assert_eq!(view.volume, dec!(5));
    }

    /// A worker applies trades to a cloned aggregator and only swaps it into
    /// place once the matching database writes commit; that depends on the
    /// clone being a true deep copy, not a shared handle.
    #[test]
    fn cloned_aggregator_is_independent_of_the_original() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut original = CandleAggregator::new(pair(), DEFAULT_FLUSH_EVERY);
        original.apply_trade(&trade_at(t0, dec!(10), dec!(1)), t0);

        let mut speculative = original.clone();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap();
        speculative.apply_trade(&trade_at(t1, dec!(20), dec!(3)), t1);

        let original_one_min = original.open_candle(CandleUnit(1)).unwrap();
        assert_eq!(original_one_min.close, dec!(10));
        assert_eq!(original_one_min.volume, dec!(1));

        let speculative_one_min = speculative.open_candle(CandleUnit(1)).unwrap();
        assert_eq!(speculative_one_min.close, dec!(20));
        assert_eq!(speculative_one_min.volume, dec!(4));
    }
}
