use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use super::Pair;

/// Minute buckets the candle aggregator maintains one open candle for.
pub const AVAILABLE_CANDLE_UNITS: [u32; 10] =
    [1, 3, 5, 15, 30, 60, 240, 1440, 4320, 10080];

/// A minute-bucket width; `CandleUnitType::tick` from the original source is
/// not reachable from any trade feed this engine owns and is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CandleUnit(pub u32);

impl CandleUnit {
    pub fn duration(self) -> Duration {
        Duration::minutes(self.0 as i64)
    }

    /// Floor `at` to this bucket's boundary.
    pub fn bucket_start(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.0 as i64 * 60;
        let epoch = at.timestamp();
        let floored = epoch - epoch.rem_euclid(width);
        DateTime::from_timestamp(floored, 0).expect("valid bucket timestamp")
    }
}

/// One OHLCV bar. `open/high/low/close/volume/quote_volume` are all strictly
/// positive (`ck_candle_positive`): matching the matcher's invariant that
/// every trade has `volume > 0`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Candle {
    pub base_currency: String,
    pub quote_currency: String,
    pub unit: i32,
    pub timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
}

impl Candle {
    pub fn pair(&self) -> Pair {
        Pair::new(self.base_currency.clone(), self.quote_currency.clone())
    }

    pub fn unit_key(&self) -> CandleUnit {
        CandleUnit(self.unit as u32)
    }

    pub fn next_timestamp(&self) -> DateTime<Utc> {
        self.timestamp + self.unit_key().duration()
    }

    pub fn new(
        pair: &Pair,
        unit: CandleUnit,
        timestamp: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        price: Decimal,
        volume: Decimal,
        quote_volume: Decimal,
    ) -> Self {
        Self {
            base_currency: pair.base.clone(),
            quote_currency: pair.quote.clone(),
            unit: unit.0 as i32,
            timestamp,
            updated_at,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            quote_volume,
        }
    }

    /// Fold one trade into this open candle in place.
    pub fn apply_trade(&mut self, price: Decimal, volume: Decimal, at: DateTime<Utc>) {
        debug_assert!(at >= self.updated_at);
        self.close = price;
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.volume += volume;
        self.quote_volume += price * volume;
        self.updated_at = at;
    }

    /// Merge a later, adjacent candle's data into this one (gap-repair and
    /// daily-view aggregation).
    pub fn merge(&mut self, other: &Candle) {
        if other.high > self.high {
            self.high = other.high;
        }
        if other.low < self.low {
            self.low = other.low;
        }
        self.close = other.close;
        self.volume += other.volume;
        self.quote_volume += other.quote_volume;
        debug_assert!(other.updated_at >= self.updated_at);
        self.updated_at = other.updated_at;
    }
}
