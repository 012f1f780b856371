use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::decimal::notional;

use super::{order::OrderSide, Pair};

/// An append-only fill. `side` is the aggressor (taker) side; price is
/// always the maker's resting price.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub base_currency: String,
    pub quote_currency: String,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub side: OrderSide,
    pub volume: Decimal,
    pub price: Decimal,
    /// Monotonic counter starting at 0, scoped to one matcher invocation.
    pub index: i32,
}

impl Trade {
    pub fn pair(&self) -> Pair {
        Pair::new(self.base_currency.clone(), self.quote_currency.clone())
    }

    pub fn quote_volume(&self) -> Decimal {
        notional(self.volume, self.price)
    }
}
