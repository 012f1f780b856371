use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::notional;

use super::Pair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The opposite side of the book this order matches against.
    pub fn opposite(self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// `true` once `resting_price` is no longer reachable by an order of
    /// this side quoted at `incoming_price` (the matcher's stop condition).
    pub fn price_exceeds(self, resting_price: Decimal, incoming_price: Decimal) -> bool {
        match self {
            OrderSide::Buy => resting_price > incoming_price,
            OrderSide::Sell => resting_price < incoming_price,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// A resting or filled/canceled order.
///
/// `filled_at` is set iff `remaining_volume == 0`; `canceled_at` implies
/// `remaining_volume > 0` at the moment of cancellation. Only the intake path
/// creates orders; only the engine mutates `remaining_volume`, `filled_at`
/// and `canceled_at` (`pending -> active -> {filled, canceled}`, terminal).
#[derive(Debug, Clone)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub side: OrderSide,
    pub base_currency: String,
    pub quote_currency: String,
    pub volume: Decimal,
    pub remaining_volume: Decimal,
    pub price: Decimal,
    pub filled_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn pair(&self) -> Pair {
        Pair::new(self.base_currency.clone(), self.quote_currency.clone())
    }

    pub fn is_active(&self) -> bool {
        self.filled_at.is_none() && self.canceled_at.is_none()
    }

    /// The currency whose balance must be locked to back this order: quote
    /// for buys, base for sells.
    pub fn locking_currency(&self) -> &str {
        match self.side {
            OrderSide::Buy => &self.quote_currency,
            OrderSide::Sell => &self.base_currency,
        }
    }

    /// The amount of `locking_currency` still locked by this order's
    /// remaining volume: `remaining_volume * price` for buys,
    /// `remaining_volume` for sells.
    pub fn remaining_locked_amount(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => notional(self.remaining_volume, self.price),
            OrderSide::Sell => self.remaining_volume,
        }
    }

    pub fn mark_filled(&mut self, at: DateTime<Utc>) {
        self.remaining_volume = Decimal::ZERO;
        self.filled_at = Some(at);
    }

    pub fn mark_canceled(&mut self, at: DateTime<Utc>) {
        self.canceled_at = Some(at);
    }
}
